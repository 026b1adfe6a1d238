//! Room Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing a room's tick
//! loop to run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept
//!
//! A room never reads the clock or sleeps on its own. Time (`now()`,
//! `system_time()`, `sleep()`) and task spawning go through
//! [`RoomContext`], so a simulated context makes every cooldown, cast
//! completion and retention window reproducible.
//!
//! # Example
//!
//! ```ignore
//! use roomsim_env::RoomContext;
//!
//! async fn room_loop<Ctx: RoomContext>(ctx: &Ctx) {
//!     loop {
//!         tick();
//!         ctx.sleep(Duration::from_millis(50)).await;
//!     }
//! }
//! ```

mod context;
mod tokio_impl;
mod types;

pub use context::RoomContext;
pub use tokio_impl::TokioContext;
pub use types::RoomId;
