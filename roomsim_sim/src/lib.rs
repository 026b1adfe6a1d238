//! RoomSim Deterministic Simulation Harness
//!
//! Runs rooms on a virtual clock so every time-dependent rule (cast
//! completion, cooldowns, effect expiry, rate windows, log retention) can be
//! exercised without real waiting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded ChaCha8 RNG)      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │  Room   │              │  Room   │     ...               │
//! │  │ "north" │  (isolated)  │ "south" │                       │
//! │  └─────────┘              └─────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use roomsim_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::SlowAura);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{RoomExport, SimExport};
pub use runner::{ScenarioError, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld};
