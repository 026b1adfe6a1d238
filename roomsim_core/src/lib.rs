//! RoomSim Core - Authoritative Per-Room World Simulation
//!
//! Each room owns its own state and advances it on a fixed-rate tick:
//! 1. **Zones**: rectangle membership with paired exit/enter transitions
//! 2. **Abilities**: validated, rate-limited casts that resolve in later ticks
//! 3. **Event Log**: bounded, cursor-addressable history for pollers
//!
//! Time always comes from a [`roomsim_env::RoomContext`], so the same room
//! runs under Tokio or a virtual clock.

pub mod abilities;
pub mod casting;
pub mod effects;
pub mod entity;
pub mod event_log;
pub mod handle;
pub mod metrics;
pub mod outcome;
pub mod proximity;
pub mod room;
pub mod zones;

// Re-export key types for convenience
pub use abilities::{AbilityAction, AbilityDefinition, AbilityRegistry, AgentAbilityState};
pub use casting::{ActionContext, ActionHandler, CastConfig, CastEngine, CastResolution, InvokeParams, PendingCast};
pub use effects::{ActiveEffect, EffectSpec, StatModifiers};
pub use entity::{Entity, EntityId, EntityKind, EntityStore};
pub use event_log::{EventCursor, EventEnvelope, EventLog, EventLogConfig, EventPage, EventType};
pub use handle::{RoomCommand, RoomHandle};
pub use metrics::{RoomMetrics, TickMetrics};
pub use outcome::{ActionOutcome, CastRejection};
pub use room::{Room, RoomConfig, RoomError};
pub use zones::{Zone, ZoneId, ZoneTracker, ZoneTransition, ZoneUpdate};
