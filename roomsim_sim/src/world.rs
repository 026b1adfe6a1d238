//! SimWorld - several independent rooms on one virtual clock.

use crate::context::SimContext;

use roomsim_core::{Room, RoomConfig, RoomError, TickMetrics};
use roomsim_env::{RoomContext, RoomId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Tick rate in Hz, shared by every room in the world
    pub tick_rate_hz: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_rate_hz: 20,
        }
    }
}

/// Container for every room in a simulation.
///
/// Rooms share a clock but nothing else: each owns its entities, zones,
/// casts and event log.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    rooms: BTreeMap<RoomId, Room<SimContext>>,

    tick_count: u64,
}

impl SimWorld {
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        Self {
            config,
            context,
            rooms: BTreeMap::new(),
            tick_count: 0,
        }
    }

    /// Adds a room. Its tick rate is forced to the world's.
    pub fn add_room(&mut self, config: RoomConfig) -> Result<RoomId, RoomError> {
        let index = self.rooms.len() as u64;
        let room_id = RoomId::for_world(self.config.seed, index);
        let config = config.with_tick_rate(self.config.tick_rate_hz);
        let room = Room::new(room_id, self.context.clone(), config)?;
        self.rooms.insert(room_id, room);
        Ok(room_id)
    }

    pub fn room(&self, room_id: RoomId) -> Option<&Room<SimContext>> {
        self.rooms.get(&room_id)
    }

    pub fn room_mut(&mut self, room_id: RoomId) -> Option<&mut Room<SimContext>> {
        self.rooms.get_mut(&room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room<SimContext>> {
        self.rooms.values()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.config.tick_rate_hz.max(1) as u64)
    }

    /// Advances the clock by one tick, then ticks every room in id order.
    pub fn tick(&mut self) -> Vec<(RoomId, TickMetrics)> {
        self.context.advance_time(self.tick_interval());
        self.tick_count += 1;

        let mut out = Vec::with_capacity(self.rooms.len());
        for (room_id, room) in self.rooms.iter_mut() {
            let metrics = room.tick();
            room.maybe_cleanup();
            out.push((*room_id, metrics));
        }
        debug!(tick = self.tick_count, rooms = out.len(), "world tick");
        out
    }

    pub fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Ticks needed to cover `ms` of virtual time, rounded up.
    pub fn ticks_for_ms(&self, ms: u64) -> u64 {
        let interval_ms = self.tick_interval().as_millis().max(1) as u64;
        ms.div_ceil(interval_ms)
    }

    /// Current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
