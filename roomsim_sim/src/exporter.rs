//! JSON exporter for offline inspection of a scenario's event history.

use roomsim_core::{EventEnvelope, Room};
use roomsim_env::RoomId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

use crate::context::SimContext;
use crate::world::SimWorld;

/// One room's retained history and totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomExport {
    pub room_id: RoomId,
    pub name: String,
    pub ticks: u64,
    pub overruns: u64,
    pub events_appended: u64,
    pub events_evicted: u64,

    /// Retained envelopes, oldest first
    pub events: Vec<EventEnvelope>,
}

impl RoomExport {
    pub fn from_room(room: &Room<SimContext>) -> Self {
        Self {
            room_id: room.room_id(),
            name: room.config().name.clone(),
            ticks: room.metrics().ticks(),
            overruns: room.metrics().overruns(),
            events_appended: room.events().total_appended(),
            events_evicted: room.events().evicted_total(),
            events: room.events().iter().cloned().collect(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub duration_sec: f64,
    pub rooms: Vec<RoomExport>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            rooms: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Captures every room in the world.
    pub fn capture(&mut self, world: &SimWorld) {
        self.duration_sec = world.time();
        self.rooms = world.rooms().map(RoomExport::from_room).collect();
    }

    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimConfig;
    use roomsim_core::{Entity, EntityKind, RoomConfig};

    #[test]
    fn test_capture_serializes_envelopes() {
        let mut world = SimWorld::new(SimConfig::default());
        let id = world.add_room(RoomConfig::default().with_name("lobby")).unwrap();
        world
            .room_mut(id)
            .unwrap()
            .join(Entity::new("alice", EntityKind::Player, 1.0, 1.0));
        world.tick();

        let mut export = SimExport::new("test", 42);
        export.capture(&world);
        export.finalize(true, None);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["rooms"][0]["name"], "lobby");
        assert_eq!(json["rooms"][0]["events"][0]["type"], "presence.join");
        assert_eq!(json["rooms"][0]["events"][0]["cursor"], "c_1");
        assert!(json.get("failure_reason").is_none());
    }
}
