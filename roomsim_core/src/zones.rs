//! The Zone Tracker - rectangular zone membership and transition events.
//!
//! Zones are axis-aligned rectangles in world pixel units, supplied by the
//! world pack at room construction. Containment is half-open on both axes:
//! `[x, x + width) × [y, y + height)`.
//!
//! When rectangles overlap, the containing zone with the smallest area
//! wins; equal areas fall back to the supplied order. For the
//! non-overlapping sets world packs ship, this is plain first-match.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::entity::EntityId;

/// Zone identifier as named by the world pack.
pub type ZoneId = String;

/// Axis-aligned rectangle in world pixel units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ZoneRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Half-open containment: inclusive min, exclusive max.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn overlaps(&self, other: &ZoneRect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// A named rectangular region of the world map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    #[serde(flatten)]
    pub bounds: ZoneRect,
}

impl Zone {
    pub fn new(id: impl Into<ZoneId>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: id.into(),
            bounds: ZoneRect::new(x, y, width, height),
        }
    }
}

/// Malformed zone configuration. Fatal at room construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZoneConfigError {
    #[error("zone id must not be empty")]
    EmptyId,

    #[error("duplicate zone id: {0}")]
    DuplicateId(ZoneId),

    #[error("zone {id} has invalid bounds ({width} x {height})")]
    InvalidBounds { id: ZoneId, width: f64, height: f64 },
}

/// Result of reconciling one entity's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneUpdate {
    pub previous_zone: Option<ZoneId>,
    pub current_zone: Option<ZoneId>,
    pub changed: bool,
}

/// A zone boundary crossing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneTransition {
    Exit {
        entity_id: EntityId,
        zone_id: ZoneId,
        next_zone_id: Option<ZoneId>,
    },
    Enter {
        entity_id: EntityId,
        zone_id: ZoneId,
        previous_zone_id: Option<ZoneId>,
    },
}

/// Receives zone transitions as they happen.
pub trait ZoneEventSink {
    fn emit(&mut self, transition: ZoneTransition);
}

impl ZoneEventSink for Vec<ZoneTransition> {
    fn emit(&mut self, transition: ZoneTransition) {
        self.push(transition);
    }
}

/// Tracks which zone each entity occupies.
#[derive(Debug, Clone, Default)]
pub struct ZoneTracker {
    /// Zones in world-pack order
    zones: Vec<Zone>,

    /// entity -> current zone (absent = tracked in no zone, or untracked)
    entity_zones: BTreeMap<EntityId, Option<ZoneId>>,

    /// zone -> members
    members: BTreeMap<ZoneId, BTreeSet<EntityId>>,
}

impl ZoneTracker {
    /// Builds a tracker over a validated zone set.
    pub fn new(zones: Vec<Zone>) -> Result<Self, ZoneConfigError> {
        let mut seen = HashSet::new();
        for zone in &zones {
            if zone.id.is_empty() {
                return Err(ZoneConfigError::EmptyId);
            }
            let b = zone.bounds;
            let finite = [b.x, b.y, b.width, b.height].iter().all(|v| v.is_finite());
            if !finite || b.width <= 0.0 || b.height <= 0.0 {
                return Err(ZoneConfigError::InvalidBounds {
                    id: zone.id.clone(),
                    width: b.width,
                    height: b.height,
                });
            }
            if !seen.insert(zone.id.clone()) {
                return Err(ZoneConfigError::DuplicateId(zone.id.clone()));
            }
        }

        for (a, b) in overlapping_pairs(&zones) {
            warn!(zone_a = %a, zone_b = %b, "zones overlap; smallest area wins");
        }

        let members = zones
            .iter()
            .map(|z| (z.id.clone(), BTreeSet::new()))
            .collect();

        Ok(Self {
            zones,
            entity_zones: BTreeMap::new(),
            members,
        })
    }

    /// Returns the zone containing `(x, y)`, or `None`.
    pub fn detect_zone(&self, x: f64, y: f64) -> Option<&ZoneId> {
        let mut best: Option<&Zone> = None;
        for zone in &self.zones {
            if !zone.bounds.contains(x, y) {
                continue;
            }
            match best {
                Some(b) if b.bounds.area() <= zone.bounds.area() => {}
                _ => best = Some(zone),
            }
        }
        best.map(|z| &z.id)
    }

    /// Reconciles one entity against its new position.
    ///
    /// On a change the exit (if any) is emitted before the enter (if any).
    pub fn update_entity_zone(
        &mut self,
        entity_id: &str,
        x: f64,
        y: f64,
        sink: Option<&mut dyn ZoneEventSink>,
    ) -> ZoneUpdate {
        let current_zone = self.detect_zone(x, y).cloned();
        let previous_zone = self.entity_zones.get(entity_id).cloned().flatten();
        let changed = previous_zone != current_zone;

        if changed {
            self.transition(entity_id, previous_zone.as_ref(), current_zone.as_ref(), sink);
        }
        self.entity_zones
            .insert(entity_id.to_string(), current_zone.clone());

        ZoneUpdate {
            previous_zone,
            current_zone,
            changed,
        }
    }

    /// Stops tracking an entity, emitting an exit with no next zone.
    ///
    /// Returns the zone the entity was in.
    pub fn remove_entity(
        &mut self,
        entity_id: &str,
        sink: Option<&mut dyn ZoneEventSink>,
    ) -> Option<ZoneId> {
        let previous = self.entity_zones.remove(entity_id).flatten();
        if previous.is_some() {
            self.transition(entity_id, previous.as_ref(), None, sink);
        }
        previous
    }

    /// Reconciles every present entity and evicts bookkeeping for tracked
    /// entities that are no longer present.
    ///
    /// Returns the number of entities whose zone changed.
    pub fn update<'a, I>(&mut self, entities: I, mut sink: Option<&mut dyn ZoneEventSink>) -> usize
    where
        I: IntoIterator<Item = (&'a str, f64, f64)>,
    {
        let mut present = BTreeSet::new();
        let mut changed = 0;

        for (id, x, y) in entities {
            present.insert(id.to_string());
            let reborrowed = sink.as_mut().map(|s| &mut **s as &mut dyn ZoneEventSink);
            if self.update_entity_zone(id, x, y, reborrowed).changed {
                changed += 1;
            }
        }

        let gone: Vec<EntityId> = self
            .entity_zones
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            let reborrowed = sink.as_mut().map(|s| &mut **s as &mut dyn ZoneEventSink);
            if self.remove_entity(&id, reborrowed).is_some() {
                changed += 1;
            }
        }

        changed
    }

    /// Current zone of an entity (`None` when outside every zone or untracked).
    pub fn get_entity_zone(&self, entity_id: &str) -> Option<&ZoneId> {
        self.entity_zones.get(entity_id).and_then(|z| z.as_ref())
    }

    /// Number of entities in a zone (0 for unknown zones).
    pub fn get_zone_population(&self, zone_id: &str) -> usize {
        self.members.get(zone_id).map_or(0, BTreeSet::len)
    }

    /// Entities in a zone, sorted by id.
    pub fn get_entities_in_zone(&self, zone_id: &str) -> Vec<EntityId> {
        self.members
            .get(zone_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_zone_bounds(&self, zone_id: &str) -> Option<&ZoneRect> {
        self.zones.iter().find(|z| z.id == zone_id).map(|z| &z.bounds)
    }

    /// Zone ids in world-pack order.
    pub fn get_zone_ids(&self) -> Vec<ZoneId> {
        self.zones.iter().map(|z| z.id.clone()).collect()
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn tracked_count(&self) -> usize {
        self.entity_zones.len()
    }

    fn transition(
        &mut self,
        entity_id: &str,
        from: Option<&ZoneId>,
        to: Option<&ZoneId>,
        mut sink: Option<&mut dyn ZoneEventSink>,
    ) {
        debug!(entity = entity_id, from = ?from, to = ?to, "zone transition");

        if let Some(prev) = from {
            if let Some(set) = self.members.get_mut(prev) {
                set.remove(entity_id);
            }
            if let Some(s) = sink.as_mut() {
                s.emit(ZoneTransition::Exit {
                    entity_id: entity_id.to_string(),
                    zone_id: prev.clone(),
                    next_zone_id: to.cloned(),
                });
            }
        }

        if let Some(next) = to {
            self.members
                .entry(next.clone())
                .or_default()
                .insert(entity_id.to_string());
            if let Some(s) = sink.as_mut() {
                s.emit(ZoneTransition::Enter {
                    entity_id: entity_id.to_string(),
                    zone_id: next.clone(),
                    previous_zone_id: from.cloned(),
                });
            }
        }
    }
}

/// All pairs of zone ids whose rectangles overlap.
pub fn overlapping_pairs(zones: &[Zone]) -> Vec<(ZoneId, ZoneId)> {
    let mut pairs = Vec::new();
    for (i, a) in zones.iter().enumerate() {
        for b in &zones[i + 1..] {
            if a.bounds.overlaps(&b.bounds) {
                pairs.push((a.id.clone(), b.id.clone()));
            }
        }
    }
    pairs
}
