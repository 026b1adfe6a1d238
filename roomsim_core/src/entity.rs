//! Shared entity store for a room.
//!
//! Holds position, velocity and active effects per entity. The cast engine
//! reads positions for range checks and writes effects on resolution; the
//! movement phase integrates velocity scaled by effect modifiers.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::effects::ActiveEffect;

/// Entity identifier (player session, agent id or NPC id).
pub type EntityId = String;

/// What kind of participant an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Agent,
    Npc,
}

/// A live entity in the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,

    pub kind: EntityKind,

    /// Position in world pixel units
    pub position: Vector2<f64>,

    /// Velocity in units/second, before effect modifiers
    pub velocity: Vector2<f64>,

    /// Effects currently attached (slows, hastes, ...)
    pub effects: Vec<ActiveEffect>,
}

impl Entity {
    /// Creates a stationary entity at the given position.
    pub fn new(id: impl Into<EntityId>, kind: EntityKind, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            position: Vector2::new(x, y),
            velocity: Vector2::zeros(),
            effects: Vec::new(),
        }
    }

    /// Product of every active speed multiplier (1.0 with no effects).
    pub fn effective_speed_multiplier(&self) -> f64 {
        self.effects
            .iter()
            .filter_map(|e| e.modifiers.speed_multiplier)
            .product()
    }

    pub fn distance_to(&self, other: &Entity) -> f64 {
        (self.position - other.position).norm()
    }
}

/// All entities in a room, keyed by id.
///
/// Iteration is in id order so every tick phase visits entities
/// deterministically.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: BTreeMap<EntityId, Entity>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity. Returns the previous one, if any.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.id.clone(), entity)
    }

    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        self.entities.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    /// Euclidean distance between two entities, if both exist.
    pub fn distance(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.get(a)?.distance_to(self.get(b)?))
    }

    /// Total effects attached across all entities.
    pub fn active_effect_count(&self) -> usize {
        self.entities.values().map(|e| e.effects.len()).sum()
    }

    /// Movement integration: `position += velocity * speed_multiplier * dt`.
    ///
    /// Returns the number of entities that moved.
    pub fn integrate_movement(&mut self, dt_secs: f64) -> usize {
        let mut moved = 0;
        for entity in self.entities.values_mut() {
            if entity.velocity == Vector2::zeros() {
                continue;
            }
            let scale = entity.effective_speed_multiplier() * dt_secs;
            entity.position += entity.velocity * scale;
            moved += 1;
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{ActiveEffect, StatModifiers};
    use approx::assert_relative_eq;

    fn slow(id: &str, multiplier: f64) -> ActiveEffect {
        ActiveEffect {
            id: id.to_string(),
            kind: "slow".to_string(),
            source_entity_id: "caster".to_string(),
            applied_at_ms: 0,
            duration_ms: 1_000,
            modifiers: StatModifiers {
                speed_multiplier: Some(multiplier),
            },
        }
    }

    #[test]
    fn test_distance_between_entities() {
        let mut store = EntityStore::new();
        store.insert(Entity::new("a", EntityKind::Player, 0.0, 0.0));
        store.insert(Entity::new("b", EntityKind::Agent, 30.0, 40.0));
        assert_relative_eq!(store.distance("a", "b").unwrap(), 50.0);
        assert_eq!(store.distance("a", "ghost"), None);
    }

    #[test]
    fn test_speed_multipliers_compose() {
        let mut e = Entity::new("a", EntityKind::Player, 0.0, 0.0);
        assert_relative_eq!(e.effective_speed_multiplier(), 1.0);
        e.effects.push(slow("fx_1", 0.5));
        e.effects.push(slow("fx_2", 0.5));
        assert_relative_eq!(e.effective_speed_multiplier(), 0.25);
    }

    #[test]
    fn test_integrate_movement_applies_effects() {
        let mut store = EntityStore::new();
        let mut runner = Entity::new("runner", EntityKind::Player, 0.0, 0.0);
        runner.velocity = Vector2::new(100.0, 0.0);
        runner.effects.push(slow("fx_1", 0.5));
        store.insert(runner);
        store.insert(Entity::new("idle", EntityKind::Npc, 5.0, 5.0));

        let moved = store.integrate_movement(0.1);
        assert_eq!(moved, 1);
        assert_relative_eq!(store.get("runner").unwrap().position.x, 5.0);
        assert_relative_eq!(store.get("idle").unwrap().position.x, 5.0);
    }

    #[test]
    fn test_ids_iterate_in_order() {
        let mut store = EntityStore::new();
        for id in ["c", "a", "b"] {
            store.insert(Entity::new(id, EntityKind::Agent, 0.0, 0.0));
        }
        let ids: Vec<&str> = store.ids().map(String::as_str).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
