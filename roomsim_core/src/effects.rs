//! Timed effects attached to entities by ability resolution.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityStore};

/// Numeric stat modifiers carried by an effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatModifiers {
    /// Multiplies movement speed (0.5 = half speed)
    pub speed_multiplier: Option<f64>,
}

/// Effect declared on an ability action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectSpec {
    /// Effect kind tag, e.g. `slow`
    pub kind: String,

    pub duration_ms: u64,

    #[serde(default)]
    pub modifiers: StatModifiers,
}

/// An effect attached to a target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEffect {
    pub id: String,
    pub kind: String,
    pub source_entity_id: EntityId,
    pub applied_at_ms: u64,
    pub duration_ms: u64,
    pub modifiers: StatModifiers,
}

impl ActiveEffect {
    pub fn expires_at_ms(&self) -> u64 {
        self.applied_at_ms.saturating_add(self.duration_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// An effect removed by the expiration sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredEffect {
    pub entity_id: EntityId,
    pub effect: ActiveEffect,
}

/// Removes every effect whose duration has elapsed.
///
/// Linear over all entities and their effects.
pub fn process_effect_expirations(entities: &mut EntityStore, now_ms: u64) -> Vec<ExpiredEffect> {
    let mut expired = Vec::new();
    for entity in entities.iter_mut() {
        if entity.effects.is_empty() {
            continue;
        }
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entity.effects)
            .into_iter()
            .partition(|e| e.is_expired(now_ms));
        entity.effects = kept;
        expired.extend(gone.into_iter().map(|effect| ExpiredEffect {
            entity_id: entity.id.clone(),
            effect,
        }));
    }
    expired
}
