//! Pairwise proximity tracking.
//!
//! Reconciled in the same tick phase as zones: every unordered pair of
//! entities closer than the configured radius is "near". Pair ids are
//! stored sorted so `(a, b)` and `(b, a)` are one pair.

use std::collections::BTreeSet;

use crate::entity::{EntityId, EntityStore};

/// A change in pair proximity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProximityChange {
    Enter { a: EntityId, b: EntityId },
    Exit { a: EntityId, b: EntityId },
}

#[derive(Debug, Clone)]
pub struct ProximityTracker {
    radius: f64,
    near: BTreeSet<(EntityId, EntityId)>,
}

impl ProximityTracker {
    pub fn new(radius: f64) -> Self {
        Self {
            radius,
            near: BTreeSet::new(),
        }
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Recomputes near pairs. Exits are reported before enters, each in
    /// pair order.
    pub fn reconcile(&mut self, entities: &EntityStore) -> Vec<ProximityChange> {
        let all: Vec<_> = entities.iter().collect();
        let mut now_near = BTreeSet::new();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                if a.distance_to(b) <= self.radius {
                    now_near.insert((a.id.clone(), b.id.clone()));
                }
            }
        }

        let mut changes: Vec<ProximityChange> = self
            .near
            .difference(&now_near)
            .map(|(a, b)| ProximityChange::Exit {
                a: a.clone(),
                b: b.clone(),
            })
            .collect();
        changes.extend(now_near.difference(&self.near).map(|(a, b)| ProximityChange::Enter {
            a: a.clone(),
            b: b.clone(),
        }));

        self.near = now_near;
        changes
    }

    /// Drops every pair containing `id`, returning the exits in pair order.
    pub fn remove_entity(&mut self, id: &str) -> Vec<ProximityChange> {
        let (gone, kept): (BTreeSet<_>, BTreeSet<_>) = std::mem::take(&mut self.near)
            .into_iter()
            .partition(|(a, b)| a == id || b == id);
        self.near = kept;
        gone.into_iter()
            .map(|(a, b)| ProximityChange::Exit { a, b })
            .collect()
    }

    pub fn is_near(&self, a: &str, b: &str) -> bool {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.near.contains(&key)
    }

    /// Entities currently near `id`, sorted.
    pub fn neighbours(&self, id: &str) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self
            .near
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        out
    }

    pub fn pair_count(&self) -> usize {
        self.near.len()
    }
}
