//! Ability definitions and per-agent installation state.
//!
//! Both tables are plain state owned by the room: the registry maps ability
//! id to its immutable definition, the install table maps
//! (agent, ability) to an installation record.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::effects::EffectSpec;
use crate::entity::EntityId;

/// One invocable action of an ability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityAction {
    pub id: String,

    #[serde(default)]
    pub cooldown_ms: Option<u64>,

    #[serde(default)]
    pub cast_time_ms: Option<u64>,

    /// Maximum source-target distance; `None` means unlimited
    #[serde(default)]
    pub range_units: Option<f64>,

    #[serde(default)]
    pub effect: Option<EffectSpec>,
}

impl AbilityAction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cooldown_ms: None,
            cast_time_ms: None,
            range_units: None,
            effect: None,
        }
    }

    pub fn with_cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = Some(ms);
        self
    }

    pub fn with_cast_time_ms(mut self, ms: u64) -> Self {
        self.cast_time_ms = Some(ms);
        self
    }

    pub fn with_range(mut self, units: f64) -> Self {
        self.range_units = Some(units);
        self
    }

    pub fn with_effect(mut self, effect: EffectSpec) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Cooldown in ms, zero when absent.
    pub fn cooldown(&self) -> u64 {
        self.cooldown_ms.unwrap_or(0)
    }

    /// Cast time in ms, zero (instant) when absent.
    pub fn cast_time(&self) -> u64 {
        self.cast_time_ms.unwrap_or(0)
    }

    /// Whether `distance` is within range. Unlimited and non-finite ranges
    /// accept any distance.
    pub fn in_range(&self, distance: f64) -> bool {
        match self.range_units {
            Some(range) if range.is_finite() => distance <= range,
            _ => true,
        }
    }
}

/// An ability as registered at room startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub actions: Vec<AbilityAction>,
}

impl AbilityDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: AbilityAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn action(&self, action_id: &str) -> Option<&AbilityAction> {
        self.actions.iter().find(|a| a.id == action_id)
    }
}

/// Malformed ability definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbilityRegistryError {
    #[error("ability id must not be empty")]
    EmptyId,

    #[error("ability {ability_id} declares action {action_id} more than once")]
    DuplicateAction { ability_id: String, action_id: String },
}

/// Registry of ability definitions, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct AbilityRegistry {
    definitions: BTreeMap<String, AbilityDefinition>,
}

impl AbilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, replacing any previous one with the same id.
    pub fn register(&mut self, def: AbilityDefinition) -> Result<(), AbilityRegistryError> {
        if def.id.is_empty() {
            return Err(AbilityRegistryError::EmptyId);
        }
        let mut seen = HashSet::new();
        for action in &def.actions {
            if !seen.insert(action.id.as_str()) {
                return Err(AbilityRegistryError::DuplicateAction {
                    ability_id: def.id.clone(),
                    action_id: action.id.clone(),
                });
            }
        }
        self.definitions.insert(def.id.clone(), def);
        Ok(())
    }

    /// Removes a definition. Returns false if it was not registered.
    pub fn unregister(&mut self, ability_id: &str) -> bool {
        self.definitions.remove(ability_id).is_some()
    }

    pub fn get(&self, ability_id: &str) -> Option<&AbilityDefinition> {
        self.definitions.get(ability_id)
    }

    pub fn contains(&self, ability_id: &str) -> bool {
        self.definitions.contains_key(ability_id)
    }

    pub fn action(&self, ability_id: &str, action_id: &str) -> Option<&AbilityAction> {
        self.get(ability_id)?.action(action_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.definitions.keys()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Installation record for one (agent, ability).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAbilityState {
    pub ability_id: String,
    pub installed_at_ms: u64,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BTreeMap<String, String>>,
}

/// Per-agent installed abilities.
#[derive(Debug, Clone, Default)]
pub struct AgentInstalls {
    by_agent: BTreeMap<EntityId, BTreeMap<String, AgentAbilityState>>,
}

impl AgentInstalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an installation. Returns false if the ability is unknown.
    pub fn install(
        &mut self,
        registry: &AbilityRegistry,
        agent_id: &str,
        ability_id: &str,
        credentials: Option<BTreeMap<String, String>>,
        now_ms: u64,
    ) -> bool {
        if !registry.contains(ability_id) {
            return false;
        }
        self.by_agent.entry(agent_id.to_string()).or_default().insert(
            ability_id.to_string(),
            AgentAbilityState {
                ability_id: ability_id.to_string(),
                installed_at_ms: now_ms,
                enabled: true,
                credentials,
            },
        );
        true
    }

    pub fn uninstall(&mut self, agent_id: &str, ability_id: &str) -> bool {
        let Some(abilities) = self.by_agent.get_mut(agent_id) else {
            return false;
        };
        let removed = abilities.remove(ability_id).is_some();
        if abilities.is_empty() {
            self.by_agent.remove(agent_id);
        }
        removed
    }

    /// Enables or disables an installation. Returns false if not installed.
    pub fn set_enabled(&mut self, agent_id: &str, ability_id: &str, enabled: bool) -> bool {
        match self
            .by_agent
            .get_mut(agent_id)
            .and_then(|m| m.get_mut(ability_id))
        {
            Some(state) => {
                state.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, agent_id: &str, ability_id: &str) -> Option<&AgentAbilityState> {
        self.by_agent.get(agent_id)?.get(ability_id)
    }

    /// All installations for an agent, ordered by ability id.
    pub fn for_agent(&self, agent_id: &str) -> Vec<AgentAbilityState> {
        self.by_agent
            .get(agent_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
