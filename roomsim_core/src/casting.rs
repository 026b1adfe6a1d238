//! The Cast Engine - validation, pending casts and action resolution.
//!
//! # Cast lifecycle
//!
//! ```text
//! invoke_action ──► Validating ──┬──► Resolved (instant, cast time 0)
//!                                └──► Casting ──┬──► Resolved
//!                                               ├──► Cancelled (caster moved)
//!                                               └──► Errored (entity gone, out of range)
//! ```
//!
//! Every terminal state is final. A source has at most one cast in
//! `Casting` at any instant; `invoke_action` rejects a second one before it
//! is stored.
//!
//! Pending casts are resolved by [`CastEngine::process_pending_casts`], once
//! per tick, in `(completion_time, ability_id, source_id, tx_id)` order so
//! that casts completing in the same tick resolve identically on every run.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::abilities::{AbilityAction, AbilityRegistry, AgentAbilityState, AgentInstalls};
use crate::effects::ActiveEffect;
use crate::entity::{EntityId, EntityStore};
use crate::outcome::{ActionOutcome, CastRejection};

/// Tunables for the cast engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Maximum invocations per agent inside the sliding window (default: 5)
    pub rate_limit_max: usize,

    /// Sliding window length (default: 1 000 ms)
    pub rate_limit_window_ms: u64,

    /// A caster that drifts further than this from its cast-start position
    /// has the cast cancelled (default: 10 world units)
    pub movement_cancel_threshold: f64,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            rate_limit_max: 5,
            rate_limit_window_ms: 1_000,
            movement_cancel_threshold: 10.0,
        }
    }
}

/// Caller-supplied invocation parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeParams {
    #[serde(default)]
    pub target_id: Option<EntityId>,

    /// Free-form arguments forwarded to custom handlers
    #[serde(default)]
    pub args: serde_json::Value,
}

impl InvokeParams {
    pub fn targeting(target_id: impl Into<EntityId>) -> Self {
        Self {
            target_id: Some(target_id.into()),
            args: serde_json::Value::Null,
        }
    }
}

/// A cast waiting for its completion time.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCast {
    pub tx_id: String,
    pub ability_id: String,
    pub action_id: String,
    pub source_entity_id: EntityId,
    pub target_entity_id: Option<EntityId>,
    pub started_at_ms: u64,
    pub completion_time_ms: u64,
    /// Caster position when the cast started
    pub source_position: Vector2<f64>,
    pub params: InvokeParams,
}

impl PendingCast {
    fn order_key(&self) -> (u64, &str, &str, &str) {
        (
            self.completion_time_ms,
            &self.ability_id,
            &self.source_entity_id,
            &self.tx_id,
        )
    }
}

/// What a custom handler sees when its action resolves.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub tx_id: &'a str,
    pub agent_id: &'a str,
    pub ability_id: &'a str,
    pub action_id: &'a str,
    pub target_id: Option<&'a str>,
    pub params: &'a InvokeParams,
    pub now_ms: u64,
}

/// Custom per-action behaviour run at resolution time.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, ctx: &ActionContext<'_>, entities: &mut EntityStore) -> ActionOutcome;
}

impl<F> ActionHandler for F
where
    F: Fn(&ActionContext<'_>, &mut EntityStore) -> ActionOutcome + Send + Sync,
{
    fn handle(&self, ctx: &ActionContext<'_>, entities: &mut EntityStore) -> ActionOutcome {
        self(ctx, entities)
    }
}

/// An effect attached by action execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEffect {
    pub tx_id: String,
    pub target_entity_id: EntityId,
    pub effect: ActiveEffect,
}

/// Terminal result of a pending cast.
#[derive(Debug, Clone, PartialEq)]
pub struct CastResolution {
    pub tx_id: String,
    pub agent_id: EntityId,
    pub ability_id: String,
    pub action_id: String,
    pub target_id: Option<EntityId>,
    pub completion_time_ms: u64,
    pub outcome: ActionOutcome,
}

/// Sliding-window invocation counter per agent.
#[derive(Debug, Clone, Default)]
pub struct InvokeRateLimiter {
    history: HashMap<EntityId, VecDeque<u64>>,
}

impl InvokeRateLimiter {
    /// Records an invocation if the agent is under `max` within the window.
    pub fn try_acquire(&mut self, agent_id: &str, now_ms: u64, max: usize, window_ms: u64) -> bool {
        let stamps = self.history.entry(agent_id.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|&t| now_ms.saturating_sub(t) >= window_ms)
        {
            stamps.pop_front();
        }
        if stamps.len() >= max {
            return false;
        }
        stamps.push_back(now_ms);
        true
    }

    pub fn forget(&mut self, agent_id: &str) {
        self.history.remove(agent_id);
    }

    /// Drops agents with no invocation inside the window. Returns how many
    /// were dropped.
    pub fn sweep(&mut self, now_ms: u64, window_ms: u64) -> usize {
        let before = self.history.len();
        self.history.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|&t| now_ms.saturating_sub(t) < window_ms)
        });
        before - self.history.len()
    }

    pub fn tracked_agents(&self) -> usize {
        self.history.len()
    }
}

/// Last-used timestamps per (agent, ability, action).
#[derive(Debug, Clone, Default)]
pub struct CooldownTable {
    last_used: HashMap<(EntityId, String, String), u64>,
}

impl CooldownTable {
    pub fn mark(&mut self, agent_id: &str, ability_id: &str, action_id: &str, now_ms: u64) {
        self.last_used.insert(
            (agent_id.to_string(), ability_id.to_string(), action_id.to_string()),
            now_ms,
        );
    }

    /// Milliseconds until the action is usable again (0 = ready).
    pub fn remaining_ms(
        &self,
        agent_id: &str,
        ability_id: &str,
        action_id: &str,
        cooldown_ms: u64,
        now_ms: u64,
    ) -> u64 {
        let key = (agent_id.to_string(), ability_id.to_string(), action_id.to_string());
        match self.last_used.get(&key) {
            Some(&last) => cooldown_ms.saturating_sub(now_ms.saturating_sub(last)),
            None => 0,
        }
    }

    pub fn forget(&mut self, agent_id: &str) {
        self.last_used.retain(|(agent, _, _), _| agent != agent_id);
    }
}

/// Owns every piece of casting state for one room.
pub struct CastEngine {
    config: CastConfig,
    registry: AbilityRegistry,
    installs: AgentInstalls,
    rate_limiter: InvokeRateLimiter,
    cooldowns: CooldownTable,
    /// source entity -> its single pending cast
    pending: BTreeMap<EntityId, PendingCast>,
    handlers: HashMap<(String, String), Box<dyn ActionHandler>>,
    applied: Vec<AppliedEffect>,
    next_effect_seq: u64,
}

impl CastEngine {
    pub fn new(config: CastConfig) -> Self {
        Self {
            config,
            registry: AbilityRegistry::new(),
            installs: AgentInstalls::new(),
            rate_limiter: InvokeRateLimiter::default(),
            cooldowns: CooldownTable::default(),
            pending: BTreeMap::new(),
            handlers: HashMap::new(),
            applied: Vec::new(),
            next_effect_seq: 1,
        }
    }

    pub fn config(&self) -> &CastConfig {
        &self.config
    }

    pub fn registry(&self) -> &AbilityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AbilityRegistry {
        &mut self.registry
    }

    pub fn installs(&self) -> &AgentInstalls {
        &self.installs
    }

    /// Registers a custom handler for one action.
    pub fn register_handler(
        &mut self,
        ability_id: impl Into<String>,
        action_id: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) {
        self.handlers
            .insert((ability_id.into(), action_id.into()), Box::new(handler));
    }

    /// Installs an ability for an agent. False if the ability is unknown.
    pub fn install_for_agent(
        &mut self,
        agent_id: &str,
        ability_id: &str,
        credentials: Option<BTreeMap<String, String>>,
        now_ms: u64,
    ) -> bool {
        self.installs
            .install(&self.registry, agent_id, ability_id, credentials, now_ms)
    }

    pub fn uninstall_for_agent(&mut self, agent_id: &str, ability_id: &str) -> bool {
        self.installs.uninstall(agent_id, ability_id)
    }

    pub fn set_enabled(&mut self, agent_id: &str, ability_id: &str, enabled: bool) -> bool {
        self.installs.set_enabled(agent_id, ability_id, enabled)
    }

    pub fn get_agent_abilities(&self, agent_id: &str) -> Vec<AgentAbilityState> {
        self.installs.for_agent(agent_id)
    }

    /// Validates and starts (or instantly resolves) an action.
    ///
    /// Checks run in a fixed order and stop at the first failure:
    /// rate limit, already casting, ability/action known, installed,
    /// source exists, cooldown, target exists and in range.
    #[allow(clippy::too_many_arguments)]
    pub fn invoke_action(
        &mut self,
        entities: &mut EntityStore,
        agent_id: &str,
        ability_id: &str,
        action_id: &str,
        params: InvokeParams,
        tx_id: &str,
        now_ms: u64,
    ) -> ActionOutcome {
        let action = match self.validate(entities, agent_id, ability_id, action_id, &params, now_ms) {
            Ok(action) => action,
            Err(rejection) => {
                debug!(agent = agent_id, ability = ability_id, action = action_id, %rejection, "invocation rejected");
                return rejection.into();
            }
        };

        let cast_time = action.cast_time();
        if cast_time > 0 {
            // validate() guarantees the source exists.
            let source_position = entities
                .get(agent_id)
                .map(|e| e.position)
                .unwrap_or_else(Vector2::zeros);
            let completion_time_ms = now_ms.saturating_add(cast_time);
            debug!(agent = agent_id, ability = ability_id, action = action_id, tx = tx_id, completion_time_ms, "cast started");
            self.pending.insert(
                agent_id.to_string(),
                PendingCast {
                    tx_id: tx_id.to_string(),
                    ability_id: ability_id.to_string(),
                    action_id: action_id.to_string(),
                    source_entity_id: agent_id.to_string(),
                    target_entity_id: params.target_id.clone(),
                    started_at_ms: now_ms,
                    completion_time_ms,
                    source_position,
                    params,
                },
            );
            return ActionOutcome::Pending {
                tx_id: tx_id.to_string(),
                completion_time: completion_time_ms,
            };
        }

        self.execute(entities, agent_id, ability_id, &action, &params, tx_id, now_ms)
    }

    fn validate(
        &mut self,
        entities: &EntityStore,
        agent_id: &str,
        ability_id: &str,
        action_id: &str,
        params: &InvokeParams,
        now_ms: u64,
    ) -> Result<AbilityAction, CastRejection> {
        let (max, window_ms) = (self.config.rate_limit_max, self.config.rate_limit_window_ms);
        if !self.rate_limiter.try_acquire(agent_id, now_ms, max, window_ms) {
            return Err(CastRejection::RateLimited { max, window_ms });
        }

        if self.pending.contains_key(agent_id) {
            return Err(CastRejection::AlreadyCasting);
        }

        let definition = self
            .registry
            .get(ability_id)
            .ok_or_else(|| CastRejection::UnknownAbility(ability_id.to_string()))?;
        let action = definition
            .action(action_id)
            .ok_or_else(|| CastRejection::UnknownAction {
                ability_id: ability_id.to_string(),
                action_id: action_id.to_string(),
            })?
            .clone();

        match self.installs.get(agent_id, ability_id) {
            None => return Err(CastRejection::NotInstalled(ability_id.to_string())),
            Some(state) if !state.enabled => {
                return Err(CastRejection::Disabled(ability_id.to_string()))
            }
            Some(_) => {}
        }

        let source = entities
            .get(agent_id)
            .ok_or_else(|| CastRejection::SourceMissing(agent_id.to_string()))?;

        let cooldown = action.cooldown();
        if cooldown > 0 {
            let remaining = self
                .cooldowns
                .remaining_ms(agent_id, ability_id, action_id, cooldown, now_ms);
            if remaining > 0 {
                return Err(CastRejection::Cooldown {
                    remaining_secs: remaining.div_ceil(1000),
                });
            }
        }

        if let Some(target_id) = &params.target_id {
            let target = entities
                .get(target_id)
                .ok_or_else(|| CastRejection::TargetMissing(target_id.clone()))?;
            let distance = source.distance_to(target);
            if !action.in_range(distance) {
                return Err(CastRejection::OutOfRange {
                    distance,
                    range: action.range_units.unwrap_or(f64::INFINITY),
                });
            }
        }

        Ok(action)
    }

    /// Resolves every pending cast whose completion time has passed.
    ///
    /// Casts are processed in `(completion_time, ability_id, source_id,
    /// tx_id)` order. Each is re-validated against the current world: a
    /// vanished source or target, or a target now out of range, errors; a
    /// caster that moved past the threshold is cancelled.
    pub fn process_pending_casts(
        &mut self,
        entities: &mut EntityStore,
        now_ms: u64,
    ) -> Vec<CastResolution> {
        let due_sources: Vec<EntityId> = self
            .pending
            .iter()
            .filter(|(_, cast)| cast.completion_time_ms <= now_ms)
            .map(|(source, _)| source.clone())
            .collect();
        if due_sources.is_empty() {
            return Vec::new();
        }

        let mut due: Vec<PendingCast> = due_sources
            .iter()
            .filter_map(|source| self.pending.remove(source))
            .collect();
        due.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        due.into_iter()
            .map(|cast| {
                let outcome = self.resolve(entities, &cast, now_ms);
                debug!(tx = %cast.tx_id, ability = %cast.ability_id, outcome = outcome.kind(), "cast resolved");
                CastResolution {
                    tx_id: cast.tx_id,
                    agent_id: cast.source_entity_id,
                    ability_id: cast.ability_id,
                    action_id: cast.action_id,
                    target_id: cast.target_entity_id,
                    completion_time_ms: cast.completion_time_ms,
                    outcome,
                }
            })
            .collect()
    }

    fn resolve(&mut self, entities: &mut EntityStore, cast: &PendingCast, now_ms: u64) -> ActionOutcome {
        let Some(source) = entities.get(&cast.source_entity_id) else {
            return ActionOutcome::error("Source entity no longer exists");
        };

        let drift = (source.position - cast.source_position).norm();
        if drift > self.config.movement_cancel_threshold {
            return ActionOutcome::cancelled(format!("Caster moved {drift:.1} units during cast"));
        }

        let Some(action) = self.registry.action(&cast.ability_id, &cast.action_id).cloned() else {
            return ActionOutcome::error("Ability no longer registered");
        };

        if let Some(target_id) = &cast.target_entity_id {
            let Some(target) = entities.get(target_id) else {
                return ActionOutcome::error("Target entity no longer exists");
            };
            if !action.in_range(source.distance_to(target)) {
                return ActionOutcome::error("Target moved out of range");
            }
        }

        self.execute(
            entities,
            &cast.source_entity_id,
            &cast.ability_id,
            &action,
            &cast.params,
            &cast.tx_id,
            now_ms,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &mut self,
        entities: &mut EntityStore,
        agent_id: &str,
        ability_id: &str,
        action: &AbilityAction,
        params: &InvokeParams,
        tx_id: &str,
        now_ms: u64,
    ) -> ActionOutcome {
        if action.cooldown() > 0 {
            self.cooldowns.mark(agent_id, ability_id, &action.id, now_ms);
        }

        if let (Some(spec), Some(target_id)) = (&action.effect, &params.target_id) {
            if let Some(target) = entities.get_mut(target_id) {
                let effect = ActiveEffect {
                    id: format!("fx_{}", self.next_effect_seq),
                    kind: spec.kind.clone(),
                    source_entity_id: agent_id.to_string(),
                    applied_at_ms: now_ms,
                    duration_ms: spec.duration_ms,
                    modifiers: spec.modifiers,
                };
                self.next_effect_seq += 1;
                target.effects.push(effect.clone());
                self.applied.push(AppliedEffect {
                    tx_id: tx_id.to_string(),
                    target_entity_id: target_id.clone(),
                    effect,
                });
            }
        }

        match self.handlers.get(&(ability_id.to_string(), action.id.clone())) {
            Some(handler) => {
                let ctx = ActionContext {
                    tx_id,
                    agent_id,
                    ability_id,
                    action_id: &action.id,
                    target_id: params.target_id.as_deref(),
                    params,
                    now_ms,
                };
                handler.handle(&ctx, entities)
            }
            None => ActionOutcome::ok(),
        }
    }

    /// Cancels a pending cast by transaction id.
    pub fn cancel_cast(&mut self, tx_id: &str) -> Option<PendingCast> {
        let source = self
            .pending
            .iter()
            .find(|(_, cast)| cast.tx_id == tx_id)
            .map(|(source, _)| source.clone())?;
        self.pending.remove(&source)
    }

    /// Cancels every pending cast sourced by an agent.
    pub fn cancel_all_casts_for_agent(&mut self, agent_id: &str) -> Vec<PendingCast> {
        self.pending.remove(agent_id).into_iter().collect()
    }

    /// Drops all transient state for a disconnecting agent.
    ///
    /// Installations survive so a reconnecting agent keeps its abilities.
    pub fn forget_agent(&mut self, agent_id: &str) -> Vec<PendingCast> {
        self.rate_limiter.forget(agent_id);
        self.cooldowns.forget(agent_id);
        self.cancel_all_casts_for_agent(agent_id)
    }

    /// Drops rate-limit history for agents idle longer than the window.
    pub fn sweep_rate_history(&mut self, now_ms: u64) -> usize {
        self.rate_limiter.sweep(now_ms, self.config.rate_limit_window_ms)
    }

    pub fn rate_tracked_agents(&self) -> usize {
        self.rate_limiter.tracked_agents()
    }

    pub fn pending_cast_for(&self, agent_id: &str) -> Option<&PendingCast> {
        self.pending.get(agent_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remaining cooldown for an action, 0 when ready or unknown.
    pub fn cooldown_remaining_ms(
        &self,
        agent_id: &str,
        ability_id: &str,
        action_id: &str,
        now_ms: u64,
    ) -> u64 {
        self.registry
            .action(ability_id, action_id)
            .map(|a| {
                self.cooldowns
                    .remaining_ms(agent_id, ability_id, action_id, a.cooldown(), now_ms)
            })
            .unwrap_or(0)
    }

    /// Drains effects attached since the last call.
    pub fn take_applied_effects(&mut self) -> Vec<AppliedEffect> {
        std::mem::take(&mut self.applied)
    }
}

impl Default for CastEngine {
    fn default() -> Self {
        Self::new(CastConfig::default())
    }
}

impl std::fmt::Debug for CastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastEngine")
            .field("config", &self.config)
            .field("abilities", &self.registry.len())
            .field("pending", &self.pending.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abilities::AbilityDefinition;
    use crate::effects::{process_effect_expirations, EffectSpec, StatModifiers};
    use crate::entity::{Entity, EntityKind};
    use proptest::prelude::*;

    const T0: u64 = 1_704_067_200_000;

    fn slow_aura() -> AbilityDefinition {
        AbilityDefinition::new("slow_aura", "Slow Aura").with_action(
            AbilityAction::new("cast")
                .with_cooldown_ms(5_000)
                .with_cast_time_ms(1_000)
                .with_range(200.0)
                .with_effect(EffectSpec {
                    kind: "slow".to_string(),
                    duration_ms: 3_000,
                    modifiers: StatModifiers {
                        speed_multiplier: Some(0.5),
                    },
                }),
        )
    }

    fn wave() -> AbilityDefinition {
        AbilityDefinition::new("wave", "Wave").with_action(AbilityAction::new("hello"))
    }

    fn setup() -> (CastEngine, EntityStore) {
        let mut engine = CastEngine::default();
        engine.registry_mut().register(slow_aura()).unwrap();
        engine.registry_mut().register(wave()).unwrap();
        let mut entities = EntityStore::new();
        entities.insert(Entity::new("a", EntityKind::Agent, 0.0, 0.0));
        entities.insert(Entity::new("b", EntityKind::Player, 150.0, 0.0));
        for agent in ["a", "b"] {
            engine.install_for_agent(agent, "slow_aura", None, T0);
            engine.install_for_agent(agent, "wave", None, T0);
        }
        (engine, entities)
    }

    fn error_message(outcome: &ActionOutcome) -> &str {
        match outcome {
            ActionOutcome::Error { message } => message,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_slow_aura_end_to_end() {
        let (mut engine, mut entities) = setup();

        let outcome = engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        assert_eq!(
            outcome,
            ActionOutcome::Pending {
                tx_id: "tx-1".to_string(),
                completion_time: T0 + 1_000,
            }
        );

        // Not due yet.
        assert!(engine.process_pending_casts(&mut entities, T0 + 999).is_empty());

        let resolved = engine.process_pending_casts(&mut entities, T0 + 1_000);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].outcome.is_ok());

        let b = entities.get("b").unwrap();
        assert_eq!(b.effects.len(), 1);
        assert_eq!(b.effects[0].modifiers.speed_multiplier, Some(0.5));
        assert_eq!(b.effects[0].expires_at_ms(), T0 + 4_000);
        assert_eq!(engine.take_applied_effects().len(), 1);

        let again = engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-2", T0 + 2_000,
        );
        assert_eq!(error_message(&again), "Ability on cooldown (4s remaining)");
        assert_eq!(engine.cooldown_remaining_ms("a", "slow_aura", "cast", T0 + 2_000), 4_000);

        assert!(process_effect_expirations(&mut entities, T0 + 3_999).is_empty());
        assert_eq!(process_effect_expirations(&mut entities, T0 + 4_000).len(), 1);
    }

    #[test]
    fn test_second_invoke_while_casting_is_rejected() {
        let (mut engine, mut entities) = setup();
        let first = engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        assert!(first.is_pending());

        let second = engine.invoke_action(
            &mut entities, "a", "wave", "hello", InvokeParams::default(), "tx-2", T0 + 10,
        );
        assert_eq!(error_message(&second), "Already casting");
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn test_sixth_invoke_in_one_second_is_rate_limited() {
        let (mut engine, mut entities) = setup();
        for i in 0..5 {
            let outcome = engine.invoke_action(
                &mut entities, "a", "wave", "hello", InvokeParams::default(), &format!("tx-{i}"), T0 + i * 100,
            );
            assert!(outcome.is_ok(), "invocation {i} should pass");
        }
        let sixth = engine.invoke_action(
            &mut entities, "a", "wave", "hello", InvokeParams::default(), "tx-6", T0 + 900,
        );
        assert!(error_message(&sixth).starts_with("Rate limited"));

        // Other agents are unaffected.
        let other = engine.invoke_action(
            &mut entities, "b", "wave", "hello", InvokeParams::default(), "tx-b", T0 + 900,
        );
        assert!(other.is_ok());
    }

    #[test]
    fn test_spaced_invocations_never_rate_limited() {
        let (mut engine, mut entities) = setup();
        for i in 0..20 {
            let outcome = engine.invoke_action(
                &mut entities, "a", "wave", "hello", InvokeParams::default(), &format!("tx-{i}"), T0 + i * 1_000,
            );
            assert!(outcome.is_ok());
        }
    }

    #[test]
    fn test_rate_limit_checked_before_everything_else() {
        let (mut engine, mut entities) = setup();
        for i in 0..5 {
            engine.invoke_action(
                &mut entities, "a", "nope", "x", InvokeParams::default(), &format!("tx-{i}"), T0,
            );
        }
        let outcome = engine.invoke_action(
            &mut entities, "a", "nope", "x", InvokeParams::default(), "tx-5", T0,
        );
        assert!(error_message(&outcome).starts_with("Rate limited"));
    }

    #[test]
    fn test_validation_order_and_messages() {
        let (mut engine, mut entities) = setup();

        let unknown = engine.invoke_action(&mut entities, "a", "fly", "up", InvokeParams::default(), "t1", T0);
        assert_eq!(error_message(&unknown), "Unknown ability: fly");

        let bad_action = engine.invoke_action(&mut entities, "a", "wave", "bye", InvokeParams::default(), "t2", T0);
        assert_eq!(error_message(&bad_action), "Unknown action bye for ability wave");

        let not_installed = engine.invoke_action(&mut entities, "c", "wave", "hello", InvokeParams::default(), "t3", T0);
        assert_eq!(error_message(&not_installed), "Ability wave is not installed");

        engine.install_for_agent("ghost", "wave", None, T0);
        let missing = engine.invoke_action(&mut entities, "ghost", "wave", "hello", InvokeParams::default(), "t4", T0);
        assert_eq!(error_message(&missing), "Source entity ghost not found");

        engine.set_enabled("b", "wave", false);
        let disabled = engine.invoke_action(&mut entities, "b", "wave", "hello", InvokeParams::default(), "t5", T0);
        assert_eq!(error_message(&disabled), "Ability wave is disabled");

        let no_target = engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("zed"), "t6", T0,
        );
        assert_eq!(error_message(&no_target), "Target entity zed not found");
    }

    #[test]
    fn test_out_of_range_target_rejected() {
        let (mut engine, mut entities) = setup();
        entities.get_mut("b").unwrap().position = Vector2::new(250.0, 0.0);
        let outcome = engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        assert!(error_message(&outcome).starts_with("Target out of range"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_cast_cancelled_when_caster_moves() {
        let (mut engine, mut entities) = setup();
        engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        entities.get_mut("a").unwrap().position = Vector2::new(10.5, 0.0);

        let resolved = engine.process_pending_casts(&mut entities, T0 + 5_000);
        assert!(matches!(resolved[0].outcome, ActionOutcome::Cancelled { .. }));
        assert!(entities.get("b").unwrap().effects.is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_small_drift_within_threshold_still_resolves() {
        let (mut engine, mut entities) = setup();
        engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        entities.get_mut("a").unwrap().position = Vector2::new(6.0, 8.0);
        let resolved = engine.process_pending_casts(&mut entities, T0 + 1_000);
        assert!(resolved[0].outcome.is_ok());
    }

    #[test]
    fn test_missing_entities_at_resolution_error() {
        let (mut engine, mut entities) = setup();
        engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        entities.remove("b");
        let resolved = engine.process_pending_casts(&mut entities, T0 + 1_000);
        assert_eq!(error_message(&resolved[0].outcome), "Target entity no longer exists");

        engine.invoke_action(
            &mut entities, "a", "wave", "hello", InvokeParams::default(), "tx-2", T0 + 1_500,
        );
        let cast = AbilityDefinition::new("chant", "Chant")
            .with_action(AbilityAction::new("om").with_cast_time_ms(500));
        engine.registry_mut().register(cast).unwrap();
        engine.install_for_agent("a", "chant", None, T0);
        engine.invoke_action(
            &mut entities, "a", "chant", "om", InvokeParams::default(), "tx-3", T0 + 2_000,
        );
        entities.remove("a");
        let resolved = engine.process_pending_casts(&mut entities, T0 + 3_000);
        assert_eq!(error_message(&resolved[0].outcome), "Source entity no longer exists");
    }

    #[test]
    fn test_target_moving_out_of_range_errors() {
        let (mut engine, mut entities) = setup();
        engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        entities.get_mut("b").unwrap().position = Vector2::new(400.0, 0.0);
        let resolved = engine.process_pending_casts(&mut entities, T0 + 1_000);
        assert_eq!(error_message(&resolved[0].outcome), "Target moved out of range");
    }

    #[test]
    fn test_cancel_cast_and_cancel_all() {
        let (mut engine, mut entities) = setup();
        engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        assert!(engine.cancel_cast("tx-404").is_none());
        assert_eq!(engine.cancel_cast("tx-1").unwrap().source_entity_id, "a");
        assert!(engine.pending_cast_for("a").is_none());

        engine.invoke_action(
            &mut entities, "b", "slow_aura", "cast", InvokeParams::targeting("a"), "tx-2", T0 + 1_000,
        );
        assert_eq!(engine.cancel_all_casts_for_agent("b").len(), 1);
        assert!(engine.cancel_all_casts_for_agent("b").is_empty());
    }

    #[test]
    fn test_custom_handler_outcome_is_returned() {
        let (mut engine, mut entities) = setup();
        engine.register_handler("wave", "hello", |ctx: &ActionContext<'_>, _: &mut EntityStore| {
            ActionOutcome::ok_with(format!("{} waves", ctx.agent_id), None)
        });
        let outcome = engine.invoke_action(
            &mut entities, "a", "wave", "hello", InvokeParams::default(), "tx-1", T0,
        );
        assert_eq!(outcome, ActionOutcome::ok_with("a waves", None));
    }

    #[test]
    fn test_invoke_after_uninstall_is_not_installed() {
        let (mut engine, mut entities) = setup();
        assert!(engine.uninstall_for_agent("a", "wave"));
        assert!(!engine.uninstall_for_agent("a", "wave"));
        assert!(engine.get_agent_abilities("a").iter().all(|s| s.ability_id != "wave"));

        let outcome = engine.invoke_action(
            &mut entities, "a", "wave", "hello", InvokeParams::default(), "tx-1", T0,
        );
        assert_eq!(error_message(&outcome), "Ability wave is not installed");

        // b keeps its own installation.
        let other = engine.invoke_action(
            &mut entities, "b", "wave", "hello", InvokeParams::default(), "tx-2", T0,
        );
        assert!(other.is_ok());
    }

    #[test]
    fn test_rate_history_sweep_drops_idle_agents() {
        let (mut engine, mut entities) = setup();
        for i in 0..20u64 {
            let agent = format!("stranger-{i}");
            let outcome = engine.invoke_action(
                &mut entities, &agent, "wave", "hello", InvokeParams::default(), "tx", T0 + i,
            );
            assert!(error_message(&outcome).starts_with("Source entity"));
        }
        let own = engine.invoke_action(
            &mut entities, "a", "wave", "hello", InvokeParams::default(), "tx-a", T0 + 900,
        );
        assert!(own.is_ok());
        assert_eq!(engine.rate_tracked_agents(), 21);

        // Strangers are past the 1s window, a is not.
        assert_eq!(engine.sweep_rate_history(T0 + 1_500), 20);
        assert_eq!(engine.rate_tracked_agents(), 1);
        assert_eq!(engine.sweep_rate_history(T0 + 1_900), 1);
        assert_eq!(engine.rate_tracked_agents(), 0);
    }

    #[test]
    fn test_forget_agent_clears_cooldowns_but_keeps_installs() {
        let (mut engine, mut entities) = setup();
        engine.invoke_action(
            &mut entities, "a", "slow_aura", "cast", InvokeParams::targeting("b"), "tx-1", T0,
        );
        engine.process_pending_casts(&mut entities, T0 + 1_000);
        assert!(engine.cooldown_remaining_ms("a", "slow_aura", "cast", T0 + 1_000) > 0);

        engine.forget_agent("a");
        assert_eq!(engine.cooldown_remaining_ms("a", "slow_aura", "cast", T0 + 1_000), 0);
        assert_eq!(engine.get_agent_abilities("a").len(), 2);
    }

    fn storm_order(casters: &[(String, u64)]) -> Vec<String> {
        let mut engine = CastEngine::new(CastConfig {
            rate_limit_max: usize::MAX,
            ..CastConfig::default()
        });
        let chant = AbilityDefinition::new("chant", "Chant")
            .with_action(AbilityAction::new("om").with_cast_time_ms(100));
        let hum = AbilityDefinition::new("hum", "Hum")
            .with_action(AbilityAction::new("mm").with_cast_time_ms(100));
        engine.registry_mut().register(chant).unwrap();
        engine.registry_mut().register(hum).unwrap();

        let mut entities = EntityStore::new();
        for (i, (caster, offset)) in casters.iter().enumerate() {
            entities.insert(Entity::new(caster.clone(), EntityKind::Agent, 0.0, 0.0));
            let ability = if i % 2 == 0 { "chant" } else { "hum" };
            let action = if i % 2 == 0 { "om" } else { "mm" };
            engine.install_for_agent(caster, ability, None, 0);
            engine.invoke_action(
                &mut entities, caster, ability, action, InvokeParams::default(), &format!("tx-{i}"), T0 + offset,
            );
        }
        engine
            .process_pending_casts(&mut entities, T0 + 1_000)
            .into_iter()
            .map(|r| r.tx_id)
            .collect()
    }

    proptest! {
        #[test]
        fn prop_same_tick_resolution_is_sorted_and_repeatable(
            offsets in proptest::collection::btree_map("[a-z]{1,6}", 0u64..50, 1..24)
        ) {
            let casters: Vec<(String, u64)> = offsets.into_iter().collect();
            let first = storm_order(&casters);
            let second = storm_order(&casters);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), casters.len());

            let mut keys: Vec<(u64, &str, &str, String)> = casters
                .iter()
                .enumerate()
                .map(|(i, (caster, offset))| {
                    let ability = if i % 2 == 0 { "chant" } else { "hum" };
                    (T0 + offset + 100, ability, caster.as_str(), format!("tx-{i}"))
                })
                .collect();
            keys.sort();
            let expected: Vec<String> = keys.into_iter().map(|k| k.3).collect();
            prop_assert_eq!(first, expected);
        }
    }
}
