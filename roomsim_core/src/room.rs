//! Room Runtime - the per-room tick loop and its direct-call handlers.
//!
//! This module wires the event log, zone tracker, proximity tracker and
//! cast engine to the environment context (RoomContext).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Room<Ctx>                           │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │              Context: RoomContext                     │   │
//! │  │  • now_ms() → cast, cooldown and event timestamps    │   │
//! │  │  • sleep() → tick rate control                       │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                               │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────────────┐   │
//! │  │ ENTITY  │ │  ZONE   │ │  CAST   │ │    EVENT LOG    │   │
//! │  │  Store  │ │ Tracker │ │ Engine  │ │                 │   │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tick phases
//!
//! Every tick runs, in this order and never re-entrantly:
//! movement → zone/proximity reconciliation → pending-cast resolution →
//! effect expiration → metrics snapshot.
//!
//! A tick that overruns its budget delays the next one; ticks are never
//! skipped or merged. Event log retention cleanup runs between ticks on
//! its own, slower interval.

use roomsim_env::{RoomContext, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::abilities::{AbilityDefinition, AbilityRegistryError, AgentAbilityState};
use crate::casting::{AppliedEffect, CastConfig, CastEngine, CastResolution, InvokeParams, PendingCast};
use crate::effects::process_effect_expirations;
use crate::entity::{Entity, EntityStore};
use crate::event_log::{EventCursor, EventLog, EventLogConfig, EventPage, EventType};
use crate::handle::RoomCommand;
use crate::metrics::{RoomMetrics, TickMetrics};
use crate::outcome::ActionOutcome;
use crate::proximity::{ProximityChange, ProximityTracker};
use crate::zones::{Zone, ZoneConfigError, ZoneTracker, ZoneTransition, ZoneUpdate};

/// Configuration for a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Room's logical name (for logging)
    pub name: String,

    /// Tick rate in Hz (default: 20)
    pub tick_rate_hz: u32,

    /// Zone rectangles from the world pack
    pub zones: Vec<Zone>,

    /// Abilities registered at startup
    pub abilities: Vec<AbilityDefinition>,

    /// Distance under which two entities are "near" (default: 64 units)
    pub proximity_radius: f64,

    pub event_log: EventLogConfig,

    pub casting: CastConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: "room".to_string(),
            tick_rate_hz: 20,
            zones: Vec::new(),
            abilities: Vec::new(),
            proximity_radius: 64.0,
            event_log: EventLogConfig::default(),
            casting: CastConfig::default(),
        }
    }
}

impl RoomConfig {
    /// Parses a world-pack room block.
    pub fn from_json_str(json: &str) -> Result<Self, RoomError> {
        let config: RoomConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RoomError> {
        if self.tick_rate_hz == 0 {
            return Err(RoomError::InvalidTickRate(self.tick_rate_hz));
        }
        // Zone validation is shared with the tracker itself.
        ZoneTracker::new(self.zones.clone())?;
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz;
        self
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zones.push(zone);
        self
    }

    pub fn with_ability(mut self, ability: AbilityDefinition) -> Self {
        self.abilities.push(ability);
        self
    }

    pub fn with_event_log(mut self, event_log: EventLogConfig) -> Self {
        self.event_log = event_log;
        self
    }

    /// Duration of one tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

/// Fatal room errors. Raised at construction, never during a tick.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("tick rate must be positive, got {0}")]
    InvalidTickRate(u32),

    #[error("invalid zone configuration: {0}")]
    Zones(#[from] ZoneConfigError),

    #[error("invalid ability definition: {0}")]
    Ability(#[from] AbilityRegistryError),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("room {0} is no longer running")]
    Closed(RoomId),
}

/// One room's authoritative simulation state.
///
/// Generic over the context so the same room runs under Tokio or a
/// virtual clock.
pub struct Room<Ctx: RoomContext> {
    room_id: RoomId,
    context: Arc<Ctx>,
    config: RoomConfig,
    entities: EntityStore,
    zones: ZoneTracker,
    proximity: ProximityTracker,
    casts: CastEngine,
    events: EventLog,
    metrics: RoomMetrics,
    tick_count: u64,
    last_cleanup: Duration,
}

impl<Ctx: RoomContext> Room<Ctx> {
    /// Builds a room from its configuration.
    pub fn new(room_id: RoomId, context: Arc<Ctx>, config: RoomConfig) -> Result<Self, RoomError> {
        if config.tick_rate_hz == 0 {
            return Err(RoomError::InvalidTickRate(config.tick_rate_hz));
        }
        let zones = ZoneTracker::new(config.zones.clone())?;
        let mut casts = CastEngine::new(config.casting.clone());
        for ability in &config.abilities {
            casts.registry_mut().register(ability.clone())?;
        }

        info!(
            room = %room_id,
            name = %config.name,
            tick_rate_hz = config.tick_rate_hz,
            zones = zones.zones().len(),
            abilities = casts.registry().len(),
            "room created"
        );

        let last_cleanup = context.now();
        Ok(Self {
            room_id,
            proximity: ProximityTracker::new(config.proximity_radius),
            events: EventLog::new(config.event_log.clone()),
            context,
            config,
            entities: EntityStore::new(),
            zones,
            casts,
            metrics: RoomMetrics::new(),
            tick_count: 0,
            last_cleanup,
        })
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn zones(&self) -> &ZoneTracker {
        &self.zones
    }

    pub fn proximity(&self) -> &ProximityTracker {
        &self.proximity
    }

    pub fn casts(&self) -> &CastEngine {
        &self.casts
    }

    /// Mutable cast engine, for registering custom action handlers.
    pub fn casts_mut(&mut self) -> &mut CastEngine {
        &mut self.casts
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn metrics(&self) -> &RoomMetrics {
        &self.metrics
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ------------------------------------------------------------------
    // Direct-call handlers
    // ------------------------------------------------------------------

    /// Adds an entity. Returns false if the id is already present.
    pub fn join(&mut self, entity: Entity) -> bool {
        if self.entities.contains(&entity.id) {
            return false;
        }
        let now_ms = self.context.now_ms();
        let (id, x, y) = (entity.id.clone(), entity.position.x, entity.position.y);
        self.append(
            EventType::PresenceJoin,
            json!({ "entityId": id, "kind": entity.kind, "x": x, "y": y }),
            now_ms,
        );
        self.entities.insert(entity);

        let mut transitions = Vec::new();
        self.zones.update_entity_zone(&id, x, y, Some(&mut transitions));
        self.append_zone_transitions(transitions, now_ms);
        true
    }

    /// Removes an entity, cancelling its casts. Returns false if absent.
    pub fn leave(&mut self, entity_id: &str) -> bool {
        if !self.entities.contains(entity_id) {
            return false;
        }
        let now_ms = self.context.now_ms();

        let cancelled = self.casts.forget_agent(entity_id);
        for cast in &cancelled {
            self.append_cast_cancelled(cast, "Caster left the room", now_ms);
        }

        let mut transitions = Vec::new();
        self.zones.remove_entity(entity_id, Some(&mut transitions));
        self.append_zone_transitions(transitions, now_ms);

        let exits = self.proximity.remove_entity(entity_id);
        self.append_proximity_changes(&exits, now_ms);

        self.entities.remove(entity_id);
        self.append(EventType::PresenceLeave, json!({ "entityId": entity_id }), now_ms);
        true
    }

    /// Sets an entity's velocity (units/second). Returns false if absent.
    pub fn set_velocity(&mut self, entity_id: &str, vx: f64, vy: f64) -> bool {
        match self.entities.get_mut(entity_id) {
            Some(entity) => {
                entity.velocity = nalgebra::Vector2::new(vx, vy);
                true
            }
            None => false,
        }
    }

    /// Moves an entity instantly and reconciles its zone.
    pub fn teleport(&mut self, entity_id: &str, x: f64, y: f64) -> Option<ZoneUpdate> {
        let entity = self.entities.get_mut(entity_id)?;
        entity.position = nalgebra::Vector2::new(x, y);

        let now_ms = self.context.now_ms();
        let mut transitions = Vec::new();
        let update = self
            .zones
            .update_entity_zone(entity_id, x, y, Some(&mut transitions));
        self.append_zone_transitions(transitions, now_ms);
        Some(update)
    }

    /// Records a chat line from a present entity.
    pub fn say(&mut self, entity_id: &str, text: &str) -> Option<EventCursor> {
        if !self.entities.contains(entity_id) {
            return None;
        }
        let zone = self.zones.get_entity_zone(entity_id).cloned();
        let now_ms = self.context.now_ms();
        Some(self.append(
            EventType::ChatMessage,
            json!({ "entityId": entity_id, "text": text, "zoneId": zone }),
            now_ms,
        ))
    }

    pub fn register_ability(&mut self, def: AbilityDefinition) -> Result<(), AbilityRegistryError> {
        self.casts.registry_mut().register(def)
    }

    pub fn unregister_ability(&mut self, ability_id: &str) -> bool {
        self.casts.registry_mut().unregister(ability_id)
    }

    pub fn install_for_agent(
        &mut self,
        agent_id: &str,
        ability_id: &str,
        credentials: Option<BTreeMap<String, String>>,
    ) -> bool {
        let now_ms = self.context.now_ms();
        self.casts
            .install_for_agent(agent_id, ability_id, credentials, now_ms)
    }

    pub fn uninstall_for_agent(&mut self, agent_id: &str, ability_id: &str) -> bool {
        self.casts.uninstall_for_agent(agent_id, ability_id)
    }

    pub fn get_agent_abilities(&self, agent_id: &str) -> Vec<AgentAbilityState> {
        self.casts.get_agent_abilities(agent_id)
    }

    /// Invokes an ability action on behalf of an agent.
    pub fn invoke_action(
        &mut self,
        agent_id: &str,
        ability_id: &str,
        action_id: &str,
        params: InvokeParams,
        tx_id: &str,
    ) -> ActionOutcome {
        let now_ms = self.context.now_ms();
        let target = params.target_id.clone();
        let outcome = self.casts.invoke_action(
            &mut self.entities,
            agent_id,
            ability_id,
            action_id,
            params,
            tx_id,
            now_ms,
        );

        match &outcome {
            ActionOutcome::Pending { completion_time, .. } => {
                self.append(
                    EventType::AbilityCast,
                    json!({
                        "txId": tx_id,
                        "agentId": agent_id,
                        "abilityId": ability_id,
                        "actionId": action_id,
                        "targetId": target,
                        "completionTime": completion_time,
                    }),
                    now_ms,
                );
            }
            ActionOutcome::Error { .. } => {}
            resolved => {
                let resolution = CastResolution {
                    tx_id: tx_id.to_string(),
                    agent_id: agent_id.to_string(),
                    ability_id: ability_id.to_string(),
                    action_id: action_id.to_string(),
                    target_id: target,
                    completion_time_ms: now_ms,
                    outcome: resolved.clone(),
                };
                self.append_resolution(&resolution, now_ms);
            }
        }
        self.append_applied_effects(now_ms);
        outcome
    }

    /// Explicitly cancels a pending cast.
    pub fn cancel_cast(&mut self, tx_id: &str) -> bool {
        match self.casts.cancel_cast(tx_id) {
            Some(cast) => {
                let now_ms = self.context.now_ms();
                self.append_cast_cancelled(&cast, "Cancelled by caller", now_ms);
                true
            }
            None => false,
        }
    }

    /// Cancels every cast of an agent (disconnect cleanup).
    pub fn cancel_all_casts_for_agent(&mut self, agent_id: &str) -> usize {
        let cancelled = self.casts.cancel_all_casts_for_agent(agent_id);
        let now_ms = self.context.now_ms();
        for cast in &cancelled {
            self.append_cast_cancelled(cast, "Cancelled by caller", now_ms);
        }
        cancelled.len()
    }

    /// Reads the event log for a poller.
    pub fn poll_events(&self, cursor: Option<&str>, limit: usize) -> EventPage {
        self.events.get_since_str(cursor, limit)
    }

    /// Appends an event raised by an outer layer (meetings, objects, ...).
    pub fn emit(&mut self, event_type: EventType, payload: serde_json::Value) -> EventCursor {
        let now_ms = self.context.now_ms();
        self.append(event_type, payload, now_ms)
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Runs one tick through every phase and returns its metrics.
    pub fn tick(&mut self) -> TickMetrics {
        let started = self.context.now();
        let now_ms = self.context.now_ms();
        self.tick_count += 1;

        // 1. Movement
        let dt = 1.0 / self.config.tick_rate_hz as f64;
        let moved = self.entities.integrate_movement(dt);

        // 2. Zones, then proximity
        let mut transitions = Vec::new();
        let positions: Vec<(String, f64, f64)> = self
            .entities
            .iter()
            .map(|e| (e.id.clone(), e.position.x, e.position.y))
            .collect();
        let zone_transitions = self.zones.update(
            positions.iter().map(|(id, x, y)| (id.as_str(), *x, *y)),
            Some(&mut transitions),
        );
        self.append_zone_transitions(transitions, now_ms);

        let proximity_changes = self.proximity.reconcile(&self.entities);
        self.append_proximity_changes(&proximity_changes, now_ms);

        // 3. Pending casts
        let resolutions = self.casts.process_pending_casts(&mut self.entities, now_ms);
        for resolution in &resolutions {
            self.append_resolution(resolution, now_ms);
        }
        self.append_applied_effects(now_ms);

        // 4. Effect expiration
        let expired = process_effect_expirations(&mut self.entities, now_ms);
        for gone in &expired {
            self.append(
                EventType::EffectExpired,
                json!({
                    "entityId": gone.entity_id,
                    "effectId": gone.effect.id,
                    "kind": gone.effect.kind,
                }),
                now_ms,
            );
        }

        // 5. Metrics
        let snapshot = TickMetrics {
            tick: self.tick_count,
            duration: self.context.now().saturating_sub(started),
            entities: self.entities.len(),
            moved,
            zone_transitions,
            proximity_changes: proximity_changes.len(),
            casts_resolved: resolutions.len(),
            pending_casts: self.casts.pending_count(),
            effects_expired: expired.len(),
            active_effects: self.entities.active_effect_count(),
            events_total: self.events.total_appended(),
        };
        self.metrics.record(snapshot.clone());
        snapshot
    }

    /// Runs event log retention if its interval has elapsed.
    ///
    /// Idle rate-limit history is dropped on the same interval.
    ///
    /// Returns the number of envelopes removed, if cleanup ran.
    pub fn maybe_cleanup(&mut self) -> Option<usize> {
        let interval = Duration::from_millis(self.config.event_log.cleanup_interval_ms);
        let now = self.context.now();
        if now.saturating_sub(self.last_cleanup) < interval {
            return None;
        }
        self.last_cleanup = now;
        let now_ms = self.context.now_ms();
        let removed = self.events.cleanup(now_ms);
        if removed > 0 {
            info!(room = %self.room_id, removed, "event log cleanup");
        }
        let idle = self.casts.sweep_rate_history(now_ms);
        if idle > 0 {
            debug!(room = %self.room_id, idle, "dropped idle rate-limit history");
        }
        Some(removed)
    }

    /// Runs `ticks` loop iterations (tick, cleanup, sleep).
    pub async fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step().await;
        }
    }

    /// Runs until a `Shutdown` command arrives or every handle is dropped.
    ///
    /// Commands are drained between ticks, so each runs to completion
    /// before the next tick phase begins.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<RoomCommand>) {
        info!(room = %self.room_id, name = %self.config.name, "room loop started");
        'running: loop {
            loop {
                match commands.try_recv() {
                    Ok(RoomCommand::Shutdown) => break 'running,
                    Ok(command) => self.handle_command(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break 'running,
                }
            }
            self.step().await;
        }
        info!(room = %self.room_id, ticks = self.tick_count, "room loop stopped");
    }

    async fn step(&mut self) {
        let interval = self.config.tick_interval();
        let started = self.context.now();

        self.tick();
        self.maybe_cleanup();

        let elapsed = self.context.now().saturating_sub(started);
        if elapsed < interval {
            self.context.sleep(interval - elapsed).await;
        } else {
            self.metrics.record_overrun();
            warn!(
                room = %self.room_id,
                tick = self.tick_count,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = interval.as_millis() as u64,
                "tick overran its budget; next tick runs late"
            );
        }
        // Virtual clocks complete `sleep` immediately; let senders run.
        tokio::task::yield_now().await;
    }

    /// Applies one command from a [`RoomHandle`](crate::handle::RoomHandle).
    ///
    /// Dropped reply receivers are ignored.
    pub fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { entity, reply } => {
                let _ = reply.send(self.join(entity));
            }
            RoomCommand::Leave { entity_id, reply } => {
                let _ = reply.send(self.leave(&entity_id));
            }
            RoomCommand::SetVelocity { entity_id, vx, vy, reply } => {
                let _ = reply.send(self.set_velocity(&entity_id, vx, vy));
            }
            RoomCommand::Say { entity_id, text, reply } => {
                let _ = reply.send(self.say(&entity_id, &text));
            }
            RoomCommand::Install { agent_id, ability_id, credentials, reply } => {
                let _ = reply.send(self.install_for_agent(&agent_id, &ability_id, credentials));
            }
            RoomCommand::Invoke { agent_id, ability_id, action_id, params, tx_id, reply } => {
                let outcome = self.invoke_action(&agent_id, &ability_id, &action_id, params, &tx_id);
                let _ = reply.send(outcome);
            }
            RoomCommand::CancelCast { tx_id, reply } => {
                let _ = reply.send(self.cancel_cast(&tx_id));
            }
            RoomCommand::PollEvents { cursor, limit, reply } => {
                let _ = reply.send(self.poll_events(cursor.as_deref(), limit));
            }
            RoomCommand::ZonePopulation { zone_id, reply } => {
                let _ = reply.send(self.zones.get_zone_population(&zone_id));
            }
            RoomCommand::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Event emission
    // ------------------------------------------------------------------

    fn append(&mut self, event_type: EventType, payload: serde_json::Value, now_ms: u64) -> EventCursor {
        self.events.append(event_type, self.room_id, payload, now_ms)
    }

    fn append_zone_transitions(&mut self, transitions: Vec<ZoneTransition>, now_ms: u64) {
        for transition in transitions {
            let (event_type, payload) = match transition {
                ZoneTransition::Exit { entity_id, zone_id, next_zone_id } => (
                    EventType::ZoneExit,
                    json!({ "entityId": entity_id, "zoneId": zone_id, "nextZoneId": next_zone_id }),
                ),
                ZoneTransition::Enter { entity_id, zone_id, previous_zone_id } => (
                    EventType::ZoneEnter,
                    json!({ "entityId": entity_id, "zoneId": zone_id, "previousZoneId": previous_zone_id }),
                ),
            };
            self.append(event_type, payload, now_ms);
        }
    }

    fn append_proximity_changes(&mut self, changes: &[ProximityChange], now_ms: u64) {
        for change in changes {
            let (event_type, a, b) = match change {
                ProximityChange::Enter { a, b } => (EventType::ProximityEnter, a, b),
                ProximityChange::Exit { a, b } => (EventType::ProximityExit, a, b),
            };
            self.append(event_type, json!({ "entityIds": [a, b] }), now_ms);
        }
    }

    fn append_resolution(&mut self, resolution: &CastResolution, now_ms: u64) {
        let event_type = match &resolution.outcome {
            ActionOutcome::Cancelled { .. } => EventType::AbilityCancelled,
            ActionOutcome::Error { .. } => EventType::AbilityFailed,
            _ => EventType::AbilityResolved,
        };
        self.append(
            event_type,
            json!({
                "txId": resolution.tx_id,
                "agentId": resolution.agent_id,
                "abilityId": resolution.ability_id,
                "actionId": resolution.action_id,
                "targetId": resolution.target_id,
                "outcome": resolution.outcome,
            }),
            now_ms,
        );
    }

    fn append_cast_cancelled(&mut self, cast: &PendingCast, reason: &str, now_ms: u64) {
        debug!(tx = %cast.tx_id, agent = %cast.source_entity_id, reason, "cast cancelled");
        self.append(
            EventType::AbilityCancelled,
            json!({
                "txId": cast.tx_id,
                "agentId": cast.source_entity_id,
                "abilityId": cast.ability_id,
                "actionId": cast.action_id,
                "targetId": cast.target_entity_id,
                "outcome": ActionOutcome::cancelled(reason),
            }),
            now_ms,
        );
    }

    fn append_applied_effects(&mut self, now_ms: u64) {
        let applied: Vec<AppliedEffect> = self.casts.take_applied_effects();
        for a in applied {
            self.append(
                EventType::EffectApplied,
                json!({
                    "txId": a.tx_id,
                    "entityId": a.target_entity_id,
                    "effect": a.effect,
                    "expiresAt": a.effect.expires_at_ms(),
                }),
                now_ms,
            );
        }
    }
}
