//! Cross-task access to a running room.
//!
//! A [`RoomHandle`] sends [`RoomCommand`]s over a bounded channel; the room
//! loop drains them between ticks and answers on a oneshot.

use roomsim_env::{RoomContext, RoomId};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

use crate::casting::InvokeParams;
use crate::entity::{Entity, EntityId};
use crate::event_log::{EventCursor, EventPage};
use crate::outcome::ActionOutcome;
use crate::room::{Room, RoomError};

/// Commands queued for a running room.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        entity: Entity,
        reply: oneshot::Sender<bool>,
    },
    Leave {
        entity_id: EntityId,
        reply: oneshot::Sender<bool>,
    },
    SetVelocity {
        entity_id: EntityId,
        vx: f64,
        vy: f64,
        reply: oneshot::Sender<bool>,
    },
    Say {
        entity_id: EntityId,
        text: String,
        reply: oneshot::Sender<Option<EventCursor>>,
    },
    Install {
        agent_id: EntityId,
        ability_id: String,
        credentials: Option<BTreeMap<String, String>>,
        reply: oneshot::Sender<bool>,
    },
    Invoke {
        agent_id: EntityId,
        ability_id: String,
        action_id: String,
        params: InvokeParams,
        tx_id: String,
        reply: oneshot::Sender<ActionOutcome>,
    },
    CancelCast {
        tx_id: String,
        reply: oneshot::Sender<bool>,
    },
    PollEvents {
        cursor: Option<String>,
        limit: usize,
        reply: oneshot::Sender<EventPage>,
    },
    ZonePopulation {
        zone_id: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Default command queue depth.
pub const COMMAND_QUEUE_DEPTH: usize = 256;

/// Cloneable sender side of a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Creates a handle and the receiver the room loop drains.
    pub fn channel(room_id: RoomId) -> (Self, mpsc::Receiver<RoomCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        (Self { room_id, tx }, rx)
    }

    /// Moves `room` onto its context's executor and returns a handle to it.
    ///
    /// The loop yields once per tick, so this also works with contexts
    /// whose `sleep` never suspends (a virtual clock on a current-thread
    /// runtime).
    pub fn spawn<Ctx: RoomContext>(mut room: Room<Ctx>) -> Self {
        let (handle, rx) = Self::channel(room.room_id());
        let context = room.context().clone();
        let task_name = format!("room-{}", room.room_id());
        context.spawn(&task_name, async move {
            room.run(rx).await;
        });
        handle
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RoomError::Closed(self.room_id))?;
        rx.await.map_err(|_| RoomError::Closed(self.room_id))
    }

    pub async fn join(&self, entity: Entity) -> Result<bool, RoomError> {
        self.request(|reply| RoomCommand::Join { entity, reply }).await
    }

    pub async fn leave(&self, entity_id: impl Into<EntityId>) -> Result<bool, RoomError> {
        let entity_id = entity_id.into();
        self.request(|reply| RoomCommand::Leave { entity_id, reply }).await
    }

    pub async fn set_velocity(&self, entity_id: impl Into<EntityId>, vx: f64, vy: f64) -> Result<bool, RoomError> {
        let entity_id = entity_id.into();
        self.request(|reply| RoomCommand::SetVelocity { entity_id, vx, vy, reply })
            .await
    }

    pub async fn say(
        &self,
        entity_id: impl Into<EntityId>,
        text: impl Into<String>,
    ) -> Result<Option<EventCursor>, RoomError> {
        let (entity_id, text) = (entity_id.into(), text.into());
        self.request(|reply| RoomCommand::Say { entity_id, text, reply }).await
    }

    pub async fn install_for_agent(
        &self,
        agent_id: impl Into<EntityId>,
        ability_id: impl Into<String>,
        credentials: Option<BTreeMap<String, String>>,
    ) -> Result<bool, RoomError> {
        let (agent_id, ability_id) = (agent_id.into(), ability_id.into());
        self.request(|reply| RoomCommand::Install {
            agent_id,
            ability_id,
            credentials,
            reply,
        })
        .await
    }

    pub async fn invoke_action(
        &self,
        agent_id: impl Into<EntityId>,
        ability_id: impl Into<String>,
        action_id: impl Into<String>,
        params: InvokeParams,
        tx_id: impl Into<String>,
    ) -> Result<ActionOutcome, RoomError> {
        let (agent_id, ability_id, action_id, tx_id) =
            (agent_id.into(), ability_id.into(), action_id.into(), tx_id.into());
        self.request(|reply| RoomCommand::Invoke {
            agent_id,
            ability_id,
            action_id,
            params,
            tx_id,
            reply,
        })
        .await
    }

    pub async fn cancel_cast(&self, tx_id: impl Into<String>) -> Result<bool, RoomError> {
        let tx_id = tx_id.into();
        self.request(|reply| RoomCommand::CancelCast { tx_id, reply }).await
    }

    pub async fn poll_events(&self, cursor: Option<String>, limit: usize) -> Result<EventPage, RoomError> {
        self.request(|reply| RoomCommand::PollEvents { cursor, limit, reply })
            .await
    }

    pub async fn zone_population(&self, zone_id: impl Into<String>) -> Result<usize, RoomError> {
        let zone_id = zone_id.into();
        self.request(|reply| RoomCommand::ZonePopulation { zone_id, reply })
            .await
    }

    /// Asks the room loop to stop after the current tick.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.tx
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| RoomError::Closed(self.room_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;
    use crate::room::RoomConfig;
    use crate::zones::Zone;
    use roomsim_env::TokioContext;

    #[tokio::test]
    async fn test_handle_round_trips_commands() {
        let config = RoomConfig::default()
            .with_tick_rate(100)
            .with_zone(Zone::new("plaza", 0.0, 0.0, 100.0, 100.0));
        let room = Room::new(RoomId::from_seed(9), TokioContext::shared(), config).unwrap();
        let handle = RoomHandle::spawn(room);

        assert!(handle.join(Entity::new("alice", EntityKind::Player, 5.0, 5.0)).await.unwrap());
        assert_eq!(handle.zone_population("plaza").await.unwrap(), 1);
        assert!(handle.say("alice", "hi").await.unwrap().is_some());

        let page = handle.poll_events(None, 10).await.unwrap();
        let types: Vec<String> = page.events.iter().map(|e| e.event_type.to_string()).collect();
        assert_eq!(types, vec!["presence.join", "zone.enter", "chat.message"]);

        handle.shutdown().await.unwrap();
        // The loop exits and drops the receiver.
        for _ in 0..100 {
            if handle.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(handle.is_closed());
        assert!(matches!(handle.leave("alice").await, Err(RoomError::Closed(_))));
    }
}
