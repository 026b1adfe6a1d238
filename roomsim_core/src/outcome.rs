//! Tagged outcomes returned across the room boundary.
//!
//! Invocation failures are values, never errors propagated to the caller.
//! The wire shape is a `type`-discriminated object:
//!
//! ```text
//! {"type":"pending","txId":"tx-1","completionTime":1704067201000}
//! {"type":"error","message":"Already casting"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of an action invocation, cast resolution or object interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOutcome {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Pending {
        #[serde(rename = "txId")]
        tx_id: String,
        /// Unix epoch milliseconds
        #[serde(rename = "completionTime")]
        completion_time: u64,
    },
    Cancelled {
        reason: String,
    },
    Error {
        message: String,
    },
    NoEffect {
        message: String,
    },
    TooFar {
        message: String,
    },
    InvalidAction {
        message: String,
    },
}

impl ActionOutcome {
    /// Generic success with no payload.
    pub fn ok() -> Self {
        ActionOutcome::Ok {
            message: None,
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        ActionOutcome::Ok {
            message: Some(message.into()),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ActionOutcome::Error {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        ActionOutcome::Cancelled {
            reason: reason.into(),
        }
    }

    /// Wire tag (`ok`, `pending`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            ActionOutcome::Ok { .. } => "ok",
            ActionOutcome::Pending { .. } => "pending",
            ActionOutcome::Cancelled { .. } => "cancelled",
            ActionOutcome::Error { .. } => "error",
            ActionOutcome::NoEffect { .. } => "no_effect",
            ActionOutcome::TooFar { .. } => "too_far",
            ActionOutcome::InvalidAction { .. } => "invalid_action",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ActionOutcome::Ok { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ActionOutcome::Pending { .. })
    }
}

/// Why an invocation was rejected during validation.
///
/// All of these are recoverable: the caller may retry later.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CastRejection {
    #[error("Rate limited: at most {max} actions per {window_ms}ms")]
    RateLimited { max: usize, window_ms: u64 },

    #[error("Already casting")]
    AlreadyCasting,

    #[error("Unknown ability: {0}")]
    UnknownAbility(String),

    #[error("Unknown action {action_id} for ability {ability_id}")]
    UnknownAction { ability_id: String, action_id: String },

    #[error("Ability {0} is not installed")]
    NotInstalled(String),

    #[error("Ability {0} is disabled")]
    Disabled(String),

    #[error("Source entity {0} not found")]
    SourceMissing(String),

    #[error("Ability on cooldown ({remaining_secs}s remaining)")]
    Cooldown { remaining_secs: u64 },

    #[error("Target entity {0} not found")]
    TargetMissing(String),

    #[error("Target out of range ({distance:.1} > {range:.1})")]
    OutOfRange { distance: f64, range: f64 },
}

impl From<CastRejection> for ActionOutcome {
    fn from(rejection: CastRejection) -> Self {
        ActionOutcome::error(rejection.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_wire_shape() {
        let outcome = ActionOutcome::Pending {
            tx_id: "tx-1".to_string(),
            completion_time: 2_000,
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"type": "pending", "txId": "tx-1", "completionTime": 2000})
        );
    }

    #[test]
    fn test_object_interaction_variants_share_shape() {
        let too_far: ActionOutcome =
            serde_json::from_value(json!({"type": "too_far", "message": "Walk closer"})).unwrap();
        assert_eq!(too_far.kind(), "too_far");
        assert_eq!(
            serde_json::to_value(ActionOutcome::ok()).unwrap(),
            json!({"type": "ok"})
        );
    }

    #[test]
    fn test_rejection_becomes_error_outcome() {
        let outcome: ActionOutcome = CastRejection::Cooldown { remaining_secs: 4 }.into();
        assert_eq!(
            outcome,
            ActionOutcome::error("Ability on cooldown (4s remaining)")
        );
    }
}
