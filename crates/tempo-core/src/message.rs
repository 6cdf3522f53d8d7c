use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::ids::{DeviceId, ServerSessionId};
use crate::session::{SessionKind, SessionStatus};

/// Topic carrying timer state changes between a user's devices.
pub const TIMER_UPDATE: &str = "timer_update";

/// Realtime wire envelope.
///
/// The dashboard backend names the payload `data` and the timestamp
/// `timestamp`; both spellings are accepted on decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,
    #[serde(
        rename = "serverTimestamp",
        alias = "timestamp",
        alias = "server_timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            server_timestamp: None,
        }
    }

    pub fn decode(frame: &str) -> Result<Self, SyncError> {
        serde_json::from_str(frame)
            .map_err(|e| SyncError::Protocol(format!("malformed frame: {e}")))
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn timer_update(update: &TimerUpdate) -> Result<Self, SyncError> {
        let payload =
            serde_json::to_value(update).map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(Self::new(TIMER_UPDATE, payload))
    }
}

/// Payload of a `timer_update` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<ServerSessionId>,
    pub status: SessionStatus,
    pub remaining_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<SessionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_planned: Option<u32>,
    /// Device that produced the change, used to skip our own echoes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TimerUpdate {
    /// Decode the payload and resolve the timestamp used for reconciliation:
    /// the envelope's server timestamp, falling back to the payload's
    /// `updated_at`.
    pub fn from_message(message: &Message) -> Result<(Self, DateTime<Utc>), SyncError> {
        if message.topic != TIMER_UPDATE {
            return Err(SyncError::Protocol(format!(
                "expected {TIMER_UPDATE}, got {}",
                message.topic
            )));
        }
        let update: Self = serde_json::from_value(message.payload.clone())
            .map_err(|e| SyncError::Protocol(format!("bad timer_update payload: {e}")))?;
        let at = message
            .server_timestamp
            .or(update.updated_at)
            .ok_or_else(|| SyncError::Protocol("timer_update without timestamp".into()))?;
        Ok((update, at))
    }
}
