//! Per-call session state: identity, status, conversation history.

use crate::pipeline::metrics::SessionMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque call identifier assigned by the telephony provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Generate a fresh random call id (used by in-process telephony fakes).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Lifecycle status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    Connected,
    /// Media is flowing and the orchestrator is driving turns.
    Active,
    Ended,
    Failed,
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Agent,
}

/// One entry in the ordered conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: SpeakerRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// State for one active call.
///
/// Owned exclusively by the session orchestrator task; other components
/// see it only through messages.
#[derive(Debug)]
pub struct CallSession {
    pub id: CallId,
    /// Caller identifier (phone number or provider handle).
    pub caller: String,
    /// Prospect name when known, for personalised greetings and fillers.
    pub prospect_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: CallStatus,
    /// Ordered user/agent turns. A user turn is always followed by its
    /// agent turn (when one was produced).
    pub history: Vec<ConversationTurn>,
    pub metrics: SessionMetrics,
}

impl CallSession {
    pub fn new(id: CallId, caller: impl Into<String>) -> Self {
        Self {
            id,
            caller: caller.into(),
            prospect_name: None,
            started_at: Utc::now(),
            status: CallStatus::Initiating,
            history: Vec::new(),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn with_prospect_name(mut self, name: impl Into<String>) -> Self {
        self.prospect_name = Some(name.into());
        self
    }

    /// Append a turn to the conversation history.
    pub fn record_turn(&mut self, role: SpeakerRole, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.history.push(ConversationTurn {
            role,
            text,
            timestamp: Utc::now(),
        });
    }

    /// Remove the most recent entry if it is a user turn.
    ///
    /// A continuation cancels the turn cheaply and re-aggregates the
    /// merged text; the retracted entry comes back as part of the merged
    /// utterance, so keeping it would duplicate the caller's words.
    pub fn retract_last_user_turn(&mut self) {
        if self.history.last().is_some_and(|t| t.role == SpeakerRole::User) {
            let _ = self.history.pop();
        }
    }

    /// Number of completed user turns so far (drives filler stage choice).
    pub fn user_turn_count(&self) -> usize {
        self.history
            .iter()
            .filter(|t| t.role == SpeakerRole::User)
            .count()
    }
}
