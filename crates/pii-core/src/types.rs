use serde::{Deserialize, Serialize};

/// Speaker role on one utterance, normalized uppercase with `CUSTOMER`
/// folded into `END_USER` at the dispatcher boundary (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantRole {
    Agent,
    EndUser,
}

impl ParticipantRole {
    /// Parse a raw, possibly lowercase or `CUSTOMER`-spelled role string.
    /// Returns `None` for anything else — callers treat that as "unknown
    /// role", which is a warn-and-skip outcome, not a shape error.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_uppercase().as_str() {
            "AGENT" => Some(ParticipantRole::Agent),
            "END_USER" | "CUSTOMER" => Some(ParticipantRole::EndUser),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Agent => "AGENT",
            ParticipantRole::EndUser => "END_USER",
        }
    }
}

/// One conversational turn, as carried on the raw and redacted buses and as
/// persisted by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub conversation_id: String,
    pub original_entry_index: u64,
    pub participant_role: String,
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub start_timestamp_usec: i64,
}

impl Utterance {
    /// The fields that must be present and non-empty for a raw-utterance
    /// envelope to be accepted (§4.1 "Input"). `user_id` is deliberately
    /// excluded.
    pub fn validate_shape(&self) -> std::result::Result<(), String> {
        if self.conversation_id.trim().is_empty() {
            return Err("missing conversation_id".into());
        }
        if self.participant_role.trim().is_empty() {
            return Err("missing participant_role".into());
        }
        Ok(())
    }
}

/// Short-lived hint written by the redactor's agent-turn endpoint and
/// consulted by its customer-turn endpoint. Advisory only — absence must
/// never raise an error (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionContext {
    pub expected_pii_type: String,
    pub timestamp: f64,
}

impl RedactionContext {
    pub fn new(expected_pii_type: impl Into<String>, now: f64) -> Self {
        Self {
            expected_pii_type: expected_pii_type.into(),
            timestamp: now,
        }
    }
}

/// A `conversation_started` / `conversation_ended` signal from the
/// lifecycle bus (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub conversation_id: String,
    pub event_type: String,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub total_utterance_count: Option<u64>,
}

impl LifecycleEvent {
    pub fn is_conversation_ended(&self) -> bool {
        self.event_type == "conversation_ended"
    }
}

/// One flattened entry inside an [`ArchivalArtifact`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivalEntry {
    pub text: String,
    pub role: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The JSON object written to the blob store under
/// `<conversation_id>_transcript.json` (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivalArtifact {
    pub entries: Vec<ArchivalEntry>,
}

/// A persisted per-utterance record, as stored under
/// `conversations/<conversation_id>/utterances/<original_entry_index>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedUtterance {
    pub conversation_id: String,
    pub original_entry_index: u64,
    pub participant_role: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub text: String,
    pub start_timestamp_usec: i64,
    pub received_at: String,
}

/// The `conversations_in_progress/<conversation_id>` root record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRoot {
    pub conversation_id: String,
    pub utterance_count: u64,
    pub last_utterance_timestamp: i64,
    pub expire_at: i64,
}
