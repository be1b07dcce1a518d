use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Clinician,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Clinician => "clinician",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(Role::Patient),
            "clinician" => Ok(Role::Clinician),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// One message in a conversation. Immutable once appended to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub conversation_id: String,
    pub patient_id: String,
    pub turn_index: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append input: the log assigns `turn_index` unless the caller
/// pre-assigned one, in which case it must equal the next index.
#[derive(Debug, Clone)]
pub struct TurnDraft {
    pub conversation_id: String,
    pub patient_id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub turn_index: Option<u64>,
}

impl TurnDraft {
    pub fn new(
        conversation_id: impl Into<String>,
        patient_id: impl Into<String>,
        role: Role,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            patient_id: patient_id.into(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            turn_index: None,
        }
    }

    pub fn at_index(mut self, index: u64) -> Self {
        self.turn_index = Some(index);
        self
    }
}
