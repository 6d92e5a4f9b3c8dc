use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub context: Value,
    pub clinic_id: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Pairing,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    /// `pairing` and `connected` both hold transport resources.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pairing | Self::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub agent_id: String,
    pub channel: Option<String>,
    pub status: ConnectionStatus,
    pub pairing_artifact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub agent_id: String,
    pub counterparty: String,
}

impl ConversationKey {
    pub fn new(agent_id: impl Into<String>, counterparty: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            counterparty: counterparty.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.counterparty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub counterparty: String,
    pub last_message_preview: String,
    pub unread_count: u32,
    pub needs_human: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub content: String,
    pub provider_message_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A message about to be appended to a conversation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: Direction,
    pub content: String,
    pub provider_message_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTurn {
    pub role: TurnRole,
    pub text: String,
    #[serde(default)]
    pub intent: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Patient,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub key: ConversationKey,
    pub turns: VecDeque<MemoryTurn>,
    pub summary: Option<String>,
    pub turns_since_summary: u32,
    pub total_turns: u64,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn empty(key: ConversationKey) -> Self {
        Self {
            key,
            turns: VecDeque::new(),
            summary: None,
            turns_since_summary: 0,
            total_turns: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalizationProfile {
    pub key: ConversationKey,
    pub preferred_name: Option<String>,
    pub language: Option<String>,
    pub preferences: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub interaction_count: u64,
    pub last_intent: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PersonalizationProfile {
    pub fn empty(key: ConversationKey) -> Self {
        Self {
            key,
            preferred_name: None,
            language: None,
            preferences: BTreeMap::new(),
            tags: BTreeSet::new(),
            interaction_count: 0,
            last_intent: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub id: String,
    pub clinic_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_importance() -> f32 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence,
    BackendFailure,
    EscalationRequest,
}

impl EscalationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::BackendFailure => "backend_failure",
            Self::EscalationRequest => "escalation_request",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    pub id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub counterparty: String,
    pub reason: EscalationReason,
    pub intent: String,
    pub score: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBody {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub agent_id: String,
    pub status: ConnectionStatus,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub active_conversations: usize,
    pub sessions: Vec<SessionSummary>,
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut clipped = trimmed.chars().take(max_chars).collect::<String>();
    clipped.push('…');
    clipped
}
