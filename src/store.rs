use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::types::*;

const PREVIEW_CHARS: usize = 120;

/// Result of appending a message to a conversation.
#[derive(Debug, Clone)]
pub enum Appended {
    Stored { conversation: Conversation },
    /// The provider message id was already recorded for this conversation.
    Duplicate,
}

/// Narrow persistence contract the gateway needs from the clinic database.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn agent(&self, agent_id: &str) -> Result<Option<Agent>>;

    async fn upsert_conversation(&self, key: &ConversationKey) -> Result<Conversation>;

    async fn has_message(&self, key: &ConversationKey, provider_message_id: &str) -> Result<bool>;

    /// Append-only insert; also refreshes the conversation preview, unread
    /// counter and activity timestamp, creating the conversation if needed.
    async fn append_message(&self, key: &ConversationKey, message: NewMessage) -> Result<Appended>;

    async fn mark_needs_human(&self, key: &ConversationKey) -> Result<()>;

    async fn insert_escalation(&self, record: &EscalationRecord) -> Result<()>;

    async fn load_memory(&self, key: &ConversationKey) -> Result<Option<MemoryRecord>>;

    /// Stores the record keeping only its newest `window` turns.
    async fn save_memory(&self, record: &MemoryRecord, window: usize) -> Result<()>;

    async fn load_profile(&self, key: &ConversationKey) -> Result<Option<PersonalizationProfile>>;

    async fn save_profile(&self, profile: &PersonalizationProfile) -> Result<()>;

    async fn knowledge(&self, clinic_id: &str) -> Result<Vec<KnowledgeEntry>>;

    async fn ping(&self) -> bool;
}

pub(crate) fn apply_message_to_conversation(conversation: &mut Conversation, message: &ChatMessage) {
    conversation.last_message_preview = preview(&message.content, PREVIEW_CHARS);
    conversation.last_activity_at = message.created_at;
    if message.direction == Direction::Received {
        conversation.unread_count = conversation.unread_count.saturating_add(1);
    }
}

pub(crate) fn trim_window(record: &MemoryRecord, window: usize) -> MemoryRecord {
    let mut trimmed = record.clone();
    while trimmed.turns.len() > window {
        trimmed.turns.pop_front();
    }
    trimmed
}

/// Agents and knowledge entries preloaded into a [`MemoryStore`] when the
/// gateway runs without a database.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeEntry>,
}

impl Seed {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            GatewayError::Store(format!("cannot read seed file {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            GatewayError::Store(format!("invalid seed file {}: {err}", path.display()))
        })
    }
}

#[derive(Default)]
struct MemoryTables {
    agents: HashMap<String, Agent>,
    conversations: HashMap<ConversationKey, Conversation>,
    messages: HashMap<String, Vec<ChatMessage>>,
    escalations: Vec<EscalationRecord>,
    memory: HashMap<ConversationKey, MemoryRecord>,
    profiles: HashMap<ConversationKey, PersonalizationProfile>,
    knowledge: Vec<KnowledgeEntry>,
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seeded(seed: Seed) -> Self {
        let store = Self::new();
        for agent in seed.agents {
            store.insert_agent(agent).await;
        }
        for entry in seed.knowledge {
            store.insert_knowledge(entry).await;
        }
        store
    }

    pub async fn insert_agent(&self, agent: Agent) {
        self.tables
            .write()
            .await
            .agents
            .insert(agent.id.clone(), agent);
    }

    pub async fn insert_knowledge(&self, entry: KnowledgeEntry) {
        self.tables.write().await.knowledge.push(entry);
    }

    #[cfg(test)]
    pub async fn find_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        Ok(self.tables.read().await.conversations.get(key).cloned())
    }

    #[cfg(test)]
    pub async fn messages(&self, key: &ConversationKey) -> Result<Vec<ChatMessage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .conversations
            .get(key)
            .and_then(|c| tables.messages.get(&c.id))
            .cloned()
            .unwrap_or_default())
    }

    #[cfg(test)]
    pub async fn escalations(&self, conversation_id: &str) -> Result<Vec<EscalationRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .escalations
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    fn ensure_conversation<'a>(
        tables: &'a mut MemoryTables,
        key: &ConversationKey,
    ) -> &'a mut Conversation {
        tables.conversations.entry(key.clone()).or_insert_with(|| {
            let now = Utc::now();
            Conversation {
                id: Uuid::new_v4().to_string(),
                agent_id: key.agent_id.clone(),
                counterparty: key.counterparty.clone(),
                last_message_preview: String::new(),
                unread_count: 0,
                needs_human: false,
                created_at: now,
                last_activity_at: now,
            }
        })
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        Ok(self.tables.read().await.agents.get(agent_id).cloned())
    }

    async fn upsert_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let mut tables = self.tables.write().await;
        Ok(Self::ensure_conversation(&mut tables, key).clone())
    }

    async fn has_message(&self, key: &ConversationKey, provider_message_id: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        let Some(conversation) = tables.conversations.get(key) else {
            return Ok(false);
        };
        Ok(tables
            .messages
            .get(&conversation.id)
            .map(|messages| {
                messages
                    .iter()
                    .any(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
            })
            .unwrap_or(false))
    }

    async fn append_message(&self, key: &ConversationKey, message: NewMessage) -> Result<Appended> {
        let mut tables = self.tables.write().await;
        let conversation_id = Self::ensure_conversation(&mut tables, key).id.clone();

        let log = tables.messages.entry(conversation_id.clone()).or_default();
        if let Some(provider_id) = message.provider_message_id.as_deref() {
            if log
                .iter()
                .any(|m| m.provider_message_id.as_deref() == Some(provider_id))
            {
                return Ok(Appended::Duplicate);
            }
        }

        let stored = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            direction: message.direction,
            content: message.content,
            provider_message_id: message.provider_message_id,
            metadata: message.metadata,
            created_at: message.created_at,
        };
        log.push(stored.clone());

        let conversation = Self::ensure_conversation(&mut tables, key);
        apply_message_to_conversation(conversation, &stored);
        Ok(Appended::Stored {
            conversation: conversation.clone(),
        })
    }

    async fn mark_needs_human(&self, key: &ConversationKey) -> Result<()> {
        let mut tables = self.tables.write().await;
        Self::ensure_conversation(&mut tables, key).needs_human = true;
        Ok(())
    }

    async fn insert_escalation(&self, record: &EscalationRecord) -> Result<()> {
        self.tables.write().await.escalations.push(record.clone());
        Ok(())
    }

    async fn load_memory(&self, key: &ConversationKey) -> Result<Option<MemoryRecord>> {
        Ok(self.tables.read().await.memory.get(key).cloned())
    }

    async fn save_memory(&self, record: &MemoryRecord, window: usize) -> Result<()> {
        self.tables
            .write()
            .await
            .memory
            .insert(record.key.clone(), trim_window(record, window));
        Ok(())
    }

    async fn load_profile(&self, key: &ConversationKey) -> Result<Option<PersonalizationProfile>> {
        Ok(self.tables.read().await.profiles.get(key).cloned())
    }

    async fn save_profile(&self, profile: &PersonalizationProfile) -> Result<()> {
        self.tables
            .write()
            .await
            .profiles
            .insert(profile.key.clone(), profile.clone());
        Ok(())
    }

    async fn knowledge(&self, clinic_id: &str) -> Result<Vec<KnowledgeEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .knowledge
            .iter()
            .filter(|entry| entry.clinic_id == clinic_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbound(text: &str, provider_id: &str) -> NewMessage {
        NewMessage {
            direction: Direction::Received,
            content: text.to_string(),
            provider_message_id: Some(provider_id.to_string()),
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_creates_conversation_lazily_and_counts_unread() {
        let store = MemoryStore::new();
        let key = ConversationKey::new("a1", "5511999990000");
        assert!(store.find_conversation(&key).await.unwrap().is_none());

        store.append_message(&key, inbound("oi", "m1")).await.unwrap();
        store.append_message(&key, inbound("tudo bem?", "m2")).await.unwrap();

        let conversation = store.find_conversation(&key).await.unwrap().unwrap();
        assert_eq!(conversation.unread_count, 2);
        assert_eq!(conversation.last_message_preview, "tudo bem?");
    }

    #[tokio::test]
    async fn duplicate_provider_id_is_not_appended() {
        let store = MemoryStore::new();
        let key = ConversationKey::new("a1", "5511");
        store.append_message(&key, inbound("hi", "dup")).await.unwrap();
        let second = store.append_message(&key, inbound("hi", "dup")).await.unwrap();

        assert!(matches!(second, Appended::Duplicate));
        assert_eq!(store.messages(&key).await.unwrap().len(), 1);
        assert!(store.has_message(&key, "dup").await.unwrap());
    }

    #[tokio::test]
    async fn seed_file_loads_agents_and_knowledge() {
        let path = std::env::temp_dir().join(format!("clinic-seed-{}.json", Uuid::new_v4()));
        let seed = json!({
            "agents": [{
                "id": "a1",
                "name": "Sofia",
                "clinicId": "c1",
                "context": { "clinic": { "name": "Clínica Sorriso" } }
            }],
            "knowledge": [{
                "id": "k1",
                "clinicId": "c1",
                "title": "Convênios",
                "content": "Aceitamos Unimed.",
                "tags": ["insurance"]
            }]
        });
        tokio::fs::write(&path, seed.to_string()).await.unwrap();

        let store = MemoryStore::seeded(Seed::from_file(&path).await.unwrap()).await;
        tokio::fs::remove_file(&path).await.unwrap();

        let agent = store.agent("a1").await.unwrap().unwrap();
        assert!(agent.active);
        assert_eq!(agent.clinic_id, "c1");
        let knowledge = store.knowledge("c1").await.unwrap();
        assert_eq!(knowledge.len(), 1);
        assert_eq!(knowledge[0].importance, 1.0);
        assert!(store.knowledge("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_or_malformed_seed_is_a_store_error() {
        let missing = std::env::temp_dir().join(format!("clinic-seed-{}.json", Uuid::new_v4()));
        assert!(matches!(Seed::from_file(&missing).await, Err(GatewayError::Store(_))));

        let path = std::env::temp_dir().join(format!("clinic-seed-{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, r#"{ "agents": [{ "id": "a1" }] }"#).await.unwrap();
        let result = Seed::from_file(&path).await;
        tokio::fs::remove_file(&path).await.unwrap();
        assert!(matches!(result, Err(GatewayError::Store(_))));
    }

    #[tokio::test]
    async fn save_memory_keeps_newest_turns_within_window() {
        let store = MemoryStore::new();
        let key = ConversationKey::new("a1", "5511");
        let mut record = MemoryRecord::empty(key.clone());
        for i in 0..5 {
            record.turns.push_back(MemoryTurn {
                role: TurnRole::Patient,
                text: format!("turn {i}"),
                intent: None,
                at: Utc::now(),
            });
        }
        store.save_memory(&record, 3).await.unwrap();

        let loaded = store.load_memory(&key).await.unwrap().unwrap();
        let texts = loaded.turns.iter().map(|t| t.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
    }
}
