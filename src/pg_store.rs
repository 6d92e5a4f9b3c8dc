use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::store::{trim_window, Appended, ConversationStore};
use crate::types::*;

/// Postgres-backed store. The schema is provisioned by the clinic platform;
/// this type only reads and writes it.
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn parse_conversation_row(row: &PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        counterparty: row.get("counterparty"),
        last_message_preview: row.get("last_message_preview"),
        unread_count: row.get::<i32, _>("unread_count").max(0) as u32,
        needs_human: row.get("needs_human"),
        created_at: row.get("created_at"),
        last_activity_at: row.get("last_activity_at"),
    }
}

fn parse_message_row(row: &PgRow) -> ChatMessage {
    let direction = match row.get::<String, _>("direction").as_str() {
        "sent" => Direction::Sent,
        _ => Direction::Received,
    };
    ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        direction,
        content: row.get("content"),
        provider_message_id: row.get("provider_message_id"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|err| GatewayError::Store(format!("corrupt {what}: {err}")))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| GatewayError::Store(err.to_string()))
}

const CONVERSATION_COLUMNS: &str = "id, agent_id, counterparty, last_message_preview, unread_count, \
     needs_human, created_at, last_activity_at";

#[async_trait]
impl ConversationStore for PgStore {
    async fn agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, name, COALESCE(personality, '') AS personality, temperature, \
                    COALESCE(context, '{}'::jsonb) AS context, clinic_id, active \
             FROM agents WHERE id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| Agent {
            id: row.get("id"),
            name: row.get("name"),
            personality: row.get("personality"),
            temperature: row.get("temperature"),
            context: row.get("context"),
            clinic_id: row.get("clinic_id"),
            active: row.get("active"),
        }))
    }

    async fn upsert_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO conversations \
                (id, agent_id, counterparty, last_message_preview, unread_count, needs_human, created_at, last_activity_at) \
             VALUES ($1, $2, $3, '', 0, false, $4, $4) \
             ON CONFLICT (agent_id, counterparty) DO UPDATE SET agent_id = EXCLUDED.agent_id \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&key.agent_id)
        .bind(&key.counterparty)
        .bind(now)
        .fetch_one(&self.db)
        .await?;
        Ok(parse_conversation_row(&row))
    }

    async fn has_message(&self, key: &ConversationKey, provider_message_id: &str) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM messages m \
             INNER JOIN conversations c ON c.id = m.conversation_id \
             WHERE c.agent_id = $1 AND c.counterparty = $2 AND m.provider_message_id = $3 \
             LIMIT 1",
        )
        .bind(&key.agent_id)
        .bind(&key.counterparty)
        .bind(provider_message_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(found.is_some())
    }

    async fn append_message(&self, key: &ConversationKey, message: NewMessage) -> Result<Appended> {
        let conversation = self.upsert_conversation(key).await?;
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO messages \
                (id, conversation_id, direction, content, provider_message_id, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (conversation_id, provider_message_id) DO NOTHING \
             RETURNING id, conversation_id, direction, content, provider_message_id, metadata, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&conversation.id)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(&message.provider_message_id)
        .bind(&message.metadata)
        .bind(message.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            return Ok(Appended::Duplicate);
        };
        let stored = parse_message_row(&row);

        let unread_increment = i32::from(stored.direction == Direction::Received);
        let row = sqlx::query(&format!(
            "UPDATE conversations \
             SET last_message_preview = $2, unread_count = unread_count + $3, last_activity_at = $4 \
             WHERE id = $1 \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(&conversation.id)
        .bind(preview(&stored.content, 120))
        .bind(unread_increment)
        .bind(stored.created_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Appended::Stored {
            conversation: parse_conversation_row(&row),
        })
    }

    async fn mark_needs_human(&self, key: &ConversationKey) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET needs_human = true WHERE agent_id = $1 AND counterparty = $2",
        )
        .bind(&key.agent_id)
        .bind(&key.counterparty)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn insert_escalation(&self, record: &EscalationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO escalations \
                (id, conversation_id, agent_id, counterparty, reason, intent, score, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.agent_id)
        .bind(&record.counterparty)
        .bind(record.reason.as_str())
        .bind(&record.intent)
        .bind(record.score)
        .bind(record.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_memory(&self, key: &ConversationKey) -> Result<Option<MemoryRecord>> {
        let record: Option<Value> = sqlx::query_scalar(
            "SELECT record FROM memory_records WHERE agent_id = $1 AND counterparty = $2",
        )
        .bind(&key.agent_id)
        .bind(&key.counterparty)
        .fetch_optional(&self.db)
        .await?;
        record.map(|value| decode_json(value, "memory record")).transpose()
    }

    async fn save_memory(&self, record: &MemoryRecord, window: usize) -> Result<()> {
        let trimmed = trim_window(record, window);
        sqlx::query(
            "INSERT INTO memory_records (agent_id, counterparty, record, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (agent_id, counterparty) \
             DO UPDATE SET record = EXCLUDED.record, updated_at = EXCLUDED.updated_at",
        )
        .bind(&trimmed.key.agent_id)
        .bind(&trimmed.key.counterparty)
        .bind(encode_json(&trimmed)?)
        .bind(trimmed.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn load_profile(&self, key: &ConversationKey) -> Result<Option<PersonalizationProfile>> {
        let profile: Option<Value> = sqlx::query_scalar(
            "SELECT profile FROM personalization_profiles WHERE agent_id = $1 AND counterparty = $2",
        )
        .bind(&key.agent_id)
        .bind(&key.counterparty)
        .fetch_optional(&self.db)
        .await?;
        profile.map(|value| decode_json(value, "profile")).transpose()
    }

    async fn save_profile(&self, profile: &PersonalizationProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO personalization_profiles (agent_id, counterparty, profile, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (agent_id, counterparty) \
             DO UPDATE SET profile = EXCLUDED.profile, updated_at = EXCLUDED.updated_at",
        )
        .bind(&profile.key.agent_id)
        .bind(&profile.key.counterparty)
        .bind(encode_json(profile)?)
        .bind(profile.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn knowledge(&self, clinic_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let rows = sqlx::query(
            "SELECT id, clinic_id, title, content, COALESCE(tags, '{}') AS tags, \
                    COALESCE(category, '') AS category, COALESCE(importance, 1.0::real) AS importance, updated_at \
             FROM knowledge_entries WHERE clinic_id = $1",
        )
        .bind(clinic_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| KnowledgeEntry {
                id: row.get("id"),
                clinic_id: row.get("clinic_id"),
                title: row.get("title"),
                content: row.get("content"),
                tags: row.get::<Vec<String>, _>("tags"),
                category: row.get("category"),
                importance: row.get("importance"),
                updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.db)
            .await
            .is_ok()
    }
}
