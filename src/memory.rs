use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;

use crate::error::Result;
use crate::keyed_lock::KeyedLocks;
use crate::store::ConversationStore;
use crate::types::{preview, ConversationKey, MemoryRecord, MemoryTurn, TurnRole};

pub struct MemoryManager {
    store: Arc<dyn ConversationStore>,
    writers: KeyedLocks<ConversationKey>,
    window: usize,
    summary_interval: u32,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn ConversationStore>, window: usize, summary_interval: u32) -> Self {
        Self {
            store,
            writers: KeyedLocks::new(),
            window: window.max(1),
            summary_interval: summary_interval.max(1),
        }
    }

    pub async fn append(&self, key: &ConversationKey, turn: MemoryTurn) -> Result<()> {
        let _writer = self.writers.lock(key).await;
        let mut record = self
            .store
            .load_memory(key)
            .await?
            .unwrap_or_else(|| MemoryRecord::empty(key.clone()));

        record.turns.push_back(turn);
        record.total_turns += 1;
        record.turns_since_summary += 1;
        while record.turns.len() > self.window {
            record.turns.pop_front();
        }
        if record.turns_since_summary >= self.summary_interval {
            record.summary = Some(summarize(&record));
            record.turns_since_summary = 0;
        }
        record.updated_at = Utc::now();

        self.store.save_memory(&record, self.window).await
    }

    /// The stored record with only its newest `limit` turns; the rolling
    /// summary is kept as is.
    pub async fn recent(&self, key: &ConversationKey, limit: usize) -> Result<MemoryRecord> {
        let mut record = self
            .store
            .load_memory(key)
            .await?
            .unwrap_or_else(|| MemoryRecord::empty(key.clone()));
        while record.turns.len() > limit {
            record.turns.pop_front();
        }
        Ok(record)
    }
}

/// Extractive summary of the window: topic counts plus the latest patient
/// requests. Cheap and deterministic; never calls the generation backend.
fn summarize(record: &MemoryRecord) -> String {
    let mut topics = BTreeMap::<&str, usize>::new();
    for turn in record.turns.iter().filter(|t| t.role == TurnRole::Patient) {
        if let Some(intent) = turn.intent.as_deref().filter(|i| *i != "unknown") {
            *topics.entry(intent).or_default() += 1;
        }
    }

    let mut summary = format!("{} turns so far.", record.total_turns);
    if !topics.is_empty() {
        let listed = topics
            .iter()
            .map(|(topic, count)| format!("{topic} ({count})"))
            .collect::<Vec<_>>()
            .join(", ");
        summary.push_str(&format!(" Topics: {listed}."));
    }

    let latest = record
        .turns
        .iter()
        .rev()
        .filter(|t| t.role == TurnRole::Patient)
        .take(2)
        .map(|t| format!("\"{}\"", preview(&t.text, 80)))
        .collect::<Vec<_>>();
    if !latest.is_empty() {
        summary.push_str(&format!(" Latest requests: {}.", latest.join("; ")));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn turn(role: TurnRole, text: &str, intent: Option<&str>) -> MemoryTurn {
        MemoryTurn {
            role,
            text: text.to_string(),
            intent: intent.map(str::to_string),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn window_evicts_oldest_turns() {
        let manager = MemoryManager::new(Arc::new(MemoryStore::new()), 3, 100);
        let key = ConversationKey::new("a1", "5511");
        for i in 0..5 {
            manager
                .append(&key, turn(TurnRole::Patient, &format!("m{i}"), None))
                .await
                .unwrap();
        }

        let recent = manager.recent(&key, 10).await.unwrap();
        let texts = recent.turns.iter().map(|t| t.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(recent.total_turns, 5);
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let manager = MemoryManager::new(Arc::new(MemoryStore::new()), 10, 100);
        let key = ConversationKey::new("a1", "5511");
        for i in 0..4 {
            manager
                .append(&key, turn(TurnRole::Patient, &format!("m{i}"), None))
                .await
                .unwrap();
        }
        let recent = manager.recent(&key, 2).await.unwrap();
        assert_eq!(recent.turns.len(), 2);
        assert_eq!(recent.turns[1].text, "m3");
        assert_eq!(recent.total_turns, 4);
    }

    #[tokio::test]
    async fn summary_is_recomputed_only_every_interval() {
        let manager = MemoryManager::new(Arc::new(MemoryStore::new()), 10, 4);
        let key = ConversationKey::new("a1", "5511");

        manager
            .append(&key, turn(TurnRole::Patient, "quero agendar", Some("appointment_create")))
            .await
            .unwrap();
        manager
            .append(&key, turn(TurnRole::Assistant, "claro!", None))
            .await
            .unwrap();
        assert!(manager.recent(&key, 10).await.unwrap().summary.is_none());

        manager
            .append(&key, turn(TurnRole::Patient, "qual o endereço?", Some("info_location")))
            .await
            .unwrap();
        manager
            .append(&key, turn(TurnRole::Assistant, "Rua X", None))
            .await
            .unwrap();
        let record = manager.recent(&key, 1).await.unwrap();
        let summary = record.summary.unwrap();
        assert!(summary.contains("appointment_create (1)"));
        assert!(summary.contains("qual o endereço?"));
        assert_eq!(record.turns_since_summary, 0);
        assert_eq!(record.turns.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_lose_turns() {
        let manager = Arc::new(MemoryManager::new(Arc::new(MemoryStore::new()), 100, 1000));
        let key = ConversationKey::new("a1", "5511");
        let tasks = (0..20)
            .map(|i| {
                let manager = manager.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    manager
                        .append(&key, turn(TurnRole::Patient, &format!("m{i}"), None))
                        .await
                        .unwrap();
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(manager.recent(&key, 0).await.unwrap().total_turns, 20);
    }
}
