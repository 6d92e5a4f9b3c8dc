use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::intent::{normalize, Intent};
use crate::store::ConversationStore;
use crate::types::{ConversationKey, EscalationReason, EscalationRecord};

/// A low-confidence streak untouched for this long is forgotten.
const STREAK_IDLE: Duration = Duration::from_secs(30 * 60);

const FRUSTRATION_MARKERS: &[&str] = &[
    "absurdo",
    "ridiculo",
    "pessimo",
    "ninguem responde",
    "nao entende",
    "nao resolve",
    "de novo",
    "ridiculous",
    "terrible",
    "useless",
    "not helpful",
    "again",
    "still waiting",
];

/// What the monitor needs to know about a finished turn.
#[derive(Debug, Clone)]
pub struct TurnSignal<'a> {
    pub key: &'a ConversationKey,
    pub conversation_id: &'a str,
    pub intent: Intent,
    pub confidence: f32,
    pub backend_failed: bool,
    pub text: &'a str,
}

struct Streak {
    count: u32,
    last_seen: Instant,
}

pub struct EscalationMonitor {
    store: Arc<dyn ConversationStore>,
    threshold: f32,
    streak_len: u32,
    streak_idle: Duration,
    streaks: Mutex<HashMap<ConversationKey, Streak>>,
}

impl EscalationMonitor {
    pub fn new(store: Arc<dyn ConversationStore>, threshold: f32, streak_len: u32) -> Self {
        Self {
            store,
            threshold,
            streak_len: streak_len.max(1),
            streak_idle: STREAK_IDLE,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_streak_idle(mut self, idle: Duration) -> Self {
        self.streak_idle = idle;
        self
    }

    /// Decides whether the turn needs a human. When it does, the record is
    /// written and the conversation is flagged `needs_human`.
    pub async fn evaluate(&self, signal: TurnSignal<'_>) -> Result<Option<EscalationRecord>> {
        let (reason, streak) = self.decide(&signal);
        let Some(reason) = reason else {
            return Ok(None);
        };

        let record = EscalationRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: signal.conversation_id.to_string(),
            agent_id: signal.key.agent_id.clone(),
            counterparty: signal.key.counterparty.clone(),
            reason,
            intent: signal.intent.as_str().to_string(),
            score: frustration_score(signal.confidence, streak, signal.text),
            created_at: Utc::now(),
        };
        self.store.insert_escalation(&record).await?;
        self.store.mark_needs_human(signal.key).await?;
        tracing::info!(
            conversation = %signal.key,
            reason = reason.as_str(),
            score = record.score,
            "conversation escalated to a human"
        );
        Ok(Some(record))
    }

    /// Updates the low-confidence streak and picks the escalation reason,
    /// if any. Returns the streak length observed for this turn.
    fn decide(&self, signal: &TurnSignal<'_>) -> (Option<EscalationReason>, u32) {
        let mut streaks = self
            .streaks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let streak = if signal.confidence < self.threshold {
            let now = Instant::now();
            let idle = self.streak_idle;
            streaks.retain(|_, streak| now.duration_since(streak.last_seen) < idle);
            let streak = streaks.entry(signal.key.clone()).or_insert(Streak {
                count: 0,
                last_seen: now,
            });
            streak.count += 1;
            streak.last_seen = now;
            streak.count
        } else {
            streaks.remove(signal.key);
            0
        };

        let reason = if signal.intent == Intent::EscalationRequest {
            Some(EscalationReason::EscalationRequest)
        } else if signal.backend_failed {
            Some(EscalationReason::BackendFailure)
        } else if streak >= self.streak_len {
            Some(EscalationReason::LowConfidence)
        } else {
            None
        };
        if reason.is_some() {
            streaks.remove(signal.key);
        }
        (reason, streak)
    }
}

/// Frustration estimate in [0, 1]: low confidence, long streaks and
/// emphatic or annoyed wording all push it up.
pub fn frustration_score(confidence: f32, streak: u32, text: &str) -> f32 {
    let mut score = (1.0 - confidence.clamp(0.0, 1.0)) * 0.5;
    score += (streak.min(5) as f32) * 0.08;

    let normalized = normalize(text);
    if FRUSTRATION_MARKERS.iter().any(|m| normalized.contains(m)) {
        score += 0.2;
    }
    if text.contains("!!") || text.contains("??") {
        score += 0.1;
    }
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let upper = text.chars().filter(|c| c.is_uppercase()).count();
    if letters >= 8 && upper * 10 >= letters * 7 {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}
