use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::error::{GatewayError, Result};
use crate::escalation::{EscalationMonitor, TurnSignal};
use crate::generator::{Generated, GenerationRequest, ResponseGenerator};
use crate::intent::{Classification, IntentClassifier};
use crate::knowledge::KnowledgeRetriever;
use crate::memory::MemoryManager;
use crate::personalization::{Observations, PersonalizationStore};
use crate::session::SessionManager;
use crate::store::{Appended, ConversationStore};
use crate::types::{
    ConversationKey, Direction, EscalationRecord, MemoryRecord, MemoryTurn, NewMessage,
    PersonalizationProfile, TurnRole,
};

/// Conversation turns handed to the generator alongside the rolling summary.
const PROMPT_HISTORY_TURNS: usize = 12;

/// An inbound patient message that has already been persisted.
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub key: ConversationKey,
    pub conversation_id: String,
    pub text: String,
    pub sender_name: Option<String>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub classification: Classification,
    pub delivered: bool,
    pub backend_failed: bool,
    pub escalation: Option<EscalationRecord>,
}

pub struct TurnPipeline {
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionManager>,
    classifier: IntentClassifier,
    retriever: KnowledgeRetriever,
    memory: MemoryManager,
    profiles: PersonalizationStore,
    generator: ResponseGenerator,
    escalation: EscalationMonitor,
}

impl TurnPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        sessions: Arc<SessionManager>,
        classifier: IntentClassifier,
        retriever: KnowledgeRetriever,
        memory: MemoryManager,
        profiles: PersonalizationStore,
        generator: ResponseGenerator,
        escalation: EscalationMonitor,
    ) -> Self {
        Self {
            store,
            sessions,
            classifier,
            retriever,
            memory,
            profiles,
            generator,
            escalation,
        }
    }

    /// Classifies, generates and delivers the reply for one turn, then
    /// records memory, profile and escalation. Only a missing agent is an
    /// error; every later stage failure is logged and contained.
    pub async fn process(&self, turn: InboundTurn) -> Result<TurnOutcome> {
        let agent = self
            .store
            .agent(&turn.key.agent_id)
            .await?
            .ok_or_else(|| GatewayError::AgentNotFound(turn.key.agent_id.clone()))?;

        let classification = self.classifier.classify(&turn.text);
        tracing::debug!(
            conversation = %turn.key,
            intent = classification.intent.as_str(),
            confidence = classification.confidence,
            "turn classified"
        );

        let (retrieved, memory, profile) = tokio::join!(
            self.retriever
                .retrieve(&agent.clinic_id, &turn.text, classification.intent),
            self.memory.recent(&turn.key, PROMPT_HISTORY_TURNS),
            self.profiles.profile(&turn.key),
        );
        let retrieved = retrieved.unwrap_or_else(|err| {
            tracing::warn!(conversation = %turn.key, error = %err, "knowledge retrieval failed");
            Vec::new()
        });
        let memory = memory.unwrap_or_else(|err| {
            tracing::warn!(conversation = %turn.key, error = %err, "memory load failed");
            MemoryRecord::empty(turn.key.clone())
        });
        let profile = profile.unwrap_or_else(|err| {
            tracing::warn!(conversation = %turn.key, error = %err, "profile load failed");
            PersonalizationProfile::empty(turn.key.clone())
        });

        let generated = self
            .generator
            .generate(GenerationRequest {
                agent: &agent,
                classification: &classification,
                retrieved: &retrieved,
                memory: &memory,
                profile: &profile,
                user_message: &turn.text,
            })
            .await;

        let delivered = match self
            .sessions
            .send(&agent.id, &turn.key.counterparty, &generated.reply)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(conversation = %turn.key, error = %err, "reply delivery failed");
                false
            }
        };

        let knowledge_ids = retrieved
            .iter()
            .map(|item| item.entry.id.clone())
            .collect::<Vec<_>>();
        self.persist_reply(&turn, &classification, &generated, &knowledge_ids, delivered)
            .await;

        let now = Utc::now();
        let turns = [
            MemoryTurn {
                role: TurnRole::Patient,
                text: turn.text.clone(),
                intent: Some(classification.intent.as_str().to_string()),
                at: now,
            },
            MemoryTurn {
                role: TurnRole::Assistant,
                text: generated.reply.clone(),
                intent: None,
                at: now,
            },
        ];
        for memory_turn in turns {
            if let Err(err) = self.memory.append(&turn.key, memory_turn).await {
                tracing::warn!(conversation = %turn.key, error = %err, "memory append failed");
                break;
            }
        }

        let observations =
            Observations::from_turn(&classification, &turn.text, turn.sender_name.as_deref());
        if let Err(err) = self.profiles.update(&turn.key, observations).await {
            tracing::warn!(conversation = %turn.key, error = %err, "profile update failed");
        }

        let escalation = self
            .escalation
            .evaluate(TurnSignal {
                key: &turn.key,
                conversation_id: &turn.conversation_id,
                intent: classification.intent,
                confidence: classification.confidence,
                backend_failed: generated.backend_failed(),
                text: &turn.text,
            })
            .await
            .unwrap_or_else(|err| {
                tracing::error!(conversation = %turn.key, error = %err, "escalation write failed");
                None
            });

        Ok(TurnOutcome {
            classification,
            delivered,
            backend_failed: generated.backend_failed(),
            escalation,
        })
    }

    async fn persist_reply(
        &self,
        turn: &InboundTurn,
        classification: &Classification,
        generated: &Generated,
        knowledge_ids: &[String],
        delivered: bool,
    ) {
        let message = NewMessage {
            direction: Direction::Sent,
            content: generated.reply.clone(),
            provider_message_id: None,
            metadata: json!({
                "generatedByAi": true,
                "intent": classification.intent.as_str(),
                "confidence": classification.confidence,
                "grounded": generated.grounded,
                "fallback": generated.backend_failure,
                "knowledgeIds": knowledge_ids,
                "inReplyTo": turn.provider_message_id,
                "delivery": if delivered { "sent" } else { "failed" },
            }),
            created_at: Utc::now(),
        };
        match self.store.append_message(&turn.key, message).await {
            Ok(Appended::Stored { .. }) | Ok(Appended::Duplicate) => {}
            Err(err) => {
                tracing::error!(conversation = %turn.key, error = %err, "failed to persist reply");
            }
        }
    }
}
