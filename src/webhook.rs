use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::error::{GatewayError, Result};
use crate::pipeline::{InboundTurn, TurnPipeline};
use crate::session::SessionManager;
use crate::store::{Appended, ConversationStore};
use crate::transport::{normalize_phone, ChannelEvent, ChannelEventKind};
use crate::types::{ConversationKey, Direction, NewMessage};

/// A patient message as delivered by the channel, before routing.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Receiving channel identifier (the clinic's number).
    pub channel: String,
    pub from: String,
    pub provider_message_id: String,
    pub text: String,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Lifecycle(ChannelEvent),
    Message(InboundMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    Duplicate,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub received: bool,
    /// Messages accepted and handed to their conversation worker.
    pub queued: usize,
    pub duplicates: usize,
    pub lifecycle: usize,
}

/// Checks `x-hub-signature-256` against an HMAC-SHA256 of the raw body.
/// With no secret configured every request passes.
pub fn verify_signature(secret: Option<&str>, signature_header: Option<&str>, body: &[u8]) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parses either the bridge envelope or a WhatsApp Cloud API payload.
pub fn parse_envelope(payload: &Value) -> Result<Vec<InboundEvent>> {
    if !payload.is_object() {
        return Err(GatewayError::Validation("payload must be a JSON object".to_string()));
    }
    if payload.get("entry").is_some() {
        return parse_cloud_envelope(payload);
    }
    let Some(event) = str_field(payload, "event") else {
        return Err(GatewayError::Validation("missing event".to_string()));
    };
    parse_bridge_event(event, payload).map(|event| event.into_iter().collect())
}

fn parse_bridge_event(event: &str, payload: &Value) -> Result<Option<InboundEvent>> {
    let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));

    if event == "message" {
        if data.get("fromMe").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }
        let channel = str_field(payload, "channel")
            .or_else(|| str_field(&data, "to"))
            .ok_or_else(|| GatewayError::Validation("message without channel".to_string()))?;
        let from = str_field(&data, "from")
            .ok_or_else(|| GatewayError::Validation("message without sender".to_string()))?;
        let id = str_field(&data, "id")
            .ok_or_else(|| GatewayError::Validation("message without id".to_string()))?;
        let Some(text) = str_field(&data, "body").or_else(|| str_field(&data, "text")) else {
            return Ok(None);
        };
        return Ok(Some(InboundEvent::Message(InboundMessage {
            channel: channel.to_string(),
            from: from.to_string(),
            provider_message_id: id.to_string(),
            text: text.to_string(),
            sender_name: str_field(&data, "pushName")
                .or_else(|| str_field(&data, "senderName"))
                .map(str::to_string),
        })));
    }

    let agent_id = str_field(payload, "agentId")
        .ok_or_else(|| GatewayError::Validation(format!("{event} event without agentId")))?;
    let connection_id = str_field(payload, "connectionId")
        .ok_or_else(|| GatewayError::Validation(format!("{event} event without connectionId")))?;
    let reason = || {
        str_field(&data, "reason")
            .or_else(|| data.as_str())
            .unwrap_or("")
            .to_string()
    };
    let kind = match event {
        "qr" => {
            let qr = str_field(&data, "qr")
                .or_else(|| data.as_str())
                .ok_or_else(|| GatewayError::Validation("qr event without code".to_string()))?;
            ChannelEventKind::PairingArtifact { qr: qr.to_string() }
        }
        "ready" => {
            let channel = str_field(&data, "channel")
                .or_else(|| str_field(payload, "channel"))
                .ok_or_else(|| GatewayError::Validation("ready event without channel".to_string()))?;
            ChannelEventKind::Connected {
                channel: channel.to_string(),
            }
        }
        "disconnected" => ChannelEventKind::Disconnected { reason: reason() },
        "auth_failure" => ChannelEventKind::AuthFailure { reason: reason() },
        other => {
            return Err(GatewayError::Validation(format!("unknown event '{other}'")));
        }
    };
    Ok(Some(InboundEvent::Lifecycle(ChannelEvent {
        agent_id: agent_id.to_string(),
        connection_id: connection_id.to_string(),
        kind,
    })))
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for contact in value
        .get("contacts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let wa_id = str_field(contact, "wa_id")
            .or_else(|| str_field(contact, "input"))
            .unwrap_or("");
        let Some(digits) = normalize_phone(wa_id) else {
            continue;
        };
        if let Some(name) = contact
            .get("profile")
            .and_then(|p| str_field(p, "name"))
        {
            names.insert(digits, name.to_string());
        }
    }
    names
}

fn cloud_message_text(message: &Value) -> Option<String> {
    let kind = str_field(message, "type").unwrap_or("text");
    let text = match kind {
        "text" => message.get("text").and_then(|t| str_field(t, "body")),
        "button" => message.get("button").and_then(|b| str_field(b, "text")),
        "interactive" => message.get("interactive").and_then(|i| {
            i.get("button_reply")
                .or_else(|| i.get("list_reply"))
                .and_then(|reply| str_field(reply, "title"))
        }),
        _ => None,
    };
    text.map(str::to_string)
}

fn parse_cloud_envelope(payload: &Value) -> Result<Vec<InboundEvent>> {
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Validation("entry must be an array".to_string()))?;

    let mut events = Vec::new();
    for change in entries
        .iter()
        .filter_map(|entry| entry.get("changes").and_then(Value::as_array))
        .flatten()
    {
        let Some(value) = change.get("value") else {
            continue;
        };
        let Some(messages) = value.get("messages").and_then(Value::as_array) else {
            continue;
        };
        let channel = value
            .get("metadata")
            .and_then(|m| str_field(m, "display_phone_number"))
            .and_then(normalize_phone)
            .ok_or_else(|| GatewayError::Validation("missing metadata.display_phone_number".to_string()))?;
        let names = contact_profile_names(value);

        for message in messages {
            let (Some(from), Some(id)) = (str_field(message, "from"), str_field(message, "id")) else {
                return Err(GatewayError::Validation("message without from or id".to_string()));
            };
            let Some(text) = cloud_message_text(message) else {
                tracing::debug!(provider_message_id = id, "non-text message skipped");
                continue;
            };
            let sender_name = normalize_phone(from).and_then(|digits| names.get(&digits).cloned());
            events.push(InboundEvent::Message(InboundMessage {
                channel: channel.clone(),
                from: from.to_string(),
                provider_message_id: id.to_string(),
                text,
                sender_name,
            }));
        }
    }
    Ok(events)
}

/// Routes inbound traffic: lifecycle events to the session manager, patient
/// messages to a per-conversation worker that runs turns strictly in order.
pub struct WebhookRouter {
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionManager>,
    pipeline: Arc<TurnPipeline>,
    queues: Mutex<HashMap<ConversationKey, mpsc::UnboundedSender<InboundTurn>>>,
    permits: Arc<Semaphore>,
    idle: Duration,
}

impl WebhookRouter {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        sessions: Arc<SessionManager>,
        pipeline: Arc<TurnPipeline>,
        max_workers: usize,
        idle: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            pipeline,
            queues: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            idle,
        }
    }

    /// Handles one webhook payload. Channels are resolved for every message
    /// before anything is written, so an unknown channel leaves no state.
    pub async fn ingest(self: &Arc<Self>, payload: &Value) -> Result<IngestReport> {
        let events = parse_envelope(payload)?;

        let mut lifecycle = Vec::new();
        let mut messages = Vec::new();
        for event in events {
            match event {
                InboundEvent::Lifecycle(event) => lifecycle.push(event),
                InboundEvent::Message(message) => {
                    let agent_id = self
                        .sessions
                        .resolve_channel(&message.channel)
                        .await
                        .ok_or_else(|| GatewayError::UnknownChannel(message.channel.clone()))?;
                    messages.push((agent_id, message));
                }
            }
        }

        let mut report = IngestReport {
            received: true,
            ..IngestReport::default()
        };
        for event in lifecycle {
            self.sessions.on_channel_event(event).await;
            report.lifecycle += 1;
        }
        for (agent_id, message) in messages {
            match self.ingest_message(&agent_id, message).await? {
                IngestOutcome::Queued => report.queued += 1,
                IngestOutcome::Duplicate => report.duplicates += 1,
            }
        }
        Ok(report)
    }

    async fn ingest_message(
        self: &Arc<Self>,
        agent_id: &str,
        message: InboundMessage,
    ) -> Result<IngestOutcome> {
        let counterparty = normalize_phone(&message.from).unwrap_or_else(|| message.from.clone());
        let key = ConversationKey::new(agent_id, counterparty);

        if self
            .store
            .has_message(&key, &message.provider_message_id)
            .await?
        {
            tracing::debug!(conversation = %key, provider_message_id = %message.provider_message_id, "duplicate delivery");
            return Ok(IngestOutcome::Duplicate);
        }

        let appended = self
            .store
            .append_message(
                &key,
                NewMessage {
                    direction: Direction::Received,
                    content: message.text.clone(),
                    provider_message_id: Some(message.provider_message_id.clone()),
                    metadata: json!({ "senderName": message.sender_name }),
                    created_at: Utc::now(),
                },
            )
            .await?;
        let conversation = match appended {
            Appended::Stored { conversation, .. } => conversation,
            Appended::Duplicate => return Ok(IngestOutcome::Duplicate),
        };
        self.sessions.touch(agent_id).await;

        self.enqueue(InboundTurn {
            key,
            conversation_id: conversation.id,
            text: message.text,
            sender_name: message.sender_name,
            provider_message_id: Some(message.provider_message_id),
        })
        .await;
        Ok(IngestOutcome::Queued)
    }

    async fn enqueue(self: &Arc<Self>, turn: InboundTurn) {
        let mut queues = self.queues.lock().await;
        let turn = match queues.get(&turn.key) {
            Some(queue) => match queue.send(turn) {
                Ok(()) => return,
                // Worker is gone; start a new one below.
                Err(mpsc::error::SendError(turn)) => turn,
            },
            None => turn,
        };
        let key = turn.key.clone();
        let (queue, rx) = mpsc::unbounded_channel();
        let _ = queue.send(turn);
        queues.insert(key.clone(), queue);
        tokio::spawn(self.clone().run_worker(key, rx));
    }

    async fn run_worker(self: Arc<Self>, key: ConversationKey, mut rx: mpsc::UnboundedReceiver<InboundTurn>) {
        loop {
            let turn = match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(turn)) => turn,
                Ok(None) => break,
                Err(_) => {
                    // Retire under the map lock so no enqueue can slip in between.
                    let mut queues = self.queues.lock().await;
                    match rx.try_recv() {
                        Ok(turn) => turn,
                        Err(_) => {
                            queues.remove(&key);
                            break;
                        }
                    }
                }
            };

            let Ok(_permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            match self.pipeline.process(turn).await {
                Ok(outcome) => tracing::info!(
                    conversation = %key,
                    intent = outcome.classification.intent.as_str(),
                    delivered = outcome.delivered,
                    backend_failed = outcome.backend_failed,
                    escalated = outcome.escalation.is_some(),
                    "turn processed"
                ),
                Err(err) => tracing::error!(conversation = %key, error = %err, "turn failed"),
            }
        }
        tracing::debug!(conversation = %key, "conversation worker retired");
    }

    /// Conversations that currently have a worker.
    pub async fn active_workers(&self) -> usize {
        self.queues.lock().await.len()
    }
}
