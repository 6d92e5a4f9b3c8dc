use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};

/// Lifecycle events a channel transport reports for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    PairingArtifact { qr: String },
    Connected { channel: String },
    Disconnected { reason: String },
    AuthFailure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub agent_id: String,
    pub connection_id: String,
    pub kind: ChannelEventKind,
}

/// A messaging-channel session provider. Implementations own the external
/// session resources; lifecycle events come back as [`ChannelEvent`]s.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn open(&self, agent_id: &str, connection_id: &str) -> Result<()>;

    async fn close(&self, connection_id: &str) -> Result<()>;

    /// Drops the session and any stored credentials so the next pairing
    /// starts from scratch.
    async fn purge(&self, connection_id: &str) -> Result<()>;

    async fn send_text(&self, connection_id: &str, to: &str, text: &str) -> Result<()>;
}

/// Digits-only form of a phone-like channel or counterparty identifier.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Talks to an external WhatsApp session bridge over HTTP. The bridge posts
/// lifecycle and message events back to `/webhook`.
pub struct BridgeTransport {
    client: reqwest::Client,
    base_url: String,
    callback_url: String,
}

impl BridgeTransport {
    pub fn new(client: reqwest::Client, base_url: &str, public_base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            callback_url: format!("{}/webhook", public_base_url.trim_end_matches('/')),
        }
    }

    async fn call(&self, request: reqwest::RequestBuilder, action: &str) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("{action} request failed: {err}")))?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
        if status.is_success() {
            return Ok(body);
        }
        let detail = format!("{action} returned {status}: {raw_body}");
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            Err(GatewayError::TransportFatal(detail))
        } else {
            Err(GatewayError::Transport(detail))
        }
    }
}

#[async_trait]
impl ChannelTransport for BridgeTransport {
    async fn open(&self, agent_id: &str, connection_id: &str) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&json!({
                "connectionId": connection_id,
                "agentId": agent_id,
                "webhookUrl": self.callback_url,
            }));
        self.call(request, "open").await.map(|_| ())
    }

    async fn close(&self, connection_id: &str) -> Result<()> {
        let request = self
            .client
            .delete(format!("{}/sessions/{connection_id}", self.base_url));
        match self.call(request, "close").await {
            Ok(_) => Ok(()),
            // Already gone on the bridge side.
            Err(GatewayError::Transport(detail)) if detail.contains("404") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn purge(&self, connection_id: &str) -> Result<()> {
        let request = self
            .client
            .delete(format!("{}/sessions/{connection_id}?purge=true", self.base_url));
        self.call(request, "purge").await.map(|_| ())
    }

    async fn send_text(&self, connection_id: &str, to: &str, text: &str) -> Result<()> {
        let Some(to) = normalize_phone(to) else {
            return Err(GatewayError::Validation(format!("invalid recipient '{to}'")));
        };
        let request = self
            .client
            .post(format!("{}/sessions/{connection_id}/messages", self.base_url))
            .json(&json!({
                "to": to,
                "type": "text",
                "text": { "preview_url": false, "body": text },
            }));
        self.call(request, "send").await.map(|_| ())
    }
}

/// Stand-in used when no bridge is configured: every operation fails, so
/// pairing ends in `error` and replies are recorded as undelivered.
pub struct UnconfiguredTransport;

#[async_trait]
impl ChannelTransport for UnconfiguredTransport {
    async fn open(&self, _agent_id: &str, _connection_id: &str) -> Result<()> {
        Err(GatewayError::Transport("BRIDGE_URL not configured".to_string()))
    }

    async fn close(&self, _connection_id: &str) -> Result<()> {
        Ok(())
    }

    async fn purge(&self, _connection_id: &str) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, _connection_id: &str, _to: &str, _text: &str) -> Result<()> {
        Err(GatewayError::Transport("BRIDGE_URL not configured".to_string()))
    }
}

/// Runs a transport call under a deadline.
pub async fn bounded<T>(
    limit: Duration,
    action: &str,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| GatewayError::Transport(format!("{action} timed out after {limit:?}")))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// In-process transport double. Tracks which connections hold resources
    /// and can emit a pairing artifact as soon as a session opens.
    #[derive(Default)]
    pub struct FakeTransport {
        pub open: Mutex<HashSet<String>>,
        pub opened_total: Mutex<usize>,
        pub sent: Mutex<Vec<(String, String, String)>>,
        pub purged: Mutex<Vec<String>>,
        pub fail_send: Mutex<bool>,
        pub fatal_send: Mutex<bool>,
        pub events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    }

    impl FakeTransport {
        pub fn with_events(events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
            let fake = Self::default();
            *fake.events.lock().unwrap() = Some(events);
            fake
        }

        pub fn open_ids(&self) -> HashSet<String> {
            self.open.lock().unwrap().clone()
        }

        pub fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelTransport for FakeTransport {
        async fn open(&self, agent_id: &str, connection_id: &str) -> Result<()> {
            self.open.lock().unwrap().insert(connection_id.to_string());
            *self.opened_total.lock().unwrap() += 1;
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                let _ = events.send(ChannelEvent {
                    agent_id: agent_id.to_string(),
                    connection_id: connection_id.to_string(),
                    kind: ChannelEventKind::PairingArtifact {
                        qr: format!("qr-{connection_id}"),
                    },
                });
            }
            Ok(())
        }

        async fn close(&self, connection_id: &str) -> Result<()> {
            self.open.lock().unwrap().remove(connection_id);
            Ok(())
        }

        async fn purge(&self, connection_id: &str) -> Result<()> {
            self.open.lock().unwrap().remove(connection_id);
            self.purged.lock().unwrap().push(connection_id.to_string());
            Ok(())
        }

        async fn send_text(&self, connection_id: &str, to: &str, text: &str) -> Result<()> {
            if *self.fatal_send.lock().unwrap() {
                return Err(GatewayError::TransportFatal("send returned 401".to_string()));
            }
            if *self.fail_send.lock().unwrap() {
                return Err(GatewayError::Transport("send refused".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((connection_id.to_string(), to.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn phone_normalization_keeps_digits_only() {
        assert_eq!(normalize_phone("+55 (11) 98765-4321").as_deref(), Some("5511987654321"));
        assert_eq!(normalize_phone("abc"), None);
    }

    #[tokio::test]
    async fn bounded_reports_timeouts_as_transport_errors() {
        let result = bounded(Duration::from_millis(10), "open", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
    }

    #[tokio::test]
    async fn unconfigured_transport_refuses_to_open() {
        let result = UnconfiguredTransport.open("a1", "c1").await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert!(UnconfiguredTransport.close("c1").await.is_ok());
    }
}
