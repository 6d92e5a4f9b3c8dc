use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::store::ConversationStore;
use crate::transport::{bounded, normalize_phone, ChannelEvent, ChannelEventKind, ChannelTransport};
use crate::types::{Connection, ConnectionStatus, SessionSummary};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingTicket {
    pub connection_id: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_artifact: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            connection_id: None,
            channel: None,
            pairing_artifact: None,
            connected_at: None,
            last_error: None,
        }
    }
}

impl From<&Connection> for ConnectionSnapshot {
    fn from(connection: &Connection) -> Self {
        Self {
            status: connection.status,
            connection_id: Some(connection.id.clone()),
            channel: connection.channel.clone(),
            pairing_artifact: connection.pairing_artifact.clone(),
            connected_at: connection.connected_at,
            last_error: connection.last_error.clone(),
        }
    }
}

impl Connection {
    fn pairing(agent_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            channel: None,
            status: ConnectionStatus::Pairing,
            pairing_artifact: None,
            created_at: now,
            connected_at: None,
            last_activity_at: now,
            last_error: None,
        }
    }

    /// Applies a transport event. Returns false when the event is not valid
    /// in the current state and nothing changed.
    pub fn apply(&mut self, event: &ChannelEventKind, now: DateTime<Utc>) -> bool {
        use ConnectionStatus::*;
        match (self.status, event) {
            (Pairing, ChannelEventKind::PairingArtifact { qr }) => {
                self.pairing_artifact = Some(qr.clone());
            }
            (Pairing, ChannelEventKind::Connected { channel }) => {
                self.status = Connected;
                self.channel = normalize_phone(channel).or_else(|| Some(channel.clone()));
                self.connected_at = Some(now);
                self.pairing_artifact = None;
                self.last_error = None;
            }
            (Pairing | Connected, ChannelEventKind::Disconnected { reason }) => {
                self.status = Disconnected;
                self.pairing_artifact = None;
                if !reason.trim().is_empty() {
                    self.last_error = Some(reason.clone());
                }
            }
            (Pairing | Connected, ChannelEventKind::AuthFailure { reason }) => {
                self.status = Error;
                self.pairing_artifact = None;
                self.last_error = Some(reason.clone());
            }
            _ => return false,
        }
        self.last_activity_at = now;
        true
    }

    /// Local teardown: any non-disconnected state ends up `disconnected`.
    fn tear_down(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ConnectionStatus::Disconnected {
            return false;
        }
        self.status = ConnectionStatus::Disconnected;
        self.pairing_artifact = None;
        self.last_activity_at = now;
        true
    }
}

/// What a pairing waiter can observe.
#[derive(Debug, Clone, PartialEq)]
struct PairingView {
    status: ConnectionStatus,
    artifact: Option<String>,
}

impl PairingView {
    fn of(connection: &Connection) -> Self {
        Self {
            status: connection.status,
            artifact: connection.pairing_artifact.clone(),
        }
    }
}

struct Slot {
    connection: Connection,
    view: watch::Sender<PairingView>,
}

impl Slot {
    fn publish(&self) {
        self.view.send_replace(PairingView::of(&self.connection));
    }
}

/// Sole owner of the agent → connection registry.
pub struct SessionManager {
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn ChannelTransport>,
    registry: RwLock<HashMap<String, Slot>>,
    agent_locks: KeyedLocks<String>,
    pairing_wait: Duration,
    transport_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn ChannelTransport>,
        pairing_wait: Duration,
        transport_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            registry: RwLock::new(HashMap::new()),
            agent_locks: KeyedLocks::new(),
            pairing_wait,
            transport_timeout,
        }
    }

    /// Replaces any live connection with a fresh pairing one, then waits a
    /// bounded time for its first pairing artifact.
    pub async fn start_pairing(&self, agent_id: &str) -> Result<PairingTicket> {
        let agent = self
            .store
            .agent(agent_id)
            .await?
            .ok_or_else(|| GatewayError::AgentNotFound(agent_id.to_string()))?;
        if !agent.active {
            return Err(GatewayError::AgentInactive(agent_id.to_string()));
        }

        let (connection_id, mut waiter) = {
            let _agent = self.agent_locks.lock(&agent_id.to_string()).await;
            self.tear_down(agent_id).await;

            let connection = Connection::pairing(agent_id, Utc::now());
            let connection_id = connection.id.clone();
            let (view, waiter) = watch::channel(PairingView::of(&connection));
            self.registry
                .write()
                .await
                .insert(agent_id.to_string(), Slot { connection, view });

            let opened = bounded(
                self.transport_timeout,
                "open",
                self.transport.open(agent_id, &connection_id),
            )
            .await;
            if let Err(err) = opened {
                tracing::warn!(agent_id, connection_id = %connection_id, error = %err, "transport open failed");
                self.fail_connection(agent_id, &connection_id, &err.to_string())
                    .await;
                let _ = bounded(
                    self.transport_timeout,
                    "purge",
                    self.transport.purge(&connection_id),
                )
                .await;
                return Err(err);
            }
            tracing::info!(agent_id, connection_id = %connection_id, "pairing started");
            (connection_id, waiter)
        };

        let view = wait_for_artifact(&mut waiter, self.pairing_wait).await;
        Ok(PairingTicket {
            connection_id,
            status: view.status,
            pairing_artifact: view.artifact,
        })
    }

    /// Cached read; never calls the transport.
    pub async fn status(&self, agent_id: &str) -> ConnectionSnapshot {
        self.registry
            .read()
            .await
            .get(agent_id)
            .map(|slot| ConnectionSnapshot::from(&slot.connection))
            .unwrap_or_else(ConnectionSnapshot::disconnected)
    }

    pub async fn disconnect(&self, agent_id: &str) -> ConnectionSnapshot {
        {
            let _agent = self.agent_locks.lock(&agent_id.to_string()).await;
            if self.tear_down(agent_id).await {
                tracing::info!(agent_id, "connection disconnected");
            }
        }
        self.status(agent_id).await
    }

    /// Applies a transport event. Returns whether the registry changed;
    /// events for a superseded connection are dropped.
    pub async fn on_channel_event(&self, event: ChannelEvent) -> bool {
        let _agent = self.agent_locks.lock(&event.agent_id).await;
        let applied = {
            let mut registry = self.registry.write().await;
            let Some(slot) = registry.get_mut(&event.agent_id) else {
                tracing::debug!(agent_id = %event.agent_id, "event for agent without connection ignored");
                return false;
            };
            if slot.connection.id != event.connection_id {
                tracing::debug!(
                    agent_id = %event.agent_id,
                    connection_id = %event.connection_id,
                    "stale transport event ignored"
                );
                return false;
            }
            let applied = slot.connection.apply(&event.kind, Utc::now());
            if applied {
                slot.publish();
            }
            applied
        };
        if !applied {
            return false;
        }

        match &event.kind {
            ChannelEventKind::Connected { channel } => {
                tracing::info!(agent_id = %event.agent_id, channel = %channel, "channel connected");
            }
            ChannelEventKind::Disconnected { reason } => {
                tracing::info!(agent_id = %event.agent_id, reason = %reason, "channel disconnected");
                if let Err(err) = bounded(
                    self.transport_timeout,
                    "close",
                    self.transport.close(&event.connection_id),
                )
                .await
                {
                    tracing::warn!(agent_id = %event.agent_id, error = %err, "transport close failed");
                }
            }
            ChannelEventKind::AuthFailure { reason } => {
                tracing::warn!(agent_id = %event.agent_id, reason = %reason, "channel auth failure");
                if let Err(err) = bounded(
                    self.transport_timeout,
                    "purge",
                    self.transport.purge(&event.connection_id),
                )
                .await
                {
                    tracing::warn!(agent_id = %event.agent_id, error = %err, "purge after auth failure failed");
                }
            }
            ChannelEventKind::PairingArtifact { .. } => {}
        }
        true
    }

    /// The agent currently connected on `channel`, if any.
    pub async fn resolve_channel(&self, channel: &str) -> Option<String> {
        let wanted = normalize_phone(channel).unwrap_or_else(|| channel.trim().to_string());
        self.registry
            .read()
            .await
            .values()
            .filter(|slot| slot.connection.status == ConnectionStatus::Connected)
            .filter(|slot| slot.connection.channel.as_deref() == Some(wanted.as_str()))
            .max_by_key(|slot| slot.connection.connected_at)
            .map(|slot| slot.connection.agent_id.clone())
    }

    /// Delivers a text through the agent's live connection.
    pub async fn send(&self, agent_id: &str, to: &str, text: &str) -> Result<()> {
        let connection_id = self
            .registry
            .read()
            .await
            .get(agent_id)
            .filter(|slot| slot.connection.status == ConnectionStatus::Connected)
            .map(|slot| slot.connection.id.clone())
            .ok_or_else(|| GatewayError::ChannelNotConnected(agent_id.to_string()))?;

        let sent = bounded(
            self.transport_timeout,
            "send",
            self.transport.send_text(&connection_id, to, text),
        )
        .await;
        match sent {
            Ok(()) => {
                self.touch(agent_id).await;
                Ok(())
            }
            // The channel rejected the session itself; it cannot be reused.
            Err(GatewayError::TransportFatal(reason)) => {
                self.on_channel_event(ChannelEvent {
                    agent_id: agent_id.to_string(),
                    connection_id,
                    kind: ChannelEventKind::AuthFailure {
                        reason: reason.clone(),
                    },
                })
                .await;
                Err(GatewayError::TransportFatal(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Records channel activity for the agent's current connection.
    pub async fn touch(&self, agent_id: &str) {
        let _agent = self.agent_locks.lock(&agent_id.to_string()).await;
        if let Some(slot) = self.registry.write().await.get_mut(agent_id) {
            slot.connection.last_activity_at = Utc::now();
        }
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let mut sessions = self
            .registry
            .read()
            .await
            .values()
            .map(|slot| SessionSummary {
                agent_id: slot.connection.agent_id.clone(),
                status: slot.connection.status,
                connected: slot.connection.status == ConnectionStatus::Connected,
            })
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        sessions
    }

    /// Closes every live transport session; used on process exit.
    pub async fn shutdown(&self) {
        let agents = self.registry.read().await.keys().cloned().collect::<Vec<_>>();
        join_all(agents.iter().map(|agent_id| self.disconnect(agent_id))).await;
    }

    /// Marks the agent's connection disconnected, wakes any pairing waiter
    /// and closes the transport session. Caller holds the agent lock.
    async fn tear_down(&self, agent_id: &str) -> bool {
        let connection_id = {
            let mut registry = self.registry.write().await;
            let Some(slot) = registry.get_mut(agent_id) else {
                return false;
            };
            if !slot.connection.tear_down(Utc::now()) {
                return false;
            }
            slot.publish();
            slot.connection.id.clone()
        };
        if let Err(err) = bounded(
            self.transport_timeout,
            "close",
            self.transport.close(&connection_id),
        )
        .await
        {
            tracing::warn!(agent_id, connection_id = %connection_id, error = %err, "transport close failed");
        }
        true
    }

    async fn fail_connection(&self, agent_id: &str, connection_id: &str, reason: &str) {
        let mut registry = self.registry.write().await;
        if let Some(slot) = registry
            .get_mut(agent_id)
            .filter(|slot| slot.connection.id == connection_id)
        {
            slot.connection.status = ConnectionStatus::Error;
            slot.connection.pairing_artifact = None;
            slot.connection.last_error = Some(reason.to_string());
            slot.connection.last_activity_at = Utc::now();
            slot.publish();
        }
    }
}

/// Waits until the connection has an artifact or leaves `pairing`, giving
/// up after `limit`. Returns whatever was last observed.
async fn wait_for_artifact(
    waiter: &mut watch::Receiver<PairingView>,
    limit: Duration,
) -> PairingView {
    let waited = tokio::time::timeout(limit, async {
        waiter
            .wait_for(|view| view.artifact.is_some() || view.status != ConnectionStatus::Pairing)
            .await
            .map(|view| view.clone())
    })
    .await;
    match waited {
        Ok(Ok(view)) => view,
        _ => waiter.borrow().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::tests::FakeTransport;
    use crate::types::Agent;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use serde_json::json;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    async fn store_with_agents(ids: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .insert_agent(Agent {
                    id: id.to_string(),
                    name: "Sofia".to_string(),
                    personality: String::new(),
                    temperature: None,
                    context: json!({}),
                    clinic_id: "c1".to_string(),
                    active: *id != "inactive",
                })
                .await;
        }
        store
    }

    fn manager(store: Arc<MemoryStore>, transport: Arc<FakeTransport>, wait_ms: u64) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            store,
            transport,
            Duration::from_millis(wait_ms),
            Duration::from_millis(500),
        ))
    }

    fn spawn_pump(sessions: Arc<SessionManager>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                sessions.on_channel_event(event).await;
            }
        });
    }

    fn event(agent_id: &str, connection_id: &str, kind: ChannelEventKind) -> ChannelEvent {
        ChannelEvent {
            agent_id: agent_id.to_string(),
            connection_id: connection_id.to_string(),
            kind,
        }
    }

    #[test]
    fn state_machine_rejects_invalid_transitions() {
        let now = Utc::now();
        let mut connection = Connection::pairing("a1", now);
        assert!(connection.apply(&ChannelEventKind::PairingArtifact { qr: "q1".into() }, now));
        assert!(connection.apply(&ChannelEventKind::PairingArtifact { qr: "q2".into() }, now));
        assert_eq!(connection.pairing_artifact.as_deref(), Some("q2"));

        assert!(connection.apply(&ChannelEventKind::Connected { channel: "+55 11 4000".into() }, now));
        assert_eq!(connection.channel.as_deref(), Some("55114000"));
        assert!(connection.pairing_artifact.is_none());
        assert!(!connection.apply(&ChannelEventKind::PairingArtifact { qr: "q3".into() }, now));
        assert!(!connection.apply(&ChannelEventKind::Connected { channel: "1".into() }, now));

        assert!(connection.apply(&ChannelEventKind::AuthFailure { reason: "logged out".into() }, now));
        assert_eq!(connection.status, ConnectionStatus::Error);
        assert!(!connection.apply(&ChannelEventKind::Disconnected { reason: String::new() }, now));
        assert!(connection.tear_down(now));
        assert_eq!(connection.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn pairing_then_connect_then_disconnect() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport::with_events(tx));
        let sessions = manager(store_with_agents(&["a1"]).await, transport.clone(), 1000);
        spawn_pump(sessions.clone(), rx);

        let ticket = sessions.start_pairing("a1").await.unwrap();
        assert_eq!(ticket.status, ConnectionStatus::Pairing);
        assert_eq!(
            ticket.pairing_artifact,
            Some(format!("qr-{}", ticket.connection_id))
        );

        sessions
            .on_channel_event(event(
                "a1",
                &ticket.connection_id,
                ChannelEventKind::Connected { channel: "5511999".into() },
            ))
            .await;
        let snapshot = sessions.status("a1").await;
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.channel.as_deref(), Some("5511999"));
        assert!(snapshot.pairing_artifact.is_none());
        assert_eq!(sessions.resolve_channel("+55 11 999").await.as_deref(), Some("a1"));

        let snapshot = sessions.disconnect("a1").await;
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert!(transport.open_ids().is_empty());
        assert_eq!(sessions.resolve_channel("5511999").await, None);

        // Idempotent.
        assert_eq!(sessions.disconnect("a1").await.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_an_error() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport, 30);

        let ticket = sessions.start_pairing("a1").await.unwrap();
        assert_eq!(ticket.status, ConnectionStatus::Pairing);
        assert!(ticket.pairing_artifact.is_none());
    }

    #[tokio::test]
    async fn unknown_and_inactive_agents_are_rejected() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["inactive"]).await, transport.clone(), 30);

        assert!(matches!(
            sessions.start_pairing("ghost").await,
            Err(GatewayError::AgentNotFound(_))
        ));
        assert!(matches!(
            sessions.start_pairing("inactive").await,
            Err(GatewayError::AgentInactive(_))
        ));
        assert_eq!(*transport.opened_total.lock().unwrap(), 0);
        assert_eq!(sessions.status("ghost").await.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn concurrent_start_pairing_leaves_one_live_connection() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport.clone(), 20);

        let (first, second) = tokio::join!(sessions.start_pairing("a1"), sessions.start_pairing("a1"));
        let first = first.unwrap();
        let second = second.unwrap();
        assert_ne!(first.connection_id, second.connection_id);

        let open = transport.open_ids();
        assert_eq!(open.len(), 1);
        let current = sessions.status("a1").await.connection_id.unwrap();
        assert!(open.contains(&current));
        assert_eq!(*transport.opened_total.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_events_cannot_resurrect_old_connections() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport, 10);

        let old = sessions.start_pairing("a1").await.unwrap();
        let new = sessions.start_pairing("a1").await.unwrap();

        let changed = sessions
            .on_channel_event(event(
                "a1",
                &old.connection_id,
                ChannelEventKind::Connected { channel: "5511".into() },
            ))
            .await;
        assert!(!changed);
        let snapshot = sessions.status("a1").await;
        assert_eq!(snapshot.status, ConnectionStatus::Pairing);
        assert_eq!(snapshot.connection_id.as_deref(), Some(new.connection_id.as_str()));
    }

    #[tokio::test]
    async fn auth_failure_clears_artifact_and_purges() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport::with_events(tx));
        let sessions = manager(store_with_agents(&["a1"]).await, transport.clone(), 1000);
        spawn_pump(sessions.clone(), rx);

        let ticket = sessions.start_pairing("a1").await.unwrap();
        assert!(ticket.pairing_artifact.is_some());
        sessions
            .on_channel_event(event(
                "a1",
                &ticket.connection_id,
                ChannelEventKind::AuthFailure { reason: "session revoked".into() },
            ))
            .await;

        let snapshot = sessions.status("a1").await;
        assert_eq!(snapshot.status, ConnectionStatus::Error);
        assert!(snapshot.pairing_artifact.is_none());
        assert_eq!(snapshot.last_error.as_deref(), Some("session revoked"));
        assert_eq!(transport.purged.lock().unwrap().clone(), vec![ticket.connection_id]);
        assert!(transport.open_ids().is_empty());

        assert_eq!(sessions.disconnect("a1").await.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_wakes_a_pending_pairing_wait() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport, 5_000);

        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.start_pairing("a1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        sessions.disconnect("a1").await;

        let ticket = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pairing wait was not cancelled")
            .unwrap()
            .unwrap();
        assert_eq!(ticket.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn send_requires_connected_channel() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport.clone(), 10);

        assert!(matches!(
            sessions.send("a1", "5511", "oi").await,
            Err(GatewayError::ChannelNotConnected(_))
        ));

        let ticket = sessions.start_pairing("a1").await.unwrap();
        sessions
            .on_channel_event(event(
                "a1",
                &ticket.connection_id,
                ChannelEventKind::Connected { channel: "5511".into() },
            ))
            .await;
        sessions.send("a1", "5599", "oi").await.unwrap();
        assert_eq!(
            transport.sent(),
            vec![(ticket.connection_id, "5599".to_string(), "oi".to_string())]
        );
    }

    #[tokio::test]
    async fn fatal_send_failure_moves_connection_to_error() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport.clone(), 10);
        let ticket = sessions.start_pairing("a1").await.unwrap();
        sessions
            .on_channel_event(event(
                "a1",
                &ticket.connection_id,
                ChannelEventKind::Connected { channel: "5511".into() },
            ))
            .await;
        *transport.fatal_send.lock().unwrap() = true;

        let result = sessions.send("a1", "5599", "oi").await;
        assert!(matches!(result, Err(GatewayError::TransportFatal(_))));

        let snapshot = sessions.status("a1").await;
        assert_eq!(snapshot.status, ConnectionStatus::Error);
        assert!(snapshot.pairing_artifact.is_none());
        assert_eq!(snapshot.last_error.as_deref(), Some("send returned 401"));
        assert_eq!(transport.purged.lock().unwrap().clone(), vec![ticket.connection_id]);
        assert!(transport.open_ids().is_empty());
        assert_eq!(sessions.resolve_channel("5511").await, None);

        // A fresh pairing starts cleanly afterwards.
        let retry = sessions.start_pairing("a1").await.unwrap();
        assert_eq!(retry.status, ConnectionStatus::Pairing);
        assert_eq!(transport.open_ids().len(), 1);
    }

    #[tokio::test]
    async fn transient_send_failure_keeps_connection() {
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&["a1"]).await, transport.clone(), 10);
        let ticket = sessions.start_pairing("a1").await.unwrap();
        sessions
            .on_channel_event(event(
                "a1",
                &ticket.connection_id,
                ChannelEventKind::Connected { channel: "5511".into() },
            ))
            .await;
        *transport.fail_send.lock().unwrap() = true;

        assert!(matches!(
            sessions.send("a1", "5599", "oi").await,
            Err(GatewayError::Transport(_))
        ));
        assert_eq!(sessions.status("a1").await.status, ConnectionStatus::Connected);
        assert!(transport.purged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn random_interleavings_keep_one_live_connection_per_agent() {
        let agents = ["a1", "a2", "a3"];
        let transport = Arc::new(FakeTransport::default());
        let sessions = manager(store_with_agents(&agents).await, transport.clone(), 1);
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen_connections: Vec<(String, String)> = Vec::new();

        for _ in 0..300 {
            let agent = agents[rng.gen_range(0..agents.len())];
            let target = if !seen_connections.is_empty() && rng.gen_bool(0.3) {
                seen_connections[rng.gen_range(0..seen_connections.len())].clone()
            } else {
                let current = sessions.status(agent).await.connection_id.unwrap_or_default();
                (agent.to_string(), current)
            };
            match rng.gen_range(0..6) {
                0 => {
                    let ticket = sessions.start_pairing(agent).await.unwrap();
                    seen_connections.push((agent.to_string(), ticket.connection_id));
                }
                1 => {
                    sessions.disconnect(agent).await;
                }
                2 => {
                    sessions
                        .on_channel_event(event(&target.0, &target.1, ChannelEventKind::Connected {
                            channel: format!("55{}", rng.gen_range(100..999)),
                        }))
                        .await;
                }
                3 => {
                    sessions
                        .on_channel_event(event(&target.0, &target.1, ChannelEventKind::AuthFailure {
                            reason: "boom".into(),
                        }))
                        .await;
                }
                4 => {
                    sessions
                        .on_channel_event(event(&target.0, &target.1, ChannelEventKind::PairingArtifact {
                            qr: "qr".into(),
                        }))
                        .await;
                }
                _ => {
                    sessions
                        .on_channel_event(event(&target.0, &target.1, ChannelEventKind::Disconnected {
                            reason: String::new(),
                        }))
                        .await;
                }
            }

            let open = transport.open_ids();
            let mut live = HashSet::new();
            for agent in agents {
                let snapshot = sessions.status(agent).await;
                if snapshot.status.is_live() {
                    live.insert(snapshot.connection_id.unwrap());
                }
                if snapshot.status != ConnectionStatus::Pairing {
                    assert!(snapshot.pairing_artifact.is_none());
                }
            }
            // Transport resources are held by exactly the live connections.
            assert_eq!(open, live);
        }
    }
}
