use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::escalation::EscalationMonitor;
use crate::generator::{GenerationBackend, OpenAiBackend, ResponseGenerator};
use crate::intent::IntentClassifier;
use crate::knowledge::KnowledgeRetriever;
use crate::memory::MemoryManager;
use crate::personalization::PersonalizationStore;
use crate::pg_store::PgStore;
use crate::pipeline::TurnPipeline;
use crate::session::{ConnectionSnapshot, PairingTicket, SessionManager};
use crate::store::{ConversationStore, MemoryStore, Seed};
use crate::transport::{BridgeTransport, ChannelTransport, UnconfiguredTransport};
use crate::types::{AgentBody, HealthResponse};
use crate::webhook::{verify_signature, IngestReport, WebhookRouter};

const WORKER_IDLE: Duration = Duration::from_secs(30);

pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<dyn ConversationStore>,
    pub sessions: Arc<SessionManager>,
    pub webhook: Arc<WebhookRouter>,
}

/// Wires every component around the given store, transport and backend.
pub fn build_state(
    config: GatewayConfig,
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn ChannelTransport>,
    backend: Arc<dyn GenerationBackend>,
) -> Arc<AppState> {
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        transport,
        config.pairing_wait,
        config.transport_timeout,
    ));
    let pipeline = Arc::new(TurnPipeline::new(
        store.clone(),
        sessions.clone(),
        IntentClassifier::new(),
        KnowledgeRetriever::new(store.clone(), config.retrieval_min_score, config.retrieval_limit),
        MemoryManager::new(store.clone(), config.memory_window, config.summary_interval),
        PersonalizationStore::new(store.clone()),
        ResponseGenerator::new(
            backend,
            config.generation_temperature,
            config.generation_timeout,
            config.max_reply_chars,
        ),
        EscalationMonitor::new(
            store.clone(),
            config.escalation_confidence_threshold,
            config.escalation_streak,
        ),
    ));
    let webhook = Arc::new(WebhookRouter::new(
        store.clone(),
        sessions.clone(),
        pipeline,
        config.max_workers,
        WORKER_IDLE,
    ));
    Arc::new(AppState {
        config,
        store,
        sessions,
        webhook,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentQuery {
    agent_id: Option<String>,
}

fn agent_id_from(body: std::result::Result<Json<AgentBody>, JsonRejection>) -> Result<String> {
    let Json(body) = body.map_err(|rejection| GatewayError::Validation(rejection.body_text()))?;
    let agent_id = body.agent_id.trim();
    if agent_id.is_empty() {
        return Err(GatewayError::Validation("agentId is required".to_string()));
    }
    Ok(agent_id.to_string())
}

async fn start_pairing(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<AgentBody>, JsonRejection>,
) -> Result<Json<PairingTicket>> {
    let agent_id = agent_id_from(body)?;
    Ok(Json(state.sessions.start_pairing(&agent_id).await?))
}

async fn get_pairing_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<ConnectionSnapshot>> {
    let agent_id = query
        .agent_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GatewayError::Validation("agentId is required".to_string()))?;
    Ok(Json(state.sessions.status(&agent_id).await))
}

async fn post_pairing_status(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<AgentBody>, JsonRejection>,
) -> Result<Json<ConnectionSnapshot>> {
    let agent_id = agent_id_from(body)?;
    Ok(Json(state.sessions.status(&agent_id).await))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<AgentBody>, JsonRejection>,
) -> Result<Json<ConnectionSnapshot>> {
    let agent_id = agent_id_from(body)?;
    Ok(Json(state.sessions.disconnect(&agent_id).await))
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReport>> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(state.config.webhook_secret.as_deref(), signature, &body) {
        tracing::warn!("webhook rejected: bad signature");
        return Err(GatewayError::Unauthorized);
    }
    let payload = serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|err| GatewayError::Validation(format!("body is not JSON: {err}")))?;

    let report = state.webhook.ingest(&payload).await.map_err(|err| {
        tracing::warn!(code = err.code(), error = %err, "webhook rejected");
        err
    })?;
    Ok(Json(report))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let sessions = state.sessions.sessions().await;
    let active_sessions = sessions.iter().filter(|s| s.status.is_live()).count();
    let status = if state.store.ping().await { "ok" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        active_sessions,
        active_conversations: state.webhook.active_workers().await,
        sessions,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pairing/start", post(start_pairing))
        .route(
            "/pairing/status",
            get(get_pairing_status).post(post_pairing_status),
        )
        .route("/connection/disconnect", post(disconnect))
        .route("/webhook", post(webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

pub async fn run(config: GatewayConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn ConversationStore> = match &config.database_url {
        Some(database_url) => {
            let db = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            tracing::info!("using postgres store");
            Arc::new(PgStore::new(db))
        }
        None => match &config.seed_file {
            Some(path) => {
                let seed = Seed::from_file(path).await?;
                tracing::info!(
                    path = %path.display(),
                    agents = seed.agents.len(),
                    knowledge = seed.knowledge.len(),
                    "DATABASE_URL not set, using in-memory store from seed file"
                );
                Arc::new(MemoryStore::seeded(seed).await)
            }
            None => {
                tracing::warn!("DATABASE_URL and SEED_FILE not set, in-memory store starts without agents");
                Arc::new(MemoryStore::new())
            }
        },
    };

    let http = reqwest::Client::new();
    let transport: Arc<dyn ChannelTransport> = match &config.bridge_url {
        Some(bridge_url) => Arc::new(BridgeTransport::new(
            http.clone(),
            bridge_url,
            &config.public_base_url,
        )),
        None => {
            tracing::warn!("BRIDGE_URL not set, pairing is unavailable");
            Arc::new(UnconfiguredTransport)
        }
    };
    if config.openai_api_key.is_empty() {
        tracing::warn!("OPENAI_API_KEY not set, replies will use the fallback message");
    }
    let backend = Arc::new(OpenAiBackend::new(
        http,
        &config.openai_base_url,
        &config.openai_api_key,
        &config.openai_chat_model,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = build_state(config, store, transport, backend);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("clinic gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down channel sessions");
    state.sessions.shutdown().await;
    Ok(())
}
