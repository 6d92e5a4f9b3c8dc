use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Inbound event names a channel that no live connection claims.
    #[error("no live connection claims channel '{0}'")]
    UnknownChannel(String),
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("invalid webhook signature")]
    Unauthorized,
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
    #[error("agent '{0}' is inactive")]
    AgentInactive(String),
    #[error("agent '{0}' has no connected channel")]
    ChannelNotConnected(String),
    #[error("transport error: {0}")]
    Transport(String),
    /// Unrecoverable auth/session failure reported by the channel.
    #[error("transport fatal: {0}")]
    TransportFatal(String),
    #[error("generation backend failed: {0}")]
    Backend(String),
    #[error("generation backend timed out")]
    BackendTimeout,
    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownChannel(_) => "unknown_channel",
            Self::Validation(_) => "validation_failed",
            Self::Unauthorized => "unauthorized",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::AgentInactive(_) => "agent_inactive",
            Self::ChannelNotConnected(_) => "channel_not_connected",
            Self::Transport(_) => "transport_error",
            Self::TransportFatal(_) => "transport_fatal",
            Self::Backend(_) => "backend_failure",
            Self::BackendTimeout => "backend_timeout",
            Self::Store(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownChannel(_) | Self::AgentNotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::AgentInactive(_) | Self::ChannelNotConnected(_) => StatusCode::CONFLICT,
            Self::Transport(_) | Self::TransportFatal(_) => StatusCode::BAD_GATEWAY,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            GatewayError::Store(detail) => {
                tracing::error!(error = %detail, "store failure while handling request");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };
        (
            status,
            Json(json!({ "error": self.code(), "message": message })),
        )
            .into_response()
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
