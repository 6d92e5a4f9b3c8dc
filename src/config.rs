use std::{env, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub database_url: Option<String>,
    /// JSON file of agents and knowledge loaded when there is no database.
    pub seed_file: Option<PathBuf>,
    pub public_base_url: String,
    pub bridge_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_chat_model: String,
    pub generation_temperature: f32,
    pub generation_timeout: Duration,
    pub transport_timeout: Duration,
    pub pairing_wait: Duration,
    pub memory_window: usize,
    pub summary_interval: u32,
    pub escalation_confidence_threshold: f32,
    pub escalation_streak: u32,
    pub max_workers: usize,
    pub max_reply_chars: usize,
    pub retrieval_min_score: f32,
    pub retrieval_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            seed_file: None,
            public_base_url: "http://localhost:4000".to_string(),
            bridge_url: None,
            webhook_secret: None,
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_chat_model: "gpt-4.1-mini".to_string(),
            generation_temperature: 0.4,
            generation_timeout: Duration::from_secs(20),
            transport_timeout: Duration::from_secs(10),
            pairing_wait: Duration::from_secs(5),
            memory_window: 20,
            summary_interval: 6,
            escalation_confidence_threshold: 0.4,
            escalation_streak: 3,
            max_workers: 32,
            max_reply_chars: 1200,
            retrieval_min_score: 0.15,
            retrieval_limit: 4,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = parse_var("PORT", defaults.port);
        let public_base_url = text_var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        Self {
            port,
            database_url: text_var("DATABASE_URL"),
            seed_file: text_var("SEED_FILE").map(PathBuf::from),
            public_base_url,
            bridge_url: text_var("BRIDGE_URL").map(|url| url.trim_end_matches('/').to_string()),
            webhook_secret: text_var("WEBHOOK_SECRET"),
            openai_api_key: text_var("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: text_var("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.openai_base_url),
            openai_chat_model: text_var("OPENAI_CHAT_MODEL").unwrap_or(defaults.openai_chat_model),
            generation_temperature: parse_var(
                "GENERATION_TEMPERATURE",
                defaults.generation_temperature,
            )
            .clamp(0.0, 2.0),
            generation_timeout: millis_var("GENERATION_TIMEOUT_MS", defaults.generation_timeout),
            transport_timeout: millis_var("TRANSPORT_TIMEOUT_MS", defaults.transport_timeout),
            pairing_wait: millis_var("PAIRING_WAIT_MS", defaults.pairing_wait),
            memory_window: parse_var("MEMORY_WINDOW", defaults.memory_window).max(1),
            summary_interval: parse_var("SUMMARY_INTERVAL", defaults.summary_interval).max(1),
            escalation_confidence_threshold: parse_var(
                "ESCALATION_CONFIDENCE_THRESHOLD",
                defaults.escalation_confidence_threshold,
            )
            .clamp(0.0, 1.0),
            escalation_streak: parse_var("ESCALATION_STREAK", defaults.escalation_streak).max(1),
            max_workers: parse_var("MAX_WORKERS", defaults.max_workers).max(1),
            max_reply_chars: parse_var("MAX_REPLY_CHARS", defaults.max_reply_chars).max(80),
            retrieval_min_score: parse_var("RETRIEVAL_MIN_SCORE", defaults.retrieval_min_score),
            retrieval_limit: parse_var("RETRIEVAL_LIMIT", defaults.retrieval_limit).max(1),
        }
    }
}

fn text_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr + Copy>(name: &str, default: T) -> T {
    let Some(raw) = text_var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring malformed setting, using default");
            default
        }
    }
}

fn millis_var(name: &str, default: Duration) -> Duration {
    let millis = parse_var(name, default.as_millis() as u64);
    Duration::from_millis(millis)
}
