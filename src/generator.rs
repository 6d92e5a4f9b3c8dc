use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::intent::{Classification, Intent};
use crate::knowledge::ScoredEntry;
use crate::personalization::detect_language;
use crate::prompting::{
    render_system_prompt, render_user_content, SystemPromptContext, UserContentContext,
};
use crate::types::{Agent, MemoryRecord, PersonalizationProfile, TurnRole};

pub const NO_INFORMATION_REPLY_PT: &str = "Não tenho essa informação no momento. \
     Posso encaminhar sua pergunta para a equipe da clínica, que retorna em breve.";
pub const NO_INFORMATION_REPLY_EN: &str = "I don't have that information right now. \
     I can pass your question to the clinic team so they can get back to you.";
pub const FALLBACK_REPLY_PT: &str = "Desculpe, tive um problema para responder agora. \
     Já avisei nossa equipe e alguém vai continuar o atendimento por aqui.";
pub const FALLBACK_REPLY_EN: &str = "Sorry, I had a problem answering just now. \
     I've let our team know and someone will follow up here.";
pub const HANDOFF_REPLY_PT: &str = "Certo! Vou chamar alguém da nossa equipe para falar com você.";
pub const HANDOFF_REPLY_EN: &str = "Sure! I'm bringing in someone from our team to talk with you.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Portuguese,
    English,
}

impl Language {
    fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "pt" | "pt-br" | "portuguese" => Some(Self::Portuguese),
            "en" | "en-us" | "english" => Some(Self::English),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Portuguese => "Brazilian Portuguese",
            Self::English => "English",
        }
    }

    pub fn no_information_reply(self) -> &'static str {
        match self {
            Self::Portuguese => NO_INFORMATION_REPLY_PT,
            Self::English => NO_INFORMATION_REPLY_EN,
        }
    }

    pub fn fallback_reply(self) -> &'static str {
        match self {
            Self::Portuguese => FALLBACK_REPLY_PT,
            Self::English => FALLBACK_REPLY_EN,
        }
    }

    fn handoff_reply(self) -> &'static str {
        match self {
            Self::Portuguese => HANDOFF_REPLY_PT,
            Self::English => HANDOFF_REPLY_EN,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub description: String,
    pub price: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Professional {
    pub name: String,
    pub specialty: String,
}

/// Typed view of an agent's free-form context document. Every field has a
/// default so a malformed document degrades to a generic persona.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentContext {
    pub clinic_name: String,
    pub address: String,
    pub phone: String,
    pub hours: String,
    pub language: Option<String>,
    pub services: Vec<ServiceInfo>,
    pub professionals: Vec<Professional>,
    pub insurance: Vec<String>,
}

fn text_field(value: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| value.get(*key))
        .map(|field| match field {
            Value::String(text) => text.trim().to_string(),
            Value::Number(number) => number.to_string(),
            Value::Object(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| format!("{k}: {v}")))
                .collect::<Vec<_>>()
                .join("; "),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; "),
            _ => String::new(),
        })
        .unwrap_or_default()
}

impl AgentContext {
    pub fn from_value(value: &Value) -> Self {
        if !value.is_object() {
            return Self::default();
        }
        let clinic = value
            .get("clinic")
            .or_else(|| value.get("clinicInfo"))
            .or_else(|| value.get("clinic_info"))
            .filter(|v| v.is_object())
            .unwrap_or(value);

        let services = value
            .get("services")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(ServiceInfo {
                            name: name.trim().to_string(),
                            ..Default::default()
                        }),
                        Value::Object(_) => Some(ServiceInfo {
                            name: text_field(item, &["name", "title"]),
                            description: text_field(item, &["description"]),
                            price: text_field(item, &["price", "valor"]),
                        }),
                        _ => None,
                    })
                    .filter(|service| !service.name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let professionals = value
            .get("professionals")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(Professional {
                            name: name.trim().to_string(),
                            specialty: String::new(),
                        }),
                        Value::Object(_) => Some(Professional {
                            name: text_field(item, &["name"]),
                            specialty: text_field(item, &["specialty", "especialidade"]),
                        }),
                        _ => None,
                    })
                    .filter(|p| !p.name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let insurance = value
            .get("insurance")
            .or_else(|| value.get("insurancePlans"))
            .or_else(|| value.get("convenios"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let language = text_field(value, &["language", "idioma"]);

        Self {
            clinic_name: text_field(clinic, &["name", "clinicName", "clinic_name"]),
            address: text_field(clinic, &["address", "endereco"]),
            phone: text_field(clinic, &["phone", "telefone"]),
            hours: text_field(clinic, &["hours", "openingHours", "opening_hours", "horario"]),
            language: (!language.is_empty()).then_some(language),
            services,
            professionals,
            insurance,
        }
    }

    /// Context facts relevant to a fact-seeking intent, if the document has any.
    pub fn facts_for(&self, intent: Intent) -> Option<String> {
        match intent {
            Intent::InfoHours => (!self.hours.is_empty()).then(|| format!("- Hours: {}", self.hours)),
            Intent::InfoLocation => (!self.address.is_empty())
                .then(|| format!("- Address: {}", self.address)),
            Intent::InfoServices => (!self.services.is_empty()).then(|| self.services_block()),
            Intent::InfoInsurance => (!self.insurance.is_empty())
                .then(|| format!("- Insurance plans accepted: {}", self.insurance.join(", "))),
            _ => None,
        }
    }

    fn services_block(&self) -> String {
        self.services
            .iter()
            .map(|service| {
                let mut line = format!("- Service: {}", service.name);
                if !service.description.is_empty() {
                    line.push_str(&format!(" ({})", service.description));
                }
                if !service.price.is_empty() {
                    line.push_str(&format!(", price {}", service.price));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clinic_facts(&self) -> String {
        let mut lines = Vec::new();
        if !self.address.is_empty() {
            lines.push(format!("- Address: {}", self.address));
        }
        if !self.phone.is_empty() {
            lines.push(format!("- Phone: {}", self.phone));
        }
        if !self.hours.is_empty() {
            lines.push(format!("- Hours: {}", self.hours));
        }
        if !self.services.is_empty() {
            lines.push(self.services_block());
        }
        for professional in &self.professionals {
            if professional.specialty.is_empty() {
                lines.push(format!("- Professional: {}", professional.name));
            } else {
                lines.push(format!(
                    "- Professional: {} ({})",
                    professional.name, professional.specialty
                ));
            }
        }
        if !self.insurance.is_empty() {
            lines.push(format!("- Insurance plans accepted: {}", self.insurance.join(", ")));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible chat completions endpoint.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if self.api_key.trim().is_empty() {
            return Err(GatewayError::Backend("OPENAI_API_KEY not configured".to_string()));
        }
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": request.system },
                    { "role": "user", "content": request.user }
                ],
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }))
            .send()
            .await
            .map_err(|err| GatewayError::Backend(format!("request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Backend(format!("returned {status}: {body}")));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| GatewayError::Backend(format!("parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(GatewayError::Backend("response had empty content".to_string()));
        }
        Ok(text)
    }
}

pub struct GenerationRequest<'a> {
    pub agent: &'a Agent,
    pub classification: &'a Classification,
    pub retrieved: &'a [ScoredEntry],
    pub memory: &'a MemoryRecord,
    pub profile: &'a PersonalizationProfile,
    pub user_message: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub reply: String,
    /// Set when the backend errored or timed out and `reply` is the canned fallback.
    pub backend_failure: Option<String>,
    /// Whether retrieved knowledge or agent-context facts backed the prompt.
    pub grounded: bool,
}

impl Generated {
    pub fn backend_failed(&self) -> bool {
        self.backend_failure.is_some()
    }
}

pub struct ResponseGenerator {
    backend: Arc<dyn GenerationBackend>,
    default_temperature: f32,
    timeout: Duration,
    max_reply_chars: usize,
}

impl ResponseGenerator {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        default_temperature: f32,
        timeout: Duration,
        max_reply_chars: usize,
    ) -> Self {
        Self {
            backend,
            default_temperature,
            timeout,
            max_reply_chars,
        }
    }

    pub async fn generate(&self, request: GenerationRequest<'_>) -> Generated {
        let context = AgentContext::from_value(&request.agent.context);
        let intent = request.classification.intent;
        let language = reply_language(&request, &context);
        let context_facts = context.facts_for(intent);
        let grounded = !request.retrieved.is_empty() || context_facts.is_some();

        if intent == Intent::EscalationRequest {
            return Generated {
                reply: language.handoff_reply().to_string(),
                backend_failure: None,
                grounded: false,
            };
        }

        if intent.is_fact_seeking() && !grounded {
            return Generated {
                reply: language.no_information_reply().to_string(),
                backend_failure: None,
                grounded: false,
            };
        }

        let assistant_name = if request.agent.name.trim().is_empty() {
            "Assistente"
        } else {
            request.agent.name.trim()
        };
        let clinic_name = if context.clinic_name.is_empty() {
            "the clinic"
        } else {
            context.clinic_name.as_str()
        };
        let clinic_facts = context.clinic_facts();
        let system = render_system_prompt(&SystemPromptContext {
            assistant_name,
            clinic_name,
            personality: &request.agent.personality,
            clinic_facts: &clinic_facts,
            language: language.name(),
            max_chars: self.max_reply_chars,
        });

        let entities_block = request
            .classification
            .entities
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        let user = render_user_content(&UserContentContext {
            profile_block: &profile_block(request.profile),
            memory_block: &memory_block(request.memory),
            knowledge_block: &knowledge_block(request.retrieved),
            intent: intent.as_str(),
            entities_block: &entities_block,
            patient_message: request.user_message,
        });

        let completion = CompletionRequest {
            system,
            user,
            temperature: request
                .agent
                .temperature
                .unwrap_or(self.default_temperature)
                .clamp(0.0, 2.0),
            max_tokens: (self.max_reply_chars / 3).max(64) as u32,
        };

        let outcome = tokio::time::timeout(self.timeout, self.backend.complete(&completion)).await;
        let failure = match outcome {
            Ok(Ok(raw)) => {
                let reply = extract_reply(&raw);
                if !reply.is_empty() {
                    return Generated {
                        reply: clip_reply(&reply, self.max_reply_chars),
                        backend_failure: None,
                        grounded,
                    };
                }
                GatewayError::Backend("empty reply".to_string())
            }
            Ok(Err(err)) => err,
            Err(_) => GatewayError::BackendTimeout,
        };

        tracing::warn!(
            agent_id = %request.agent.id,
            error = %failure,
            "generation failed, using fallback reply"
        );
        Generated {
            reply: language.fallback_reply().to_string(),
            backend_failure: Some(failure.code().to_string()),
            grounded: false,
        }
    }
}

fn reply_language(request: &GenerationRequest<'_>, context: &AgentContext) -> Language {
    detect_language(request.user_message)
        .and_then(Language::from_code)
        .or_else(|| request.profile.language.as_deref().and_then(Language::from_code))
        .or_else(|| context.language.as_deref().and_then(Language::from_code))
        .unwrap_or(Language::Portuguese)
}

fn profile_block(profile: &PersonalizationProfile) -> String {
    let mut lines = Vec::new();
    if let Some(name) = &profile.preferred_name {
        lines.push(format!("- Name: {name}"));
    }
    for (key, value) in &profile.preferences {
        lines.push(format!("- {key}: {value}"));
    }
    if !profile.tags.is_empty() {
        lines.push(format!(
            "- Tags: {}",
            profile.tags.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if profile.interaction_count > 0 {
        lines.push(format!("- Previous interactions: {}", profile.interaction_count));
    }
    lines.join("\n")
}

fn memory_block(memory: &MemoryRecord) -> String {
    let mut block = String::new();
    if let Some(summary) = &memory.summary {
        block.push_str(&format!("Summary: {summary}\n"));
    }
    for turn in &memory.turns {
        let who = match turn.role {
            TurnRole::Patient => "Patient",
            TurnRole::Assistant => "Assistant",
        };
        block.push_str(&format!("{who}: {}\n", turn.text));
    }
    block
}

fn knowledge_block(retrieved: &[ScoredEntry]) -> String {
    retrieved
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let clipped = item.entry.content.chars().take(900).collect::<String>();
            format!(
                "[{}] {} (relevance {:.3})\n{}",
                idx + 1,
                item.entry.title,
                item.score,
                clipped
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Accepts plain text, fenced text, or a JSON object with a `reply` field.
fn extract_reply(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    };

    if let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) {
        if end > start {
            if let Ok(parsed) = serde_json::from_str::<Value>(&unfenced[start..=end]) {
                if let Some(reply) = parsed
                    .get("reply")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|reply| !reply.is_empty())
                {
                    return reply.to_string();
                }
            }
        }
    }
    unfenced.to_string()
}

/// Bounds a reply to `max_chars`, preferring to cut at a sentence end.
pub fn clip_reply(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let clipped = trimmed.chars().take(max_chars).collect::<String>();
    let floor = clipped.len() * 3 / 5;
    if let Some(cut) = clipped
        .char_indices()
        .filter(|(idx, c)| *idx >= floor && matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(idx, c)| idx + c.len_utf8())
        .last()
    {
        return clipped[..cut].trim_end().to_string();
    }
    let mut clipped = trimmed
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    clipped.push('…');
    clipped
}
