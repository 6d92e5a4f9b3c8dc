use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::Utc;

use crate::error::Result;
use crate::intent::{normalize, Classification, Intent};
use crate::keyed_lock::KeyedLocks;
use crate::store::ConversationStore;
use crate::types::{ConversationKey, PersonalizationProfile};

/// What a single turn taught us about the counterparty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observations {
    pub preferred_name: Option<String>,
    pub language: Option<String>,
    pub preferences: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub intent: Option<String>,
}

impl Observations {
    pub fn from_turn(classification: &Classification, text: &str, sender_name: Option<&str>) -> Self {
        let mut observations = Observations {
            preferred_name: sender_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            language: detect_language(text).map(str::to_string),
            intent: Some(classification.intent.as_str().to_string()),
            ..Default::default()
        };

        let tag = match classification.intent {
            Intent::AppointmentCreate => Some("books_appointments"),
            Intent::AppointmentCancel => Some("has_cancelled"),
            Intent::InfoInsurance => Some("insurance_user"),
            Intent::InfoServices => Some("service_shopper"),
            Intent::EscalationRequest => Some("prefers_human"),
            _ => None,
        };
        if let Some(tag) = tag {
            observations.tags.insert(tag.to_string());
        }

        for (entity, preference) in [
            ("time", "preferred_time"),
            ("weekday", "preferred_weekday"),
            ("email", "email"),
            ("phone", "contact_phone"),
        ] {
            if let Some(value) = classification.entities.get(entity) {
                observations
                    .preferences
                    .insert(preference.to_string(), value.clone());
            }
        }

        if classification.intent == Intent::InfoInsurance {
            let normalized = normalize(text);
            if let Some(plan) = ["unimed", "amil", "bradesco saude", "sulamerica", "hapvida"]
                .iter()
                .find(|plan| normalized.contains(*plan))
            {
                observations
                    .preferences
                    .insert("insurance_plan".to_string(), plan.to_string());
            }
        }

        observations
    }
}

/// Very small stopword vote between Portuguese and English.
pub fn detect_language(text: &str) -> Option<&'static str> {
    const PT: &[&str] = &[
        "oi", "ola", "voce", "voces", "obrigado", "obrigada", "quero", "para", "consulta", "nao",
        "sim", "bom", "boa", "qual", "onde", "como", "uma", "tem",
    ];
    const EN: &[&str] = &[
        "hi", "hello", "you", "thanks", "thank", "want", "for", "appointment", "not", "yes",
        "good", "what", "where", "how", "the", "have", "can",
    ];
    let normalized = normalize(text);
    let words = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    let pt = words.iter().filter(|w| PT.contains(*w)).count();
    let en = words.iter().filter(|w| EN.contains(*w)).count();
    match pt.cmp(&en) {
        std::cmp::Ordering::Greater => Some("pt"),
        std::cmp::Ordering::Less => Some("en"),
        std::cmp::Ordering::Equal => None,
    }
}

pub struct PersonalizationStore {
    store: Arc<dyn ConversationStore>,
    writers: KeyedLocks<ConversationKey>,
}

impl PersonalizationStore {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            writers: KeyedLocks::new(),
        }
    }

    /// Returns the profile, creating and persisting an empty one on first access.
    pub async fn profile(&self, key: &ConversationKey) -> Result<PersonalizationProfile> {
        if let Some(profile) = self.store.load_profile(key).await? {
            return Ok(profile);
        }
        let _writer = self.writers.lock(key).await;
        if let Some(profile) = self.store.load_profile(key).await? {
            return Ok(profile);
        }
        let profile = PersonalizationProfile::empty(key.clone());
        self.store.save_profile(&profile).await?;
        Ok(profile)
    }

    /// Merges observations into the stored profile. Known preferences and
    /// tags are only ever added to or updated, never removed.
    pub async fn update(
        &self,
        key: &ConversationKey,
        observations: Observations,
    ) -> Result<PersonalizationProfile> {
        let _writer = self.writers.lock(key).await;
        let mut profile = self
            .store
            .load_profile(key)
            .await?
            .unwrap_or_else(|| PersonalizationProfile::empty(key.clone()));

        if let Some(name) = observations.preferred_name {
            profile.preferred_name = Some(name);
        }
        if let Some(language) = observations.language {
            profile.language = Some(language);
        }
        profile.preferences.extend(observations.preferences);
        profile.tags.extend(observations.tags);
        if observations.intent.is_some() {
            profile.last_intent = observations.intent;
        }
        profile.interaction_count += 1;
        profile.updated_at = Utc::now();

        self.store.save_profile(&profile).await?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentClassifier;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn first_access_creates_default_profile() {
        let store = Arc::new(MemoryStore::new());
        let profiles = PersonalizationStore::new(store.clone());
        let key = ConversationKey::new("a1", "5511");

        let profile = profiles.profile(&key).await.unwrap();
        assert_eq!(profile.interaction_count, 0);
        assert!(store.load_profile(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn updates_merge_without_dropping_known_preferences() {
        let profiles = PersonalizationStore::new(Arc::new(MemoryStore::new()));
        let key = ConversationKey::new("a1", "5511");

        let mut first = Observations::default();
        first
            .preferences
            .insert("preferred_time".to_string(), "09:00".to_string());
        first.tags.insert("insurance_user".to_string());
        first.preferred_name = Some("Ana".to_string());
        profiles.update(&key, first).await.unwrap();

        let mut second = Observations::default();
        second
            .preferences
            .insert("preferred_weekday".to_string(), "monday".to_string());
        let profile = profiles.update(&key, second).await.unwrap();

        assert_eq!(profile.preferences.get("preferred_time").map(String::as_str), Some("09:00"));
        assert_eq!(profile.preferences.get("preferred_weekday").map(String::as_str), Some("monday"));
        assert!(profile.tags.contains("insurance_user"));
        assert_eq!(profile.preferred_name.as_deref(), Some("Ana"));
        assert_eq!(profile.interaction_count, 2);
    }

    #[test]
    fn observations_capture_plan_and_language() {
        let classifier = IntentClassifier::new();
        let text = "Olá, vocês aceitam convênio Unimed?";
        let observations = Observations::from_turn(&classifier.classify(text), text, Some(" Ana "));

        assert_eq!(observations.preferred_name.as_deref(), Some("Ana"));
        assert_eq!(observations.language.as_deref(), Some("pt"));
        assert_eq!(
            observations.preferences.get("insurance_plan").map(String::as_str),
            Some("unimed")
        );
        assert!(observations.tags.contains("insurance_user"));
    }
}
