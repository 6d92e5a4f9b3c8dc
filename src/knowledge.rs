use std::{cmp::Ordering, collections::BTreeSet, sync::Arc};

use serde::Serialize;

use crate::error::Result;
use crate::intent::{normalize, Intent};
use crate::store::ConversationStore;
use crate::types::KnowledgeEntry;

const FUZZY_THRESHOLD: f64 = 0.9;
const TITLE_BONUS: f32 = 0.5;
const TAG_BOOST: f32 = 0.25;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "are", "what", "with", "can", "does", "have", "this",
    "that", "how", "que", "qual", "quais", "para", "com", "uma", "voces", "voce", "vcs", "por",
    "favor", "dos", "das", "nos", "nas", "tem", "sobre", "gostaria", "queria", "saber",
    "minha", "meu", "seu", "sua", "clinica", "clinic",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f32,
}

pub struct KnowledgeRetriever {
    store: Arc<dyn ConversationStore>,
    min_score: f32,
    limit: usize,
}

impl KnowledgeRetriever {
    pub fn new(store: Arc<dyn ConversationStore>, min_score: f32, limit: usize) -> Self {
        Self {
            store,
            min_score,
            limit,
        }
    }

    pub async fn retrieve(
        &self,
        clinic_id: &str,
        query: &str,
        intent: Intent,
    ) -> Result<Vec<ScoredEntry>> {
        let entries = self.store.knowledge(clinic_id).await?;
        Ok(rank(entries, query, intent, self.min_score, self.limit))
    }
}

fn terms(text: &str) -> Vec<String> {
    normalize(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3 && !STOPWORDS.contains(word))
        .map(str::to_string)
        .collect()
}

fn term_match(term: &str, candidates: &BTreeSet<String>) -> f32 {
    if candidates.contains(term) {
        return 1.0;
    }
    let best = candidates
        .iter()
        .map(|candidate| strsim::jaro_winkler(term, candidate))
        .fold(0.0f64, f64::max);
    if best >= FUZZY_THRESHOLD {
        0.8
    } else {
        0.0
    }
}

/// Ranks `entries` for `query`. Score is textual relevance and intent-tag
/// match, weighted by importance; ties go to the most recently updated entry.
pub fn rank(
    entries: Vec<KnowledgeEntry>,
    query: &str,
    intent: Intent,
    min_score: f32,
    limit: usize,
) -> Vec<ScoredEntry> {
    let query_terms = terms(query)
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let intent_tags = intent.knowledge_tags();

    let mut scored = entries
        .into_iter()
        .filter_map(|entry| {
            let title_terms = terms(&entry.title).into_iter().collect::<BTreeSet<_>>();
            let mut body_terms = terms(&entry.content).into_iter().collect::<BTreeSet<_>>();
            body_terms.extend(title_terms.iter().cloned());
            body_terms.extend(entry.tags.iter().flat_map(|tag| terms(tag)));
            body_terms.extend(terms(&entry.category));

            let relevance = if query_terms.is_empty() {
                0.0
            } else {
                let matched = query_terms
                    .iter()
                    .map(|term| {
                        let base = term_match(term, &body_terms);
                        if base > 0.0 && term_match(term, &title_terms) > 0.0 {
                            base + TITLE_BONUS
                        } else {
                            base
                        }
                    })
                    .sum::<f32>();
                (matched / query_terms.len() as f32).min(1.0)
            };

            let tag_match = entry
                .tags
                .iter()
                .chain(std::iter::once(&entry.category))
                .map(|tag| normalize(tag))
                .any(|tag| intent_tags.contains(&tag.as_str()));
            let boost = if tag_match { TAG_BOOST } else { 0.0 };

            let weight = 0.5 + 0.5 * entry.importance.clamp(0.0, 1.0);
            let score = (relevance * (1.0 - TAG_BOOST) + boost) * weight;
            (score >= min_score && score > 0.0).then_some(ScoredEntry { entry, score })
        })
        .collect::<Vec<_>>();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn entry(id: &str, title: &str, content: &str, tags: &[&str], importance: f32) -> KnowledgeEntry {
        KnowledgeEntry {
            id: id.to_string(),
            clinic_id: "c1".to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            category: String::new(),
            importance,
            updated_at: Utc::now(),
        }
    }

    fn corpus() -> Vec<KnowledgeEntry> {
        vec![
            entry(
                "hours",
                "Horário de funcionamento",
                "Atendemos de segunda a sexta, das 8h às 18h, e aos sábados até 12h.",
                &["hours"],
                1.0,
            ),
            entry(
                "insurance",
                "Convênios aceitos",
                "Aceitamos Unimed, Amil e SulAmérica. Reembolso para demais planos.",
                &["insurance"],
                0.8,
            ),
            entry(
                "whitening",
                "Clareamento dental",
                "O clareamento é feito em duas sessões com gel de peróxido.",
                &["services"],
                0.6,
            ),
        ]
    }

    #[test]
    fn matching_query_ranks_relevant_entry_first() {
        let ranked = rank(corpus(), "Vocês aceitam convênio Unimed?", Intent::InfoInsurance, 0.15, 4);
        assert_eq!(ranked.first().map(|s| s.entry.id.as_str()), Some("insurance"));
    }

    #[test]
    fn fuzzy_terms_still_match() {
        let ranked = rank(corpus(), "quanto custa o clareamentos", Intent::Unknown, 0.15, 4);
        assert_eq!(ranked.first().map(|s| s.entry.id.as_str()), Some("whitening"));
    }

    #[test]
    fn unrelated_query_returns_empty() {
        let ranked = rank(corpus(), "xylophone quantum banana", Intent::Unknown, 0.15, 4);
        assert!(ranked.is_empty());
    }

    #[test]
    fn intent_tag_boosts_topical_entry() {
        let ranked = rank(corpus(), "vocês abrem amanhã?", Intent::InfoHours, 0.15, 4);
        assert_eq!(ranked.first().map(|s| s.entry.id.as_str()), Some("hours"));
    }

    #[test]
    fn ties_go_to_most_recent_entry() {
        let now = Utc::now();
        let mut older = entry("old", "Estacionamento", "Estacionamento conveniado.", &[], 1.0);
        older.updated_at = now - Duration::days(3);
        let mut newer = entry("new", "Estacionamento", "Estacionamento conveniado.", &[], 1.0);
        newer.updated_at = now;

        let ranked = rank(vec![older, newer], "estacionamento", Intent::Unknown, 0.15, 4);
        let ids = ranked.iter().map(|s| s.entry.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn importance_weights_equal_relevance() {
        let low = entry("low", "Exames", "Exames de rotina.", &[], 0.1);
        let high = entry("high", "Exames", "Exames de rotina.", &[], 1.0);
        let ranked = rank(vec![low, high], "exames", Intent::Unknown, 0.0, 4);
        assert_eq!(ranked[0].entry.id, "high");
        assert!(ranked[0].score > ranked[1].score);
    }
}
