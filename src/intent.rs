use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    AppointmentCreate,
    AppointmentCancel,
    InfoHours,
    InfoLocation,
    InfoServices,
    InfoInsurance,
    EscalationRequest,
    Unknown,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::AppointmentCreate => "appointment_create",
            Self::AppointmentCancel => "appointment_cancel",
            Self::InfoHours => "info_hours",
            Self::InfoLocation => "info_location",
            Self::InfoServices => "info_services",
            Self::InfoInsurance => "info_insurance",
            Self::EscalationRequest => "escalation_request",
            Self::Unknown => "unknown",
        }
    }

    /// Intents whose answer is a clinic fact and therefore must be grounded.
    pub fn is_fact_seeking(self) -> bool {
        matches!(
            self,
            Self::InfoHours | Self::InfoLocation | Self::InfoServices | Self::InfoInsurance
        )
    }

    /// Knowledge tags that count as a topical match for this intent.
    pub fn knowledge_tags(self) -> &'static [&'static str] {
        match self {
            Self::InfoHours => &["hours", "horario", "schedule"],
            Self::InfoLocation => &["location", "address", "endereco", "parking"],
            Self::InfoServices => &["services", "servicos", "pricing", "treatments"],
            Self::InfoInsurance => &["insurance", "convenio", "plans"],
            Self::AppointmentCreate | Self::AppointmentCancel => {
                &["appointments", "agendamento", "policy"]
            }
            Self::Greeting | Self::EscalationRequest | Self::Unknown => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub entities: BTreeMap<String, String>,
    pub confidence: f32,
}

struct IntentRule {
    intent: Intent,
    patterns: Vec<Regex>,
}

/// Keyword rules in tie-break order: earlier rules win equal hit counts.
const RULES: &[(Intent, &[&str])] = &[
    (
        Intent::EscalationRequest,
        &[
            r"\bhuman\b",
            r"\breal person\b",
            r"\brepresentative\b",
            r"\blive agent\b",
            r"\btransfer\b",
            r"\bhandover\b",
            r"\b(talk|speak)( to| with)( an?)? (agent|someone|person)\b",
            r"\batendente\b",
            r"\bhumano\b",
            r"\bpessoa (real|de verdade)\b",
            r"\bfalar com (alguem|uma pessoa|a recepcao)\b",
        ],
    ),
    (
        Intent::AppointmentCancel,
        &[
            r"\bcancel(ar|amento|ation|led)?\b",
            r"\bdesmarcar\b",
            r"\bnao vou (poder ir|conseguir ir)\b",
            r"\bcan'?t make it\b",
        ],
    ),
    (
        Intent::AppointmentCreate,
        &[
            r"\bappointment\b",
            r"\bbook(ing)?\b",
            r"\bschedul(e|ing)\b",
            r"\bagend(ar|amento|a)\b",
            r"\bmarcar\b",
            r"\bconsulta\b",
            r"\bhorarios? (disponive(l|is)|livres?)\b",
            r"\bavailable (slot|time)s?\b",
        ],
    ),
    (
        Intent::InfoInsurance,
        &[
            r"\binsurance\b",
            r"\bconvenios?\b",
            r"\bplano( de saude)?\b",
            r"\bcoverage\b",
            r"\b(unimed|amil|bradesco saude|sulamerica|hapvida)\b",
            r"\breembolso\b",
        ],
    ),
    (
        Intent::InfoHours,
        &[
            r"\b(opening )?hours\b",
            r"\bwhen (do|are) you (open|close)\b",
            r"\bopen (on|today|tomorrow|saturday|sunday)\b",
            r"\bhorario de (funcionamento|atendimento)\b",
            r"\bque horas\b",
            r"\b(abre|fecha|funciona)\b",
            r"\baberto\b",
        ],
    ),
    (
        Intent::InfoLocation,
        &[
            r"\bwhere\b",
            r"\baddress\b",
            r"\blocat(ion|ed)\b",
            r"\bdirections\b",
            r"\bparking\b",
            r"\benderec[oa]\b",
            r"\bonde (fica|voces ficam|e)\b",
            r"\blocalizacao\b",
            r"\bcomo chegar\b",
            r"\bestacionamento\b",
        ],
    ),
    (
        Intent::InfoServices,
        &[
            r"\bservices?\b",
            r"\btreatments?\b",
            r"\bprocedures?\b",
            r"\bdo you (offer|do)\b",
            r"\b(price|cost)s?\b",
            r"\bhow much\b",
            r"\bservicos?\b",
            r"\btratamentos?\b",
            r"\bprocedimentos?\b",
            r"\bexames?\b",
            r"\bquanto custa\b",
            r"\b(valor|preco)\b",
            r"\bespecialidades?\b",
        ],
    ),
    (
        Intent::Greeting,
        &[
            r"^(hi|hello|hey)\b",
            r"\bgood (morning|afternoon|evening)\b",
            r"^(oi|ola|opa|e ai)\b",
            r"\bbo(m dia|a tarde|a noite)\b",
        ],
    ),
];

pub struct IntentClassifier {
    rules: Vec<IntentRule>,
    date_re: Option<Regex>,
    time_re: Option<Regex>,
    email_re: Option<Regex>,
    phone_re: Option<Regex>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentClassifier {
    pub fn new() -> Self {
        let rules = RULES
            .iter()
            .map(|(intent, patterns)| IntentRule {
                intent: *intent,
                patterns: patterns
                    .iter()
                    .filter_map(|pattern| Regex::new(pattern).ok())
                    .collect(),
            })
            .collect();
        Self {
            rules,
            date_re: Regex::new(r"\b(\d{1,2})[/.-](\d{1,2})(?:[/.-](\d{2,4}))?\b").ok(),
            time_re: Regex::new(r"\b([01]?\d|2[0-3])\s*(?::([0-5]\d)|h([0-5]\d)?\b)").ok(),
            email_re: Regex::new(r"[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}").ok(),
            phone_re: Regex::new(r"\+?\d[\d\s().-]{8,}\d").ok(),
        }
    }

    /// Pure function of the input text: the same text always yields the
    /// same classification.
    pub fn classify(&self, text: &str) -> Classification {
        let normalized = normalize(text);
        let entities = self.extract_entities(&normalized);
        if normalized.is_empty() {
            return Classification {
                intent: Intent::Unknown,
                entities,
                confidence: 0.0,
            };
        }

        let hits = self
            .rules
            .iter()
            .map(|rule| {
                let count = rule
                    .patterns
                    .iter()
                    .filter(|re| re.is_match(&normalized))
                    .count();
                (rule.intent, count)
            })
            .collect::<Vec<_>>();

        // A greeting followed by a real question is classified as the question.
        let best_other = hits
            .iter()
            .filter(|(intent, count)| *intent != Intent::Greeting && *count > 0)
            .fold(None::<(Intent, usize)>, |best, (intent, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((*intent, *count)),
            });

        if let Some((intent, count)) = best_other {
            let tied = hits
                .iter()
                .filter(|(other, c)| *other != intent && *other != Intent::Greeting && *c == count)
                .count();
            let mut confidence = 0.6 + 0.15 * (count.saturating_sub(1) as f32);
            if tied > 0 {
                confidence -= 0.1;
            }
            return Classification {
                intent,
                entities,
                confidence: confidence.clamp(0.0, 0.95),
            };
        }

        let greeting_hits = hits
            .iter()
            .find(|(intent, _)| *intent == Intent::Greeting)
            .map(|(_, count)| *count)
            .unwrap_or(0);
        if greeting_hits > 0 {
            let words = normalized.split_whitespace().count();
            return Classification {
                intent: Intent::Greeting,
                entities,
                confidence: if words <= 6 { 0.9 } else { 0.75 },
            };
        }

        // Scheduling details without a keyword still read as a booking attempt.
        if entities.contains_key("date") || entities.contains_key("time") {
            return Classification {
                intent: Intent::AppointmentCreate,
                entities,
                confidence: 0.45,
            };
        }

        Classification {
            intent: Intent::Unknown,
            entities,
            confidence: 0.2,
        }
    }

    fn extract_entities(&self, normalized: &str) -> BTreeMap<String, String> {
        let mut entities = BTreeMap::new();

        if let Some(email) = self.email_re.as_ref().and_then(|re| re.find(normalized)) {
            entities.insert("email".to_string(), email.as_str().to_string());
        }

        if let Some(phone) = self.phone_re.as_ref().and_then(|re| re.find(normalized)) {
            let digits = phone
                .as_str()
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>();
            if (10..=13).contains(&digits.len()) {
                entities.insert("phone".to_string(), digits);
            }
        }

        if !entities.contains_key("phone") {
            if let Some(caps) = self.date_re.as_ref().and_then(|re| re.captures(normalized)) {
                let day = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let month = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                let valid = day.parse::<u32>().is_ok_and(|d| (1..=31).contains(&d))
                    && month.parse::<u32>().is_ok_and(|m| (1..=12).contains(&m));
                if valid {
                    entities.insert("date".to_string(), format!("{day:0>2}/{month:0>2}"));
                }
            }
        }
        if !entities.contains_key("date") {
            let relative = if normalized.contains("depois de amanha")
                || normalized.contains("day after tomorrow")
            {
                Some("day_after_tomorrow")
            } else if normalized.contains("amanha") || normalized.contains("tomorrow") {
                Some("tomorrow")
            } else if normalized.contains("hoje") || normalized.contains("today") {
                Some("today")
            } else {
                None
            };
            if let Some(relative) = relative {
                entities.insert("date".to_string(), relative.to_string());
            }
        }

        if let Some(weekday) = weekday(normalized) {
            entities.insert("weekday".to_string(), weekday.to_string());
        }

        if let Some(caps) = self.time_re.as_ref().and_then(|re| re.captures(normalized)) {
            let hour = caps.get(1).map(|m| m.as_str()).unwrap_or("0");
            let minute = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or("00");
            entities.insert("time".to_string(), format!("{hour:0>2}:{minute}"));
        }

        entities
    }
}

fn weekday(normalized: &str) -> Option<&'static str> {
    const WEEKDAYS: &[(&str, &str)] = &[
        ("monday", "monday"),
        ("segunda", "monday"),
        ("tuesday", "tuesday"),
        ("terca", "tuesday"),
        ("wednesday", "wednesday"),
        ("quarta", "wednesday"),
        ("thursday", "thursday"),
        ("quinta", "thursday"),
        ("friday", "friday"),
        ("sexta", "friday"),
        ("saturday", "saturday"),
        ("sabado", "saturday"),
        ("sunday", "sunday"),
        ("domingo", "sunday"),
    ];
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .find_map(|word| {
            WEEKDAYS
                .iter()
                .find(|(needle, _)| word == *needle)
                .map(|(_, canonical)| *canonical)
        })
}

/// Lowercases, folds Portuguese diacritics and collapses whitespace.
pub fn normalize(text: &str) -> String {
    let folded = text
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect::<String>();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
