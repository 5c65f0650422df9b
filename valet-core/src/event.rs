//! Event normalization (C1): heterogeneous source records → canonical
//! [`PerceivedEvent`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Where a perceived event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Email,
    Teams,
    Calendar,
    Linkedin,
    Whatsapp,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Email => "email",
            Self::Teams => "teams",
            Self::Calendar => "calendar",
            Self::Linkedin => "linkedin",
            Self::Whatsapp => "whatsapp",
        };
        write!(f, "{s}")
    }
}

/// A source-native record, not yet normalized, carrying its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: EventSource,
    /// Identifier stable within the source (e.g. message-id, event uid).
    pub canonical_source_id: String,
    pub occurred_at: DateTime<Utc>,
    pub subject: Option<String>,
    /// MIME or rich body, not yet decoded to plaintext.
    pub raw_body: String,
    pub participants: Vec<Participant>,
    pub attachments: Vec<Attachment>,
    pub thread_hint: Option<String>,
}

/// Capability an adapter offers: fetch records newer than `cursor`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> EventSource;

    /// Fetch records observed since `cursor` (an opaque, source-defined
    /// position). Returns `Error::SourceUnavailable` on transient outage;
    /// callers retry with backoff per spec.md §7.
    async fn fetch_since(&self, cursor: Option<&str>) -> Result<Vec<RawRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    From,
    To,
    Cc,
    Mention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub identity: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size_bytes: u64,
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Org,
    Project,
    Date,
    Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub entity_type: EntityType,
    pub value: String,
    /// Byte offset into `body_plain` where the mention starts, if known.
    pub span_start: Option<usize>,
}

/// Derived recency bucket, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBucket {
    Fresh,
    Recent,
    Old,
}

impl AgeBucket {
    pub fn from_age(occurred_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let age = now.signed_duration_since(occurred_at);
        if age < Duration::days(7) {
            Self::Fresh
        } else if age < Duration::days(30) {
            Self::Recent
        } else {
            Self::Old
        }
    }
}

/// The canonical unit consumed by every downstream component. Immutable
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceivedEvent {
    pub event_id: String,
    pub source: EventSource,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub thread_id: Option<String>,
    pub participants: Vec<Participant>,
    pub subject: Option<String>,
    pub body_plain: String,
    pub body_rich: Option<String>,
    pub attachments: Vec<Attachment>,
    pub entities: Vec<EntityMention>,
    pub importance_prior: f64,
    pub age_bucket: AgeBucket,
}

impl PerceivedEvent {
    /// `event_id` is a stable hash of `(source, canonical_source_id)`,
    /// deterministic across re-fetches — the same hashing idiom used for
    /// cache keys elsewhere in the crate.
    pub fn derive_event_id(source: EventSource, canonical_source_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(canonical_source_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// VIP senders receive an importance bonus; urgency keywords add weight;
/// being directly addressed (`to`) outweighs a `cc`/`mention`.
#[derive(Debug, Clone, Default)]
pub struct ImportanceRubric {
    pub vip_identities: BTreeSet<String>,
    pub urgency_keywords: Vec<String>,
}

impl ImportanceRubric {
    pub fn score(
        &self,
        participants: &[Participant],
        subject: &str,
        body: &str,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        let mut score: f64 = 0.3;

        if participants
            .iter()
            .any(|p| self.vip_identities.contains(&p.identity))
        {
            score += 0.3;
        }

        let haystack = format!("{subject} {body}").to_ascii_lowercase();
        if self
            .urgency_keywords
            .iter()
            .any(|kw| haystack.contains(&kw.to_ascii_lowercase()))
        {
            score += 0.2;
        }

        let mention_weight: f64 = participants
            .iter()
            .map(|p| match p.role {
                ParticipantRole::To => 0.1,
                ParticipantRole::From => 0.0,
                ParticipantRole::Cc => 0.03,
                ParticipantRole::Mention => 0.05,
            })
            .fold(0.0, f64::max);
        score += mention_weight;

        match AgeBucket::from_age(occurred_at, now) {
            AgeBucket::Fresh => score += 0.1,
            AgeBucket::Recent => {}
            AgeBucket::Old => score -= 0.1,
        }

        score.clamp(0.0, 1.0)
    }
}

/// Regex + dictionary entity extraction (grounded on the teacher's
/// regex-based query classification idiom).
pub struct EntityExtractor {
    date_re: regex::Regex,
    amount_re: regex::Regex,
    project_lexicon: BTreeSet<String>,
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new(BTreeSet::new())
    }
}

impl EntityExtractor {
    pub fn new(project_lexicon: BTreeSet<String>) -> Self {
        Self {
            date_re: regex::Regex::new(
                r"(?i)\b(\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|(?:lundi|mardi|mercredi|jeudi|vendredi|samedi|dimanche|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b)",
            )
            .expect("static date regex is valid"),
            amount_re: regex::Regex::new(r"(?i)\b\d+[.,]?\d*\s?(?:€|eur|usd|\$)\b")
                .expect("static amount regex is valid"),
            project_lexicon,
        }
    }

    pub fn extract(&self, body: &str) -> Vec<EntityMention> {
        let mut entities = Vec::new();

        for m in self.date_re.find_iter(body) {
            entities.push(EntityMention {
                entity_type: EntityType::Date,
                value: m.as_str().to_string(),
                span_start: Some(m.start()),
            });
        }
        for m in self.amount_re.find_iter(body) {
            entities.push(EntityMention {
                entity_type: EntityType::Amount,
                value: m.as_str().to_string(),
                span_start: Some(m.start()),
            });
        }

        let lower = body.to_ascii_lowercase();
        for project in &self.project_lexicon {
            if let Some(pos) = lower.find(&project.to_ascii_lowercase()) {
                entities.push(EntityMention {
                    entity_type: EntityType::Project,
                    value: project.clone(),
                    span_start: Some(pos),
                });
            }
        }

        entities
    }
}

/// Looks up known people by identity so mentions can be typed `Person`.
pub trait AddressBook: Send + Sync {
    fn lookup(&self, identity: &str) -> Option<String>;
}

/// Normalizes a [`RawRecord`] into a [`PerceivedEvent`]. Idempotent: the
/// same raw record always produces a byte-identical event (no `now()` calls
/// other than `ingested_at`, which callers may pin for golden tests).
pub fn normalize(
    record: &RawRecord,
    rubric: &ImportanceRubric,
    extractor: &EntityExtractor,
    address_book: &dyn AddressBook,
    ingested_at: DateTime<Utc>,
) -> Result<PerceivedEvent> {
    if record.canonical_source_id.trim().is_empty() {
        return Err(Error::malformed_record(
            record.source.to_string(),
            "empty canonical_source_id",
        ));
    }

    let body_plain = decode_to_plaintext(&record.raw_body)
        .map_err(|reason| Error::malformed_record(record.source.to_string(), reason))?;

    let mut entities = extractor.extract(&body_plain);
    for mention in &mut entities {
        if mention.entity_type == EntityType::Person {
            if let Some(canonical) = address_book.lookup(&mention.value) {
                mention.value = canonical;
            }
        }
    }
    for participant in &record.participants {
        if address_book.lookup(&participant.identity).is_some() {
            entities.push(EntityMention {
                entity_type: EntityType::Person,
                value: participant.identity.clone(),
                span_start: None,
            });
        }
    }

    let subject = record.subject.clone().unwrap_or_default();
    let importance_prior = rubric.score(
        &record.participants,
        &subject,
        &body_plain,
        record.occurred_at,
        ingested_at,
    );

    Ok(PerceivedEvent {
        event_id: PerceivedEvent::derive_event_id(record.source, &record.canonical_source_id),
        source: record.source,
        kind: record.source.to_string(),
        occurred_at: record.occurred_at,
        ingested_at,
        thread_id: None,
        participants: record.participants.clone(),
        subject: record.subject.clone(),
        body_plain,
        body_rich: None,
        attachments: record.attachments.clone(),
        entities,
        importance_prior,
        age_bucket: AgeBucket::from_age(record.occurred_at, ingested_at),
    })
}

/// Strips the crude markup a source might embed (HTML tags, quoted-printable
/// artifacts) down to plaintext. Full MIME decoding is an adapter
/// responsibility; this handles what can still leak through.
fn decode_to_plaintext(raw: &str) -> std::result::Result<String, String> {
    if raw.is_empty() {
        return Err("empty body".to_string());
    }
    let without_tags = strip_html_tags(raw);
    Ok(without_tags.trim().to_string())
}

fn strip_html_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOneKnown;
    impl AddressBook for NoOneKnown {
        fn lookup(&self, _identity: &str) -> Option<String> {
            None
        }
    }

    fn sample_record() -> RawRecord {
        RawRecord {
            source: EventSource::Email,
            canonical_source_id: "msg-123".to_string(),
            occurred_at: Utc::now(),
            subject: Some("Budget Q1 — reunion jeudi 10h".to_string()),
            raw_body: "<p>Please confirm 150.00€ for the budget</p>".to_string(),
            participants: vec![Participant {
                identity: "marie@example.com".to_string(),
                role: ParticipantRole::From,
            }],
            attachments: vec![],
            thread_hint: None,
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let record = sample_record();
        let rubric = ImportanceRubric::default();
        let extractor = EntityExtractor::default();
        let book = NoOneKnown;
        let now = Utc::now();

        let first = normalize(&record, &rubric, &extractor, &book, now).unwrap();
        let second = normalize(&record, &rubric, &extractor, &book, now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn event_id_is_stable_across_fetches() {
        let id1 = PerceivedEvent::derive_event_id(EventSource::Email, "msg-123");
        let id2 = PerceivedEvent::derive_event_id(EventSource::Email, "msg-123");
        assert_eq!(id1, id2);
        let id3 = PerceivedEvent::derive_event_id(EventSource::Email, "msg-124");
        assert_ne!(id1, id3);
    }

    #[test]
    fn rejects_empty_source_id() {
        let mut record = sample_record();
        record.canonical_source_id = String::new();
        let err = normalize(
            &record,
            &ImportanceRubric::default(),
            &EntityExtractor::default(),
            &NoOneKnown,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { .. }));
    }

    #[test]
    fn extracts_amount_and_date_entities() {
        let record = sample_record();
        let event = normalize(
            &record,
            &ImportanceRubric::default(),
            &EntityExtractor::default(),
            &NoOneKnown,
            Utc::now(),
        )
        .unwrap();
        assert!(event
            .entities
            .iter()
            .any(|e| e.entity_type == EntityType::Amount));
    }

    #[test]
    fn age_bucket_thresholds() {
        let now = Utc::now();
        assert_eq!(AgeBucket::from_age(now, now), AgeBucket::Fresh);
        assert_eq!(
            AgeBucket::from_age(now - Duration::days(10), now),
            AgeBucket::Recent
        );
        assert_eq!(
            AgeBucket::from_age(now - Duration::days(31), now),
            AgeBucket::Old
        );
    }
}
