//! Continuity detection (C2): cluster events into threads/conversations.

use std::collections::VecDeque;

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;

use crate::event::{Participant, PerceivedEvent};

/// Default capacity of the in-memory thread index.
pub const DEFAULT_INDEX_CAPACITY: usize = 4096;
/// Default number of prior events surfaced per thread.
pub const DEFAULT_RECENT_WINDOW: usize = 10;

fn normalized_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let stripped = ["re:", "fwd:", "tr:", "rv:"]
            .iter()
            .find(|p| lower.starts_with(**p))
            .map(|p| s[p.len()..].trim_start());
        match stripped {
            Some(next) => s = next,
            None => break,
        }
    }
    s.to_ascii_lowercase()
}

fn participant_fingerprint(participants: &[Participant]) -> String {
    let mut identities: Vec<&str> = participants.iter().map(|p| p.identity.as_str()).collect();
    identities.sort_unstable();
    identities.dedup();
    identities.join(",")
}

/// The key the continuity index clusters on: either the source's native
/// threading header, or a normalized-subject + participant-set fallback.
fn thread_hint(event: &PerceivedEvent, native_hint: Option<&str>) -> String {
    match native_hint {
        Some(hint) if !hint.is_empty() => format!("native:{hint}"),
        _ => {
            let subject = event.subject.as_deref().unwrap_or("");
            format!(
                "derived:{}:{}",
                normalized_subject(subject),
                participant_fingerprint(&event.participants)
            )
        }
    }
}

fn derive_thread_id(hint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hint.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A bounded in-memory index of recently observed events, keyed by thread
/// hint. Backed by an LRU cache (the teacher's chosen bounding strategy for
/// in-memory indices elsewhere in the crate) so long-idle threads eventually
/// fall out without unbounded growth.
pub struct ContinuityDetector {
    index: LruCache<String, VecDeque<PerceivedEvent>>,
    recent_window: usize,
}

impl ContinuityDetector {
    pub fn new(capacity: usize, recent_window: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1))
            .unwrap_or(NonZeroUsize::new(DEFAULT_INDEX_CAPACITY).unwrap());
        Self {
            index: LruCache::new(capacity),
            recent_window: recent_window.max(1),
        }
    }

    /// Assign a deterministic `thread_id` to `event` and record it in the
    /// index. `native_hint` is the source's own threading header, if any.
    pub fn assign(&mut self, mut event: PerceivedEvent, native_hint: Option<&str>) -> PerceivedEvent {
        let hint = thread_hint(&event, native_hint);
        let thread_id = derive_thread_id(&hint);
        event.thread_id = Some(thread_id.clone());

        let bucket = self.index.get_or_insert_mut(thread_id, VecDeque::new);
        bucket.push_front(event.clone());
        if bucket.len() > self.recent_window {
            bucket.pop_back();
        }

        event
    }

    /// Up to `n` most recent prior events already observed in `thread_id`,
    /// newest first. Does not include the event passed to `assign`.
    pub fn recent_in_thread(&mut self, thread_id: &str, n: usize) -> Vec<PerceivedEvent> {
        self.index
            .get(thread_id)
            .map(|bucket| bucket.iter().take(n).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Attachment as Attach, EventSource, ParticipantRole};
    use chrono::Utc;

    fn event(subject: &str, from: &str) -> PerceivedEvent {
        PerceivedEvent {
            event_id: format!("evt-{subject}-{from}"),
            source: EventSource::Email,
            kind: "email".to_string(),
            occurred_at: Utc::now(),
            ingested_at: Utc::now(),
            thread_id: None,
            participants: vec![Participant {
                identity: from.to_string(),
                role: ParticipantRole::From,
            }],
            subject: Some(subject.to_string()),
            body_plain: "body".to_string(),
            body_rich: None,
            attachments: Vec::<Attach>::new(),
            entities: vec![],
            importance_prior: 0.5,
            age_bucket: crate::event::AgeBucket::Fresh,
        }
    }

    #[test]
    fn reply_prefix_groups_with_original() {
        let mut detector = ContinuityDetector::new(16, 5);
        let original = detector.assign(event("Budget Q1", "marie@example.com"), None);
        let reply = detector.assign(event("Re: Budget Q1", "marie@example.com"), None);
        assert_eq!(original.thread_id, reply.thread_id);
    }

    #[test]
    fn native_hint_takes_priority() {
        let mut detector = ContinuityDetector::new(16, 5);
        let a = detector.assign(event("Unrelated subject A", "x@example.com"), Some("hdr-1"));
        let b = detector.assign(event("Totally different B", "y@example.com"), Some("hdr-1"));
        assert_eq!(a.thread_id, b.thread_id);
    }

    #[test]
    fn recent_in_thread_respects_window() {
        let mut detector = ContinuityDetector::new(16, 2);
        let e1 = detector.assign(event("Budget Q1", "marie@example.com"), None);
        detector.assign(event("Re: Budget Q1", "marie@example.com"), None);
        detector.assign(event("Re: Budget Q1", "marie@example.com"), None);
        let thread_id = e1.thread_id.unwrap();
        let recent = detector.recent_in_thread(&thread_id, 10);
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn different_threads_get_different_ids() {
        let mut detector = ContinuityDetector::new(16, 5);
        let a = detector.assign(event("Budget Q1", "marie@example.com"), None);
        let b = detector.assign(event("Lunch plans", "bob@example.com"), None);
        assert_ne!(a.thread_id, b.thread_id);
    }
}
