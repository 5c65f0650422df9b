//! Archive/mail, calendar, chat, and web adapters.
//!
//! Per spec.md §1 Non-goals, the IMAP/Graph/chat protocol clients
//! themselves are external collaborators — only their semantic contract is
//! consumed here, as a narrow injected trait per source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::search::adapter::{SearchHit, SearchOptions, SourceSearchAdapter};

/// A single record a mail/archive backend can return for a query.
#[derive(Debug, Clone)]
pub struct MailRecord {
    pub message_id: String,
    pub subject: String,
    pub snippet: String,
    pub sent_at: DateTime<Utc>,
}

/// The narrow contract an archive/mail backend must satisfy. Full-text
/// across subject, body, sender; unbounded date range (spec.md §4.5).
#[async_trait]
pub trait MailBackend: Send + Sync {
    async fn search(&self, query: &str, sender_filter: Option<&str>, max: usize) -> Vec<MailRecord>;
}

pub struct ArchiveMailAdapter<B: MailBackend> {
    backend: B,
}

impl<B: MailBackend> ArchiveMailAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: MailBackend> SourceSearchAdapter for ArchiveMailAdapter<B> {
    fn source_name(&self) -> &str {
        "mail"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &str,
        max: usize,
        opts: &SearchOptions,
        _cancel: CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let records = self
            .backend
            .search(query, opts.sender_filter.as_deref(), max)
            .await;
        let now = Utc::now();
        Ok(records
            .into_iter()
            .map(|r| SearchHit {
                source: "mail".to_string(),
                identifier: r.message_id,
                title: r.subject,
                snippet: r.snippet,
                adapter_relevance: 0.7,
                days_old: (now - r.sent_at).num_seconds() as f64 / 86_400.0,
            })
            .collect())
    }
}

/// A single calendar event within the adapter's searchable window
/// ([-365d, +90d] per spec.md §4.5).
#[derive(Debug, Clone)]
pub struct CalendarRecord {
    pub event_uid: String,
    pub title: String,
    pub description: String,
    pub starts_at: DateTime<Utc>,
}

#[async_trait]
pub trait CalendarBackend: Send + Sync {
    async fn search(&self, query: &str, max: usize) -> Vec<CalendarRecord>;
}

pub struct CalendarAdapter<B: CalendarBackend> {
    backend: B,
}

impl<B: CalendarBackend> CalendarAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: CalendarBackend> SourceSearchAdapter for CalendarAdapter<B> {
    fn source_name(&self) -> &str {
        "calendar"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &str,
        max: usize,
        _opts: &SearchOptions,
        _cancel: CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let now = Utc::now();
        let records = self.backend.search(query, max).await;
        Ok(records
            .into_iter()
            .filter(|r| {
                let delta = r.starts_at - now;
                delta.num_days() >= -365 && delta.num_days() <= 90
            })
            .map(|r| SearchHit {
                source: "calendar".to_string(),
                identifier: r.event_uid,
                title: r.title,
                snippet: r.description,
                adapter_relevance: 0.7,
                days_old: (now - r.starts_at).num_seconds().abs() as f64 / 86_400.0,
            })
            .collect())
    }
}

/// A single chat/channel message.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub message_id: String,
    pub chat_name: String,
    pub snippet: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn search(&self, query: &str, chat_name: Option<&str>, max: usize) -> Vec<ChatRecord>;
}

pub struct ChatAdapter<B: ChatBackend> {
    backend: B,
}

impl<B: ChatBackend> ChatAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: ChatBackend> SourceSearchAdapter for ChatAdapter<B> {
    fn source_name(&self) -> &str {
        "chat"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &str,
        max: usize,
        opts: &SearchOptions,
        _cancel: CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let now = Utc::now();
        let records = self.backend.search(query, opts.chat_name.as_deref(), max).await;
        Ok(records
            .into_iter()
            .map(|r| SearchHit {
                source: "chat".to_string(),
                identifier: r.message_id,
                title: r.chat_name,
                snippet: r.snippet,
                adapter_relevance: 0.6,
                days_old: (now - r.sent_at).num_seconds() as f64 / 86_400.0,
            })
            .collect())
    }
}

/// A single web search result.
#[derive(Debug, Clone)]
pub struct WebRecord {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
pub trait WebBackend: Send + Sync {
    async fn search(&self, query: &str, max: usize) -> Vec<WebRecord>;
}

/// Only queried when the caller explicitly opts in; results are never
/// persisted to disk (spec.md §4.5).
pub struct WebAdapter<B: WebBackend> {
    backend: B,
}

impl<B: WebBackend> WebAdapter<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: WebBackend> SourceSearchAdapter for WebAdapter<B> {
    fn source_name(&self) -> &str {
        "web"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &str,
        max: usize,
        opts: &SearchOptions,
        _cancel: CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if !opts.include_web {
            return Ok(Vec::new());
        }
        let records = self.backend.search(query, max).await;
        Ok(records
            .into_iter()
            .map(|r| SearchHit {
                source: "web".to_string(),
                identifier: r.url,
                title: r.title,
                snippet: r.snippet,
                adapter_relevance: 0.5,
                days_old: 0.0,
            })
            .collect())
    }
}
