//! Cross-source search (C4/C5): fan out a query across adapters, score and
//! merge the results, and cache by query.

pub mod adapter;
pub mod adapters;
pub mod cache;
pub mod fanout;

pub use adapter::{SearchHit, SearchOptions, SourceSearchAdapter};
pub use adapters::{
    ArchiveMailAdapter, CalendarAdapter, CalendarBackend, ChatAdapter, ChatBackend, LocalFileAdapter,
    MailBackend, WebAdapter, WebBackend,
};
pub use cache::{SearchCache, SearchCacheKey};
pub use fanout::{CrossSourceSearch, SearchRequest, SearchResults};
