//! # listing-crawler
//!
//! An async crawler for paginated listing marketplaces.
//!
//! Pages are fetched one at a time through a concurrency-bounded executor
//! that paces requests per host, retries transient failures with jittered
//! backoff and rotates coherent browser identities. Listing cards are
//! extracted with ordered fallback selectors, so a single malformed card is
//! skipped instead of failing the page, and already known listings are
//! filtered out through a repository collaborator.
//!
//! ## Features
//!
//! - Lazy `Stream` of deduplicated page batches
//! - Second/minute/hour rate windows with adaptive backoff and 429 blocking
//! - Retry orchestration with exponential backoff and jitter
//! - Weighted User-Agent rotation with matching client hint headers
//! - Selector overrides and validated JSON settings
//! - Crawl statistics and pluggable event handlers
//!
//! ## Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use listing_crawler::{CrawlRequest, Crawler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let crawler = Crawler::builder().with_max_pages(3).build()?;
//!     let batches = crawler.crawl(CrawlRequest::new().with_max_pages(3));
//!     futures::pin_mut!(batches);
//!     while let Some(batch) = batches.next().await {
//!         for listing in &batch.listings {
//!             println!("{} {}", listing.external_id, listing.title);
//!         }
//!     }
//!     println!("{:?}", crawler.stats().crawl);
//!     Ok(())
//! }
//! ```

mod crawler;

pub mod config;
pub mod external_deps;
pub mod extraction;
pub mod fetch;
pub mod listing;
pub mod modules;
pub mod walker;

pub use crate::crawler::{
    Crawler,
    CrawlerBuilder,
    CrawlerError,
    CrawlerResult,
    CrawlerStats,
    CycleReport,
};

pub use crate::config::{ConfigError, CrawlerSettings, ParserSettings};

pub use crate::extraction::{
    FieldExtractor,
    FieldKey,
    PaginationCursor,
    ParsedPage,
    SelectorError,
    SelectorResolver,
    SelectorSet,
    SkipReason,
    parse_page,
    parse_price,
};

pub use crate::external_deps::{
    InMemoryRepository,
    ListingRepository,
    LogNotifier,
    Notifier,
    NotifierError,
    RecordId,
    RepositoryError,
};

pub use crate::fetch::{
    FetchError,
    FetchExecutor,
    FetchedPage,
    HttpTransport,
    ReqwestTransport,
    TransportError,
    TransportResponse,
    TransportTimeouts,
};

pub use crate::listing::{Listing, ListingStatus, PriceType};

pub use crate::modules::{
    CrawlEvent,
    CrawlMetrics,
    CrawlStats,
    ErrorScope,
    EventDispatcher,
    EventHandler,
    IdentityConfig,
    IdentityRotator,
    IdentitySnapshot,
    LoggingHandler,
    MetricsHandler,
    RateGovernor,
    RateGovernorRegistry,
    RateGovernorSnapshot,
    RateLimitConfig,
    RetryAttempt,
    RetryConfig,
    RetryOrchestrator,
    Retryable,
};

pub use crate::walker::{CrawlRequest, PageBatch, PageError, PaginationWalker, WalkState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
