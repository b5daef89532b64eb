//! Pagination walker.
//!
//! Drives page fetching, extraction and dedup as an explicit state machine and
//! exposes the result as a lazy stream of [`PageBatch`]es. Each transition is
//! awaited to completion before the next page is requested, so batches arrive
//! in page order and nothing runs once the consumer stops polling.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use futures::Stream;
use tokio::time::sleep;
use url::Url;

use crate::extraction::{FieldExtractor, PaginationCursor, ParsedPage, SelectorSet, parse_page};
use crate::external_deps::{ListingRepository, RepositoryError};
use crate::fetch::{FetchError, FetchExecutor};
use crate::listing::Listing;
use crate::modules::events::{CrawlEvent, ErrorScope, EventDispatcher};

/// Parameters of one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlRequest {
    /// Stop after this many pages; unbounded when `None` or `Some(0)`.
    pub max_pages: Option<u32>,
    pub category: Option<String>,
    /// Extra query parameters sent with every page request.
    pub filters: BTreeMap<String, String>,
}

impl CrawlRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0` lifts the limit.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = (max_pages > 0).then_some(max_pages);
        self
    }

    fn limit_reached(&self, page: u32) -> bool {
        self.max_pages.is_some_and(|limit| limit > 0 && page >= limit)
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Query parameters for `page`.
    pub fn params(&self, page: u32) -> Vec<(String, String)> {
        let mut params = vec![("page".to_string(), page.to_string())];
        if let Some(category) = &self.category {
            params.push(("category".to_string(), category.clone()));
        }
        params.extend(
            self.filters
                .iter()
                .filter(|(key, _)| key.as_str() != "page")
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        params
    }
}

/// Listings from one page that passed the dedup gate.
#[derive(Debug, Clone)]
pub struct PageBatch {
    pub page: u32,
    pub listings: Vec<Listing>,
    pub duplicates: usize,
    pub skipped: usize,
    pub cursor: PaginationCursor,
}

/// States of the walk. `Done` and `Failed` are terminal.
#[derive(Debug)]
pub enum WalkState {
    Fetching { page: u32 },
    Extracting { page: u32, body: String },
    Filtering { page: u32, parsed: ParsedPage },
    Yielded { page: u32, cursor: PaginationCursor },
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct PaginationWalker {
    executor: Arc<FetchExecutor>,
    selectors: Arc<SelectorSet>,
    extractor: FieldExtractor,
    listing_url: Url,
    page_delay: Duration,
    events: Arc<EventDispatcher>,
}

impl PaginationWalker {
    pub fn new(
        executor: Arc<FetchExecutor>,
        selectors: Arc<SelectorSet>,
        extractor: FieldExtractor,
        listing_url: Url,
        page_delay: Duration,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            executor,
            selectors,
            extractor,
            listing_url,
            page_delay,
            events,
        }
    }

    /// Walk result pages starting at page 1.
    ///
    /// An empty first page ends the walk without a batch; later empty pages
    /// are yielded. Failures end the stream after being logged and reported
    /// as events.
    pub fn walk<'a>(
        &'a self,
        request: CrawlRequest,
        repository: Option<&'a dyn ListingRepository>,
    ) -> impl Stream<Item = PageBatch> + Send + 'a {
        stream! {
            self.events.dispatch(CrawlEvent::CrawlStarted {
                max_pages: request.max_pages,
                timestamp: Utc::now(),
            });

            let mut pages_done = 0u32;
            let mut state = WalkState::Fetching { page: 1 };
            loop {
                state = match state {
                    WalkState::Fetching { page } => match self.fetch_page(page, &request).await {
                        Ok(body) => WalkState::Extracting { page, body },
                        Err(err) => self.fail(page, &err),
                    },
                    WalkState::Extracting { page, body } => {
                        let parsed = self.extract(page, &body);
                        if page == 1 && parsed.listings.is_empty() {
                            log::info!("first page has no listings, stopping");
                            WalkState::Done
                        } else {
                            WalkState::Filtering { page, parsed }
                        }
                    }
                    WalkState::Filtering { page, parsed } => {
                        let ParsedPage { listings, skipped, cursor, .. } = parsed;
                        match self.filter(page, listings, repository).await {
                            Ok((fresh, duplicates)) => {
                                pages_done += 1;
                                yield PageBatch {
                                    page,
                                    listings: fresh,
                                    duplicates,
                                    skipped: skipped.len(),
                                    cursor: cursor.clone(),
                                };
                                WalkState::Yielded { page, cursor }
                            }
                            Err(err) => self.fail(page, &err),
                        }
                    }
                    WalkState::Yielded { page, cursor } => {
                        if !cursor.has_next {
                            log::info!("page {page} is the last page");
                            WalkState::Done
                        } else if request.limit_reached(page) {
                            log::info!("page limit {page} reached");
                            WalkState::Done
                        } else {
                            if !self.page_delay.is_zero() {
                                sleep(self.page_delay).await;
                            }
                            WalkState::Fetching { page: page + 1 }
                        }
                    }
                    WalkState::Done => {
                        self.events.dispatch(CrawlEvent::CrawlFinished { pages: pages_done, failed: false });
                        break;
                    }
                    WalkState::Failed => {
                        self.events.dispatch(CrawlEvent::CrawlFinished { pages: pages_done, failed: true });
                        break;
                    }
                };
            }
        }
    }

    /// Fetch, extract and filter a single page.
    pub async fn page(
        &self,
        page: u32,
        request: &CrawlRequest,
        repository: Option<&dyn ListingRepository>,
    ) -> Result<PageBatch, PageError> {
        let body = self.fetch_page(page, request).await?;
        let ParsedPage {
            listings,
            skipped,
            cursor,
            ..
        } = self.extract(page, &body);
        let (fresh, duplicates) = self.filter(page, listings, repository).await?;
        Ok(PageBatch {
            page,
            listings: fresh,
            duplicates,
            skipped: skipped.len(),
            cursor,
        })
    }

    async fn fetch_page(&self, page: u32, request: &CrawlRequest) -> Result<String, FetchError> {
        let params = request.params(page);
        let fetched = self.executor.fetch(&self.listing_url, &params).await?;
        Ok(fetched.body)
    }

    fn extract(&self, page: u32, body: &str) -> ParsedPage {
        let parsed = parse_page(body, &self.selectors, &self.extractor);
        for reason in &parsed.skipped {
            self.events.dispatch(CrawlEvent::RecordSkipped {
                page,
                reason: reason.to_string(),
            });
        }
        self.events.dispatch(CrawlEvent::PageParsed {
            page,
            found: parsed.listings.len(),
            skipped: parsed.skipped.len(),
            duration: parsed.duration,
        });
        parsed
    }

    /// Drop in-page repeats, then listings the repository already knows.
    async fn filter(
        &self,
        page: u32,
        listings: Vec<Listing>,
        repository: Option<&dyn ListingRepository>,
    ) -> Result<(Vec<Listing>, usize), RepositoryError> {
        let total = listings.len();
        let mut seen = HashSet::new();
        let mut unique: Vec<Listing> = Vec::with_capacity(total);
        for listing in listings {
            let repeated = !seen.insert(listing.external_id.clone())
                || unique.iter().any(|kept| kept.is_duplicate_of(&listing));
            if !repeated {
                unique.push(listing);
            }
        }

        let fresh = match repository {
            Some(repository) => {
                let mut fresh = Vec::with_capacity(unique.len());
                for listing in unique {
                    if !repository.exists_project(&listing.external_id).await? {
                        fresh.push(listing);
                    }
                }
                fresh
            }
            None => unique,
        };

        let duplicates = total - fresh.len();
        self.events.dispatch(CrawlEvent::Deduplicated {
            page,
            new: fresh.len(),
            duplicates,
        });
        Ok((fresh, duplicates))
    }

    fn fail(&self, page: u32, err: &dyn std::error::Error) -> WalkState {
        self.events.dispatch(CrawlEvent::Error {
            scope: ErrorScope::Page,
            url: None,
            page: Some(page),
            message: err.to_string(),
        });
        WalkState::Failed
    }
}
