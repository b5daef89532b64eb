//! Crawl events.
//!
//! Structured hooks around fetching and page processing. The crawler always
//! registers [`LoggingHandler`] and [`MetricsHandler`]; embedders can add
//! their own through the builder.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::CrawlMetrics;

/// Where an error event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// One failed fetch attempt.
    Fetch,
    /// A page whose processing was abandoned.
    Page,
}

#[derive(Debug, Clone)]
pub enum CrawlEvent {
    CrawlStarted {
        max_pages: Option<u32>,
        timestamp: DateTime<Utc>,
    },
    PageRequested {
        url: Url,
        attempt: u32,
        user_agent: Option<String>,
    },
    PageFetched {
        url: Url,
        status: u16,
        latency: Duration,
    },
    Retry {
        url: Url,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    PageParsed {
        page: u32,
        found: usize,
        skipped: usize,
        duration: Duration,
    },
    RecordSkipped {
        page: u32,
        reason: String,
    },
    Deduplicated {
        page: u32,
        new: usize,
        duplicates: usize,
    },
    Error {
        scope: ErrorScope,
        url: Option<Url>,
        page: Option<u32>,
        message: String,
    },
    CrawlFinished {
        pages: u32,
        failed: bool,
    },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CrawlEvent);
}

/// Broadcasts events to registered handlers in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: CrawlEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Renders events through the `log` facade.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CrawlEvent) {
        match event {
            CrawlEvent::CrawlStarted { max_pages, .. } => match max_pages {
                Some(limit) => log::info!("crawl started (max {limit} pages)"),
                None => log::info!("crawl started (no page limit)"),
            },
            CrawlEvent::PageRequested {
                url,
                attempt,
                user_agent,
            } => {
                log::debug!(
                    "-> GET {url} (attempt {attempt}, ua {})",
                    user_agent.as_deref().unwrap_or("-")
                );
            }
            CrawlEvent::PageFetched {
                url,
                status,
                latency,
            } => {
                log::debug!("<- {url} -> {status} ({:.2}s)", latency.as_secs_f64());
            }
            CrawlEvent::Retry {
                url,
                attempt,
                delay,
                reason,
            } => {
                log::info!(
                    "retry {url} after attempt {attempt} in {:.2}s: {reason}",
                    delay.as_secs_f64()
                );
            }
            CrawlEvent::PageParsed {
                page,
                found,
                skipped,
                duration,
            } => {
                log::info!(
                    "page {page}: {found} listings, {skipped} skipped ({:.3}s)",
                    duration.as_secs_f64()
                );
            }
            CrawlEvent::RecordSkipped { page, reason } => {
                log::debug!("page {page}: record skipped ({reason})");
            }
            CrawlEvent::Deduplicated {
                page,
                new,
                duplicates,
            } => {
                log::info!("page {page}: {new} new, {duplicates} duplicates");
            }
            CrawlEvent::Error {
                scope,
                url,
                page,
                message,
            } => match (scope, page, url) {
                (ErrorScope::Page, Some(page), _) => log::error!("page {page} failed: {message}"),
                (_, _, Some(url)) => log::warn!("fetch {url} failed: {message}"),
                _ => log::warn!("{message}"),
            },
            CrawlEvent::CrawlFinished { pages, failed } => {
                if *failed {
                    log::warn!("crawl stopped after {pages} pages on error");
                } else {
                    log::info!("crawl finished after {pages} pages");
                }
            }
        }
    }
}

/// Feeds [`CrawlMetrics`] from the event stream.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: CrawlMetrics,
}

impl MetricsHandler {
    pub fn new(metrics: CrawlMetrics) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &CrawlEvent) {
        match event {
            CrawlEvent::CrawlStarted { timestamp, .. } => self.metrics.mark_started(*timestamp),
            CrawlEvent::PageFetched {
                status, latency, ..
            } => self.metrics.record_response(*status, *latency),
            CrawlEvent::PageParsed {
                found,
                skipped,
                duration,
                ..
            } => self.metrics.record_page(*found, *skipped, *duration),
            CrawlEvent::Deduplicated {
                new, duplicates, ..
            } => self.metrics.record_dedup(*new, *duplicates),
            CrawlEvent::Error { scope, .. } => match scope {
                ErrorScope::Fetch => self.metrics.record_fetch_error(),
                ErrorScope::Page => self.metrics.record_page_failure(),
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &CrawlEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(CrawlEvent::RecordSkipped {
            page: 1,
            reason: "missing title".into(),
        });
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_splits_error_scopes() {
        let metrics = CrawlMetrics::new();
        let handler = MetricsHandler::new(metrics.clone());
        handler.handle(&CrawlEvent::Error {
            scope: ErrorScope::Fetch,
            url: None,
            page: None,
            message: "timeout".into(),
        });
        handler.handle(&CrawlEvent::Error {
            scope: ErrorScope::Page,
            url: None,
            page: Some(2),
            message: "retries exhausted".into(),
        });
        handler.handle(&CrawlEvent::PageParsed {
            page: 1,
            found: 3,
            skipped: 1,
            duration: Duration::from_millis(5),
        });

        let stats = metrics.snapshot();
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(stats.pages_failed, 1);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.listings_found, 3);
    }
}
