//! Crawl metrics.
//!
//! Counters for pages, listings and errors plus fetch latency percentiles,
//! shared between the event handlers and `Crawler::stats`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_LATENCY_WINDOW: usize = 128;

/// Point-in-time crawl counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrawlStats {
    pub started_at: Option<DateTime<Utc>>,
    pub requests: u64,
    pub pages_parsed: u64,
    pub pages_failed: u64,
    pub listings_found: u64,
    pub listings_new: u64,
    pub duplicates: u64,
    pub records_skipped: u64,
    pub fetch_errors: u64,
    /// Failed fetch attempts plus pages that could not be processed.
    pub errors: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_page_duration: Option<Duration>,
    pub last_status: Option<u16>,
}

#[derive(Debug)]
struct MetricsState {
    stats: CrawlStats,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            stats: CrawlStats::default(),
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn push_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

/// Thread-safe metrics store; clones share the same counters.
#[derive(Clone, Debug)]
pub struct CrawlMetrics {
    inner: Arc<Mutex<MetricsState>>,
}

impl CrawlMetrics {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_LATENCY_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_started(&self, at: DateTime<Utc>) {
        self.state().stats.started_at.get_or_insert(at);
    }

    pub fn record_response(&self, status: u16, latency: Duration) {
        let mut guard = self.state();
        guard.stats.requests += 1;
        guard.stats.last_status = Some(status);
        guard.push_latency(latency);
    }

    pub fn record_fetch_error(&self) {
        let mut guard = self.state();
        guard.stats.fetch_errors += 1;
        guard.stats.errors += 1;
    }

    pub fn record_page(&self, found: usize, skipped: usize, duration: Duration) {
        let mut guard = self.state();
        guard.stats.pages_parsed += 1;
        guard.stats.listings_found += found as u64;
        guard.stats.records_skipped += skipped as u64;
        guard.stats.last_page_duration = Some(duration);
    }

    pub fn record_dedup(&self, new: usize, duplicates: usize) {
        let mut guard = self.state();
        guard.stats.listings_new += new as u64;
        guard.stats.duplicates += duplicates as u64;
    }

    pub fn record_page_failure(&self) {
        let mut guard = self.state();
        guard.stats.pages_failed += 1;
        guard.stats.errors += 1;
    }

    pub fn snapshot(&self) -> CrawlStats {
        let guard = self.state();
        let (average_latency, p95_latency) = guard.latency_stats();
        CrawlStats {
            average_latency,
            p95_latency,
            ..guard.stats.clone()
        }
    }

    pub fn reset(&self) {
        let mut guard = self.state();
        let window = guard.max_window;
        *guard = MetricsState::new(window);
    }
}

impl Default for CrawlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_page_and_error_counters() {
        let metrics = CrawlMetrics::new();
        metrics.record_page(20, 2, Duration::from_millis(40));
        metrics.record_dedup(15, 5);
        metrics.record_fetch_error();
        metrics.record_page_failure();

        let stats = metrics.snapshot();
        assert_eq!(stats.pages_parsed, 1);
        assert_eq!(stats.listings_found, 20);
        assert_eq!(stats.records_skipped, 2);
        assert_eq!(stats.listings_new, 15);
        assert_eq!(stats.duplicates, 5);
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(stats.pages_failed, 1);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.last_page_duration, Some(Duration::from_millis(40)));
    }

    #[test]
    fn latency_percentiles() {
        let metrics = CrawlMetrics::new();
        for ms in 1..=20 {
            metrics.record_response(200, Duration::from_millis(ms * 10));
        }
        let stats = metrics.snapshot();
        assert_eq!(stats.requests, 20);
        assert_eq!(stats.p95_latency, Some(Duration::from_millis(190)));
        let average = stats.average_latency.unwrap().as_secs_f64();
        assert!((average - 0.105).abs() < 1e-6);
    }

    #[test]
    fn start_time_is_recorded_once() {
        let metrics = CrawlMetrics::new();
        let first = Utc::now();
        metrics.mark_started(first);
        metrics.mark_started(first + chrono::Duration::seconds(5));
        assert_eq!(metrics.snapshot().started_at, Some(first));
    }
}
