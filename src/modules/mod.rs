//! Cross-cutting services module
//!
//! Pacing, retries, browser identity, metrics and events shared by every
//! request of a crawl.

pub mod events;
pub mod identity;
pub mod metrics;
pub mod rate_governor;
pub mod retry;

use std::time::Duration;

/// Ceiling for every configured or derived delay.
pub const MAX_DELAY: Duration = Duration::from_secs(86_400);

/// Seconds to a [`Duration`] clamped to `0..=MAX_DELAY`; never panics.
pub(crate) fn delay_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

// Re-export commonly used types
pub use events::{CrawlEvent, ErrorScope, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
pub use identity::{
    BrowserFamily,
    Fingerprint,
    IdentityConfig,
    IdentityRotator,
    IdentitySnapshot,
    OsFamily,
};
pub use metrics::{CrawlMetrics, CrawlStats};
pub use rate_governor::{RateGovernor, RateGovernorRegistry, RateGovernorSnapshot, RateLimitConfig};
pub use retry::{
    RETRYABLE_STATUS_CODES,
    RetryAttempt,
    RetryConfig,
    RetryOrchestrator,
    Retryable,
    is_retryable_status,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_conversion_clamps_instead_of_panicking() {
        assert_eq!(delay_from_secs(1.5), Duration::from_millis(1500));
        assert_eq!(delay_from_secs(-3.0), Duration::ZERO);
        assert_eq!(delay_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(delay_from_secs(1e30), MAX_DELAY);
        assert_eq!(delay_from_secs(f64::INFINITY), MAX_DELAY);
    }
}
