//! Crawler settings.
//!
//! One serde-deserializable tree with defaults for every field:
//! - `parser`: target site, page limits, concurrency and timeouts
//! - `rate_limit`, `retry`, `identity`: service configs re-exported from
//!   their modules
//! - `selectors`: per-field candidate overrides
//!
//! Durations are expressed in seconds. `validate` rejects settings that would
//! only fail later at runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use http::HeaderValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::extraction::{FieldKey, SelectorError, SelectorSet};
use crate::fetch::TransportTimeouts;
use crate::modules::{MAX_DELAY, delay_from_secs};
pub use crate::modules::identity::IdentityConfig;
pub use crate::modules::rate_governor::RateLimitConfig;
pub use crate::modules::retry::RetryConfig;

pub const MAX_PAGES_LIMIT: u32 = 500;
pub const MAX_CONCURRENT_LIMIT: usize = 20;
/// Upper bound for backoff factors and retry multipliers.
pub const MAX_GROWTH_FACTOR: f64 = 10.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("invalid url `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSettings {
    pub base_url: String,
    pub listing_path: String,
    /// Card attribute carrying the listing id.
    pub id_attribute: String,
    pub currency: String,
    pub max_pages: u32,
    pub concurrent_requests: usize,
    pub page_delay: f64,
    pub request_timeout: f64,
    pub connect_timeout: f64,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            base_url: "https://kwork.ru".into(),
            listing_path: "/projects".into(),
            id_attribute: crate::extraction::fields::DEFAULT_ID_ATTRIBUTE.into(),
            currency: "RUB".into(),
            max_pages: 50,
            concurrent_requests: 5,
            page_delay: 1.0,
            request_timeout: 30.0,
            connect_timeout: 10.0,
        }
    }
}

impl ParserSettings {
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|source| ConfigError::Url {
            url: self.base_url.clone(),
            source,
        })
    }

    /// Absolute URL of the first listing page.
    pub fn listing_url(&self) -> Result<Url, ConfigError> {
        self.base_url()?
            .join(&self.listing_path)
            .map_err(|source| ConfigError::Url {
                url: self.listing_path.clone(),
                source,
            })
    }

    pub fn page_delay(&self) -> Duration {
        delay_from_secs(self.page_delay)
    }

    pub fn timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            request: delay_from_secs(self.request_timeout),
            connect: delay_from_secs(self.connect_timeout),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSettings {
    pub parser: ParserSettings,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub identity: IdentityConfig,
    pub selectors: BTreeMap<FieldKey, Vec<String>>,
}

impl CrawlerSettings {
    /// Parse settings from JSON; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn selector_set(&self) -> Result<SelectorSet, ConfigError> {
        Ok(SelectorSet::with_overrides(&self.selectors)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let parser = &self.parser;
        let base = parser.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("parser.base_url", "scheme must be http or https"));
        }
        parser.listing_url()?;
        if !(1..=MAX_PAGES_LIMIT).contains(&parser.max_pages) {
            return Err(invalid(
                "parser.max_pages",
                format!("must be within 1..={MAX_PAGES_LIMIT}"),
            ));
        }
        if !(1..=MAX_CONCURRENT_LIMIT).contains(&parser.concurrent_requests) {
            return Err(invalid(
                "parser.concurrent_requests",
                format!("must be within 1..={MAX_CONCURRENT_LIMIT}"),
            ));
        }
        delay("parser.page_delay", parser.page_delay)?;
        positive("parser.request_timeout", parser.request_timeout)?;
        delay("parser.request_timeout", parser.request_timeout)?;
        positive("parser.connect_timeout", parser.connect_timeout)?;
        delay("parser.connect_timeout", parser.connect_timeout)?;
        if parser.id_attribute.trim().is_empty() {
            return Err(invalid("parser.id_attribute", "must not be empty"));
        }

        let rate = &self.rate_limit;
        positive("rate_limit.requests_per_second", rate.requests_per_second)?;
        positive("rate_limit.requests_per_minute", rate.requests_per_minute)?;
        positive("rate_limit.requests_per_hour", rate.requests_per_hour)?;
        delay("rate_limit.min_delay", rate.min_delay)?;
        delay("rate_limit.max_delay", rate.max_delay)?;
        delay("rate_limit.recovery_time", rate.recovery_time)?;
        if rate.min_delay > rate.max_delay {
            return Err(invalid("rate_limit.min_delay", "must not exceed max_delay"));
        }
        growth("rate_limit.backoff_factor", rate.backoff_factor, 1.0)?;

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        delay("retry.base_delay", retry.base_delay)?;
        delay("retry.max_delay", retry.max_delay)?;
        positive("retry.multiplier", retry.multiplier)?;
        growth("retry.multiplier", retry.multiplier, 0.0)?;
        growth("retry.exponential_base", retry.exponential_base, 1.0)?;

        let identity = &self.identity;
        if identity.rotation_interval == 0 {
            return Err(invalid("identity.rotation_interval", "must be at least 1"));
        }
        if HeaderValue::from_str(&identity.accept_language).is_err() {
            return Err(invalid("identity.accept_language", "not a valid header value"));
        }

        self.selector_set()?;
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, "must be a positive number"))
    }
}

/// Seconds within `0..=MAX_DELAY`.
fn delay(field: &'static str, value: f64) -> Result<(), ConfigError> {
    let max = MAX_DELAY.as_secs_f64();
    if (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be within 0..={max} seconds")))
    }
}

fn growth(field: &'static str, value: f64, min: f64) -> Result<(), ConfigError> {
    if (min..=MAX_GROWTH_FACTOR).contains(&value) {
        Ok(())
    } else {
        Err(invalid(
            field,
            format!("must be within {min}..={MAX_GROWTH_FACTOR}"),
        ))
    }
}
