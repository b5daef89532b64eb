//! Governed, retried page fetching.
//!
//! Every fetch holds one permit of the global concurrency semaphore for its
//! whole lifetime, retries included. Each attempt first passes the target
//! host's rate governor, so blocks armed by a 429 also apply to retries, and
//! reports its outcome back to the governor.

use std::sync::Arc;

use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use url::Url;

use super::transport::{HttpTransport, TransportError};
use crate::modules::events::{CrawlEvent, ErrorScope, EventDispatcher};
use crate::modules::identity::IdentityRotator;
use crate::modules::rate_governor::{RateGovernor, RateGovernorRegistry};
use crate::modules::retry::{RetryOrchestrator, Retryable, is_retryable_status};

const FALLBACK_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure for {url}: {source}")]
    Transport {
        url: Url,
        #[source]
        source: TransportError,
    },
    #[error("{url} answered with HTTP {status}")]
    Status { url: Url, status: u16 },
    #[error("response body from {url} is not valid UTF-8")]
    Decode { url: Url },
    #[error("fetch executor is closed")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => source.is_transient(),
            FetchError::Status { status, .. } => is_retryable_status(*status),
            FetchError::Decode { .. } | FetchError::Closed => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub body: String,
}

pub struct FetchExecutor {
    transport: Arc<dyn HttpTransport>,
    permits: Arc<Semaphore>,
    governors: RateGovernorRegistry,
    identity: Arc<IdentityRotator>,
    retry: RetryOrchestrator,
    referer: Option<HeaderValue>,
    accept_language: Option<HeaderValue>,
    events: Arc<EventDispatcher>,
}

impl FetchExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        max_concurrent: usize,
        governors: RateGovernorRegistry,
        identity: Arc<IdentityRotator>,
        retry: RetryOrchestrator,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            governors,
            identity,
            retry,
            referer: None,
            accept_language: None,
            events,
        }
    }

    pub fn with_referer(mut self, referer: &str) -> Self {
        self.referer = HeaderValue::from_str(referer).ok();
        self
    }

    pub fn with_accept_language(mut self, accept_language: &str) -> Self {
        self.accept_language = HeaderValue::from_str(accept_language).ok();
        self
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Fetch `url` with `params` appended to its query string.
    pub async fn fetch(&self, url: &Url, params: &[(String, String)]) -> Result<FetchedPage, FetchError> {
        let mut target = url.clone();
        if !params.is_empty() {
            target.query_pairs_mut().extend_pairs(params);
        }

        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        let governor = self.governors.governor(target.host_str().unwrap_or_default());

        self.retry
            .run_with(
                |attempt| self.attempt(&governor, &target, attempt),
                |retry| {
                    self.events.dispatch(CrawlEvent::Retry {
                        url: target.clone(),
                        attempt: retry.number,
                        delay: retry.delay,
                        reason: retry.error.to_string(),
                    })
                },
            )
            .await
    }

    async fn attempt(
        &self,
        governor: &RateGovernor,
        url: &Url,
        attempt: u32,
    ) -> Result<FetchedPage, FetchError> {
        governor.acquire().await;

        let headers = self.request_headers();
        self.events.dispatch(CrawlEvent::PageRequested {
            url: url.clone(),
            attempt,
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(String::from),
        });

        let started = Instant::now();
        let response = match self.transport.get(url, &headers).await {
            Ok(response) => response,
            Err(source) => {
                governor.report_error(None);
                let err = FetchError::Transport {
                    url: url.clone(),
                    source,
                };
                self.dispatch_failure(url, &err);
                return Err(err);
            }
        };

        self.events.dispatch(CrawlEvent::PageFetched {
            url: url.clone(),
            status: response.status,
            latency: started.elapsed(),
        });

        if response.status >= 400 {
            if response.status == 429 {
                log::warn!("{} rate limited the crawler (HTTP 429)", governor.host());
            }
            governor.report_error(Some(response.status));
            let err = FetchError::Status {
                url: url.clone(),
                status: response.status,
            };
            self.dispatch_failure(url, &err);
            return Err(err);
        }

        governor.report_success();
        let body = String::from_utf8(response.body.to_vec()).map_err(|_| FetchError::Decode {
            url: response.url.clone(),
        })?;

        Ok(FetchedPage {
            url: response.url,
            status: response.status,
            body,
        })
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.identity.headers();
        if let Some(referer) = &self.referer {
            headers.insert(REFERER, referer.clone());
        }
        if let Some(language) = &self.accept_language {
            headers.entry(ACCEPT_LANGUAGE).or_insert_with(|| language.clone());
        }
        headers
            .entry(ACCEPT)
            .or_insert_with(|| HeaderValue::from_static(FALLBACK_ACCEPT));
        headers
    }

    fn dispatch_failure(&self, url: &Url, err: &FetchError) {
        self.events.dispatch(CrawlEvent::Error {
            scope: ErrorScope::Fetch,
            url: Some(url.clone()),
            page: None,
            message: err.to_string(),
        });
    }
}
