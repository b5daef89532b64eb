//! High level crawl orchestration.
//!
//! Wires the rate governors, identity rotator, retry orchestrator, fetch
//! executor and pagination walker into one crawl context, and exposes the
//! crawl as a stream of page batches plus a store-and-notify cycle on top.

use std::sync::Arc;

use futures::{Stream, StreamExt, pin_mut};
use serde::Serialize;
use thiserror::Error;

use crate::config::{
	ConfigError, CrawlerSettings, IdentityConfig, RateLimitConfig, RetryConfig,
};
use crate::extraction::{FieldExtractor, FieldKey};
use crate::external_deps::{ListingRepository, Notifier, RecordId};
use crate::fetch::{FetchExecutor, HttpTransport, ReqwestTransport, TransportError};
use crate::listing::Listing;
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::identity::{IdentityRotator, IdentitySnapshot};
use crate::modules::metrics::{CrawlMetrics, CrawlStats};
use crate::modules::rate_governor::{RateGovernorRegistry, RateGovernorSnapshot};
use crate::modules::retry::RetryOrchestrator;
use crate::walker::{CrawlRequest, PageBatch, PageError, PaginationWalker};

/// Result alias used across the orchestration layer.
pub type CrawlerResult<T> = Result<T, CrawlerError>;

/// High-level error surfaced by the crawler.
#[derive(Debug, Error)]
pub enum CrawlerError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("transport initialisation failed: {0}")]
	Transport(#[from] TransportError),
	#[error("page failed: {0}")]
	Page(#[from] PageError),
}

/// Combined view over every stateful service of the crawl context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlerStats {
	pub crawl: CrawlStats,
	pub rate_governors: Vec<RateGovernorSnapshot>,
	pub identity: IdentitySnapshot,
}

/// Outcome of one [`Crawler::run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
	pub pages: u32,
	/// New listings yielded by the crawl.
	pub found: usize,
	pub duplicates: usize,
	pub stored: usize,
	pub notified: usize,
	/// Repository and notifier failures; page failures are in the crawl stats.
	pub errors: usize,
}

/// Fluent builder for [`Crawler`].
pub struct CrawlerBuilder {
	settings: CrawlerSettings,
	transport: Option<Arc<dyn HttpTransport>>,
	repository: Option<Arc<dyn ListingRepository>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl CrawlerBuilder {
	pub fn new() -> Self {
		Self {
			settings: CrawlerSettings::default(),
			transport: None,
			repository: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_settings(mut self, settings: CrawlerSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
		self.settings.rate_limit = config;
		self
	}

	pub fn with_retry(mut self, config: RetryConfig) -> Self {
		self.settings.retry = config;
		self
	}

	pub fn with_identity(mut self, config: IdentityConfig) -> Self {
		self.settings.identity = config;
		self
	}

	pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
		self.settings.parser.base_url = base_url.into();
		self
	}

	pub fn with_max_pages(mut self, max_pages: u32) -> Self {
		self.settings.parser.max_pages = max_pages;
		self
	}

	pub fn with_max_concurrent_requests(mut self, limit: usize) -> Self {
		self.settings.parser.concurrent_requests = limit;
		self
	}

	/// Pause between consecutive pages, in seconds.
	pub fn with_page_delay(mut self, seconds: f64) -> Self {
		self.settings.parser.page_delay = seconds;
		self
	}

	/// Replace the candidate selectors of one field.
	pub fn with_selector_override<I, S>(mut self, field: FieldKey, selectors: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.settings
			.selectors
			.insert(field, selectors.into_iter().map(Into::into).collect());
		self
	}

	/// Use a custom transport instead of the reqwest client.
	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Dedup gate consulted by [`Crawler::crawl`] and [`Crawler::crawl_page`].
	pub fn with_repository(mut self, repository: Arc<dyn ListingRepository>) -> Self {
		self.repository = Some(repository);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> CrawlerResult<Crawler> {
		Crawler::with_parts(self)
	}
}

impl Default for CrawlerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Crawl context for one target site.
pub struct Crawler {
	settings: CrawlerSettings,
	walker: PaginationWalker,
	governors: RateGovernorRegistry,
	identity: Arc<IdentityRotator>,
	metrics: CrawlMetrics,
	repository: Option<Arc<dyn ListingRepository>>,
}

impl Crawler {
	/// Construct a crawler with default settings.
	pub fn new() -> CrawlerResult<Self> {
		Self::builder().build()
	}

	/// Obtain a builder to customise the crawler.
	pub fn builder() -> CrawlerBuilder {
		CrawlerBuilder::new()
	}

	fn with_parts(parts: CrawlerBuilder) -> CrawlerResult<Self> {
		let CrawlerBuilder {
			settings,
			transport,
			repository,
			handlers,
		} = parts;
		settings.validate()?;

		let base_url = settings.parser.base_url()?;
		let listing_url = settings.parser.listing_url()?;
		let selectors = Arc::new(settings.selector_set()?);

		let transport: Arc<dyn HttpTransport> = match transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new(settings.parser.timeouts())?),
		};

		let metrics = CrawlMetrics::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let governors = RateGovernorRegistry::new(settings.rate_limit.clone());
		let identity = Arc::new(IdentityRotator::new(settings.identity.clone()));
		let executor = FetchExecutor::new(
			transport,
			settings.parser.concurrent_requests,
			governors.clone(),
			identity.clone(),
			RetryOrchestrator::new(settings.retry.clone()),
			events.clone(),
		)
		.with_referer(base_url.as_str())
		.with_accept_language(&settings.identity.accept_language);

		let extractor = FieldExtractor::new(base_url, settings.parser.currency.clone())
			.with_id_attribute(settings.parser.id_attribute.clone());
		let walker = PaginationWalker::new(
			Arc::new(executor),
			selectors,
			extractor,
			listing_url,
			settings.parser.page_delay(),
			events,
		);

		log::debug!(
			"crawler ready for {} ({} concurrent requests)",
			settings.parser.base_url,
			settings.parser.concurrent_requests
		);

		Ok(Self {
			settings,
			walker,
			governors,
			identity,
			metrics,
			repository,
		})
	}

	pub fn settings(&self) -> &CrawlerSettings {
		&self.settings
	}

	/// Lazily walk the listing pages. Page failures end the stream early;
	/// they are visible through [`Crawler::stats`], never as items.
	pub fn crawl(&self, request: CrawlRequest) -> impl Stream<Item = PageBatch> + Send + '_ {
		self.walker.walk(request, self.repository.as_deref())
	}

	/// Fetch and extract one page outside a walk.
	pub async fn crawl_page(&self, page: u32, request: &CrawlRequest) -> CrawlerResult<PageBatch> {
		Ok(self
			.walker
			.page(page.max(1), request, self.repository.as_deref())
			.await?)
	}

	pub fn stats(&self) -> CrawlerStats {
		CrawlerStats {
			crawl: self.metrics.snapshot(),
			rate_governors: self.governors.snapshot(),
			identity: self.identity.snapshot(),
		}
	}

	/// Clear counters and rate governor state.
	pub fn reset_stats(&self) {
		self.metrics.reset();
		self.governors.reset_all();
	}

	/// Crawl, store every new listing and hand each page's stored listings
	/// to `notifier`. Listings are marked sent only when the notifier accepts
	/// the batch. `max_pages` falls back to the configured page limit.
	pub async fn run_cycle(
		&self,
		repository: &dyn ListingRepository,
		notifier: &dyn Notifier,
		max_pages: Option<u32>,
	) -> CycleReport {
		let request = CrawlRequest::new()
			.with_max_pages(max_pages.unwrap_or(self.settings.parser.max_pages));
		let mut report = CycleReport::default();

		let batches = self.walker.walk(request, Some(repository));
		pin_mut!(batches);
		while let Some(batch) = batches.next().await {
			report.pages += 1;
			report.found += batch.listings.len();
			report.duplicates += batch.duplicates;

			let stored = store_batch(repository, &batch.listings, &mut report).await;
			if stored.is_empty() {
				continue;
			}
			let (ids, listings): (Vec<RecordId>, Vec<Listing>) = stored.into_iter().unzip();
			match notifier.send_batch(&listings).await {
				Ok(true) => {
					for id in ids {
						match repository.mark_sent(id).await {
							Ok(true) => report.notified += 1,
							Ok(false) => log::warn!("record {id} vanished before mark_sent"),
							Err(err) => {
								log::error!("failed to mark record {id} as sent: {err}");
								report.errors += 1;
							}
						}
					}
				}
				Ok(false) => {
					log::warn!(
						"{} rejected {} listings from page {}",
						notifier.name(),
						listings.len(),
						batch.page
					);
				}
				Err(err) => {
					log::error!("{} failed on page {}: {err}", notifier.name(), batch.page);
					report.errors += 1;
				}
			}
		}

		log::info!(
			"cycle finished: {} pages, {} new, {} stored, {} notified",
			report.pages,
			report.found,
			report.stored,
			report.notified
		);
		report
	}
}

async fn store_batch(
	repository: &dyn ListingRepository,
	listings: &[Listing],
	report: &mut CycleReport,
) -> Vec<(RecordId, Listing)> {
	let mut stored = Vec::with_capacity(listings.len());
	for listing in listings {
		match repository.create_project(listing).await {
			Ok(id) => {
				report.stored += 1;
				stored.push((id, listing.clone()));
			}
			Err(err) => {
				log::error!("failed to store listing {}: {err}", listing.external_id);
				report.errors += 1;
			}
		}
	}
	stored
}

impl std::fmt::Debug for Crawler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Crawler")
			.field("base_url", &self.settings.parser.base_url)
			.field("repository", &self.repository.is_some())
			.finish()
	}
}
