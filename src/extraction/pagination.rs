//! Page-level parsing: listing cards plus the pagination cursor.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use scraper::Html;
use serde::Serialize;
use url::Url;

use super::fields::{FieldExtractor, SkipReason};
use super::selectors::{FieldKey, SelectorResolver, SelectorSet};
use super::values::parse_count;
use crate::listing::Listing;

/// Where a page sits in the result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationCursor {
    pub current_page: u32,
    pub total_pages: u32,
    pub has_next: bool,
    pub next_page_url: Option<String>,
    pub total_results: u32,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self {
            current_page: 1,
            total_pages: 1,
            has_next: false,
            next_page_url: None,
            total_results: 0,
        }
    }
}

/// Owned result of parsing one listing page.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub listings: Vec<Listing>,
    pub skipped: Vec<SkipReason>,
    pub cards: usize,
    pub cursor: PaginationCursor,
    pub duration: Duration,
}

/// Parse a listing page. The document never leaves this function, so callers
/// can hold the result across `.await` points.
pub fn parse_page(
    html: &str,
    selectors: &SelectorSet,
    extractor: &FieldExtractor,
) -> ParsedPage {
    parse_page_at(html, selectors, extractor, Utc::now())
}

pub fn parse_page_at(
    html: &str,
    selectors: &SelectorSet,
    extractor: &FieldExtractor,
    now: DateTime<Utc>,
) -> ParsedPage {
    let started = Instant::now();
    let document = Html::parse_document(html);
    let mut resolver = SelectorResolver::new(selectors, document.root_element());

    let scope = resolver.first(FieldKey::ListingsContainer).unwrap_or(resolver.root());
    let cards = resolver.all_in(scope, FieldKey::ListingCard);

    let mut listings = Vec::with_capacity(cards.len());
    let mut skipped = Vec::new();
    for card in &cards {
        match extractor.extract_at(&mut resolver, *card, now) {
            Ok(listing) => listings.push(listing),
            Err(reason) => {
                log::debug!("skipping card: {reason}");
                skipped.push(reason);
            }
        }
    }

    let cursor = extract_cursor(&mut resolver, extractor.base_url());

    ParsedPage {
        listings,
        skipped,
        cards: cards.len(),
        cursor,
        duration: started.elapsed(),
    }
}

/// Read the pagination cursor from a parsed document.
///
/// Each value walks its candidate selectors in order: the current page is the
/// first positive number, the page count the maximum of the first candidate
/// yielding numbers, the next link the first candidate carrying an `href`.
/// Without a next link, `has_next` falls back to `current < total`.
pub fn extract_cursor(resolver: &mut SelectorResolver<'_, '_>, base_url: &Url) -> PaginationCursor {
    let set = resolver.set();
    let root = resolver.root();

    let current_page = set
        .candidates(FieldKey::CurrentPage)
        .iter()
        .filter_map(|candidate| root.select(candidate.selector()).next())
        .map(|element| parse_count(&element.text().collect::<String>()))
        .find(|page| *page > 0)
        .unwrap_or(1);

    let total_pages = set
        .candidates(FieldKey::PageNumbers)
        .iter()
        .filter_map(|candidate| {
            root.select(candidate.selector())
                .map(|element| parse_count(&element.text().collect::<String>()))
                .filter(|page| *page > 0)
                .max()
        })
        .next()
        .unwrap_or(1)
        .max(current_page);

    let next_page_url = set
        .candidates(FieldKey::NextPage)
        .iter()
        .filter_map(|candidate| root.select(candidate.selector()).next())
        .filter_map(|element| element.value().attr("href"))
        .map(str::trim)
        .find(|href| !href.is_empty() && !href.starts_with('#'))
        .and_then(|href| base_url.join(href).ok())
        .map(String::from);

    let total_results = resolver
        .first(FieldKey::TotalCount)
        .map(|element| parse_count(&element.text().collect::<String>()))
        .unwrap_or(0);

    PaginationCursor {
        current_page,
        total_pages,
        has_next: next_page_url.is_some() || current_page < total_pages,
        next_page_url,
        total_results,
    }
}
