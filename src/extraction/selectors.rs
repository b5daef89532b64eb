//! Selector tables and per-document resolution.
//!
//! Every logical field owns an ordered list of candidate CSS selectors,
//! primary first. A [`SelectorResolver`] is bound to one document and
//! remembers which candidate won for each field so later cards in the same
//! page skip the probing.

use std::collections::{BTreeMap, HashMap};

use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("invalid selector `{selector}` for {field}: {reason}")]
    Invalid {
        field: &'static str,
        selector: String,
        reason: String,
    },
    #[error("no selectors configured for {0}")]
    Empty(&'static str),
}

/// Logical fields located through CSS selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    ListingsContainer,
    ListingCard,
    Title,
    Description,
    Price,
    Author,
    Category,
    Tags,
    Skills,
    ResponsesCount,
    ViewsCount,
    PostedAt,
    CurrentPage,
    PageNumbers,
    NextPage,
    TotalCount,
}

impl FieldKey {
    pub const ALL: [FieldKey; 16] = [
        FieldKey::ListingsContainer,
        FieldKey::ListingCard,
        FieldKey::Title,
        FieldKey::Description,
        FieldKey::Price,
        FieldKey::Author,
        FieldKey::Category,
        FieldKey::Tags,
        FieldKey::Skills,
        FieldKey::ResponsesCount,
        FieldKey::ViewsCount,
        FieldKey::PostedAt,
        FieldKey::CurrentPage,
        FieldKey::PageNumbers,
        FieldKey::NextPage,
        FieldKey::TotalCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldKey::ListingsContainer => "listings_container",
            FieldKey::ListingCard => "listing_card",
            FieldKey::Title => "title",
            FieldKey::Description => "description",
            FieldKey::Price => "price",
            FieldKey::Author => "author",
            FieldKey::Category => "category",
            FieldKey::Tags => "tags",
            FieldKey::Skills => "skills",
            FieldKey::ResponsesCount => "responses_count",
            FieldKey::ViewsCount => "views_count",
            FieldKey::PostedAt => "posted_at",
            FieldKey::CurrentPage => "current_page",
            FieldKey::PageNumbers => "page_numbers",
            FieldKey::NextPage => "next_page",
            FieldKey::TotalCount => "total_count",
        }
    }

    /// Built-in candidates, primary first.
    pub fn default_candidates(self) -> &'static [&'static str] {
        match self {
            FieldKey::ListingsContainer => &[".wants-list", ".projects-list", "body"],
            FieldKey::ListingCard => &[".want-card", "[data-want-id]"],
            FieldKey::Title => &[
                ".wants-card__header-title a",
                "h3 a, .title a, .project-title a",
            ],
            FieldKey::Description => &[
                ".wants-card__description-text",
                ".description, .content, .text, p",
            ],
            FieldKey::Price => &[
                ".wants-card__price",
                ".price, .cost, .amount, [class*='price']",
            ],
            FieldKey::Author => &[
                ".wants-card__header-username",
                ".author, .username, .user-name, [class*='user']",
            ],
            FieldKey::Category => &[".wants-card__category", ".category"],
            FieldKey::Tags => &[".wants-card__tags .tag", ".tags .tag"],
            FieldKey::Skills => &[".wants-card__skills .skill", ".skills .skill"],
            FieldKey::ResponsesCount => &[
                ".wants-card__responses",
                "[class*='response'], [class*='offer'], [class*='bid']",
            ],
            FieldKey::ViewsCount => &[".wants-card__views", "[class*='view'], [class*='visit']"],
            FieldKey::PostedAt => &[
                ".wants-card__time",
                "[class*='time'], [class*='date'], .timestamp",
            ],
            FieldKey::CurrentPage => &[".pagination .current", ".active", ".page-current"],
            FieldKey::PageNumbers => &[".pagination .page-numbers", ".pagination a", ".page-link"],
            FieldKey::NextPage => &[".pagination .next", ".next-page", "[rel='next']"],
            FieldKey::TotalCount => &[".wants-found-count", ".total-count", ".results-count"],
        }
    }
}

/// A parsed selector together with its source text.
#[derive(Debug, Clone)]
pub struct Candidate {
    source: String,
    selector: Selector,
}

impl Candidate {
    fn parse(field: FieldKey, source: &str) -> Result<Self, SelectorError> {
        let selector = Selector::parse(source).map_err(|err| SelectorError::Invalid {
            field: field.as_str(),
            selector: source.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            selector,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}

/// Validated candidate lists for every [`FieldKey`].
#[derive(Debug, Clone)]
pub struct SelectorSet {
    table: HashMap<FieldKey, Vec<Candidate>>,
}

impl SelectorSet {
    /// Built-in table with `overrides` replacing the candidates of the fields
    /// they name.
    pub fn with_overrides(
        overrides: &BTreeMap<FieldKey, Vec<String>>,
    ) -> Result<Self, SelectorError> {
        let mut table = HashMap::with_capacity(FieldKey::ALL.len());
        for field in FieldKey::ALL {
            let candidates = match overrides.get(&field) {
                Some(custom) if custom.is_empty() => return Err(SelectorError::Empty(field.as_str())),
                Some(custom) => custom
                    .iter()
                    .map(|source| Candidate::parse(field, source))
                    .collect::<Result<Vec<_>, _>>()?,
                None => field
                    .default_candidates()
                    .iter()
                    .map(|source| Candidate::parse(field, source))
                    .collect::<Result<Vec<_>, _>>()?,
            };
            table.insert(field, candidates);
        }
        Ok(Self { table })
    }

    pub fn candidates(&self, field: FieldKey) -> &[Candidate] {
        self.table.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self::with_overrides(&BTreeMap::new()).expect("built-in selectors are valid")
    }
}

/// Per-document resolution state.
///
/// Document-level lookups (`resolve`, `first`, `all`) cache the winning
/// candidate index per field, misses included. Card-level lookups (`first_in`,
/// `all_in`) try the cached winner first and fall back to the remaining
/// candidates, so one card missing an element does not hide it for the rest.
pub struct SelectorResolver<'a, 's> {
    set: &'s SelectorSet,
    root: ElementRef<'a>,
    winners: HashMap<FieldKey, Option<usize>>,
    probes: usize,
}

impl<'a, 's> SelectorResolver<'a, 's> {
    pub fn new(set: &'s SelectorSet, root: ElementRef<'a>) -> Self {
        Self {
            set,
            root,
            winners: HashMap::new(),
            probes: 0,
        }
    }

    pub fn root(&self) -> ElementRef<'a> {
        self.root
    }

    pub fn set(&self) -> &'s SelectorSet {
        self.set
    }

    /// Number of candidate probes run so far.
    pub fn probes(&self) -> usize {
        self.probes
    }

    /// First candidate for `field` matching anything in the document.
    pub fn resolve(&mut self, field: FieldKey) -> Option<&'s Candidate> {
        let set = self.set;
        let winner = match self.winners.get(&field) {
            Some(cached) => *cached,
            None => {
                let root = self.root;
                let found = self.probe(field, root, None);
                if found.is_none() {
                    log::debug!("no selector matched for {}", field.as_str());
                }
                self.winners.insert(field, found);
                found
            }
        };
        winner.and_then(|index| set.candidates(field).get(index))
    }

    pub fn first(&mut self, field: FieldKey) -> Option<ElementRef<'a>> {
        let root = self.root;
        self.resolve(field)
            .and_then(|candidate| root.select(&candidate.selector).next())
    }

    pub fn all(&mut self, field: FieldKey) -> Vec<ElementRef<'a>> {
        let root = self.root;
        self.resolve(field)
            .map(|candidate| root.select(&candidate.selector).collect())
            .unwrap_or_default()
    }

    /// First element for `field` inside `scope`.
    pub fn first_in<'b>(&mut self, scope: ElementRef<'b>, field: FieldKey) -> Option<ElementRef<'b>> {
        let index = self.resolve_in(scope, field)?;
        scope.select(&self.set.candidates(field)[index].selector).next()
    }

    /// Elements matched inside `scope` by the first matching candidate.
    pub fn all_in<'b>(&mut self, scope: ElementRef<'b>, field: FieldKey) -> Vec<ElementRef<'b>> {
        match self.resolve_in(scope, field) {
            Some(index) => scope
                .select(&self.set.candidates(field)[index].selector)
                .collect(),
            None => Vec::new(),
        }
    }

    fn resolve_in(&mut self, scope: ElementRef<'_>, field: FieldKey) -> Option<usize> {
        let preferred = self.winners.get(&field).copied().flatten();
        let found = self.probe(field, scope, preferred);
        if found.is_some() {
            self.winners.insert(field, found);
        }
        found
    }

    /// Index of the first candidate matching inside `scope`, trying
    /// `preferred` before the declared order.
    fn probe(&mut self, field: FieldKey, scope: ElementRef<'_>, preferred: Option<usize>) -> Option<usize> {
        let candidates = self.set.candidates(field);
        let order = preferred
            .into_iter()
            .chain((0..candidates.len()).filter(|index| Some(*index) != preferred));
        for index in order {
            self.probes += 1;
            if scope.select(&candidates[index].selector).next().is_some() {
                return Some(index);
            }
        }
        None
    }
}
