//! Listing records produced by the crawl.
//!
//! A [`Listing`] is created once by the field extractor and never mutated by
//! the crawl afterwards; ownership moves to the dedup gate and then to the
//! caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extraction::fields::DEFAULT_AUTHOR;

/// Maximum distance between two creation timestamps for the secondary
/// duplicate heuristic.
const DUPLICATE_WINDOW_SECS: i64 = 3600;

/// How the listing's price is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    Fixed,
    Negotiable,
    Hourly,
    Range,
}

impl PriceType {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceType::Fixed => "fixed",
            PriceType::Negotiable => "negotiable",
            PriceType::Hourly => "hourly",
            PriceType::Range => "range",
        }
    }
}

/// Processing status tracked by downstream collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    New,
    Updated,
    Sent,
    Archived,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::New => "new",
            ListingStatus::Updated => "updated",
            ListingStatus::Sent => "sent",
            ListingStatus::Archived => "archived",
        }
    }
}

/// One structured record scraped from the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub price_type: PriceType,
    pub currency: String,
    pub author: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_parsed: DateTime<Utc>,
    pub responses_count: u32,
    pub views_count: u32,
    pub link: String,
    pub tags: Vec<String>,
    pub skills: Vec<String>,
    pub status: ListingStatus,
}

impl Listing {
    /// Two listings describe the same entity when their external ids match,
    /// or when title and author agree (case-insensitively) and they were
    /// created within an hour of each other.
    ///
    /// The title/author rule only applies to listings with a real author and
    /// a creation date read from the page; placeholders match nothing.
    pub fn is_duplicate_of(&self, other: &Listing) -> bool {
        if self.external_id == other.external_id {
            return true;
        }
        if !self.has_own_identity() || !other.has_own_identity() {
            return false;
        }

        let same_title = normalize_key(&self.title) == normalize_key(&other.title);
        let same_author = normalize_key(&self.author) == normalize_key(&other.author);
        let delta = (self.date_created - other.date_created).num_seconds().abs();

        same_title && same_author && delta < DUPLICATE_WINDOW_SECS
    }

    /// Author and creation date both came from the page.
    fn has_own_identity(&self) -> bool {
        self.author != DEFAULT_AUTHOR && self.date_created != self.date_parsed
    }

    /// Flat string view used by exporters and notifiers.
    pub fn to_record(&self) -> BTreeMap<&'static str, String> {
        let mut record = BTreeMap::new();
        record.insert("external_id", self.external_id.clone());
        record.insert("title", self.title.clone());
        record.insert("description", self.description.clone());
        record.insert(
            "price",
            self.price.map(|p| p.to_string()).unwrap_or_default(),
        );
        record.insert("price_type", self.price_type.as_str().to_string());
        record.insert("currency", self.currency.clone());
        record.insert("author", self.author.clone());
        record.insert("category", self.category.clone());
        record.insert(
            "subcategory",
            self.subcategory.clone().unwrap_or_default(),
        );
        record.insert("date_created", self.date_created.to_rfc3339());
        record.insert("date_parsed", self.date_parsed.to_rfc3339());
        record.insert("responses_count", self.responses_count.to_string());
        record.insert("views_count", self.views_count.to_string());
        record.insert("link", self.link.clone());
        record.insert("tags", self.tags.join(", "));
        record.insert("skills", self.skills.join(", "));
        record.insert("status", self.status.as_str().to_string());
        record
    }
}

fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn listing(external_id: &str) -> Listing {
        let now = Utc::now();
        Listing {
            external_id: external_id.to_string(),
            title: "Landing page".into(),
            description: "Need a landing page for a bakery".into(),
            price: Some(5000.0),
            price_type: PriceType::Fixed,
            currency: "RUB".into(),
            author: "baker".into(),
            category: "Web".into(),
            subcategory: None,
            date_created: now - chrono::Duration::hours(2),
            date_parsed: now,
            responses_count: 0,
            views_count: 0,
            link: format!("https://kwork.ru/projects/{external_id}"),
            tags: Vec::new(),
            skills: Vec::new(),
            status: ListingStatus::New,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::listing;
    use super::*;
    use chrono::Duration;

    #[test]
    fn same_external_id_is_duplicate() {
        let a = listing("100");
        let mut b = listing("100");
        b.title = "Completely different".into();
        assert!(a.is_duplicate_of(&b));
    }

    #[test]
    fn title_author_heuristic_respects_one_hour_window() {
        let a = listing("1");
        let mut b = listing("2");
        b.title = "  LANDING page ".into();
        b.date_created = a.date_created + Duration::minutes(59);
        assert!(a.is_duplicate_of(&b));

        b.date_created = a.date_created + Duration::minutes(61);
        assert!(!a.is_duplicate_of(&b));
    }

    #[test]
    fn placeholder_author_or_fallback_date_never_matches() {
        let mut a = listing("100");
        let mut b = listing("200");
        a.author = DEFAULT_AUTHOR.into();
        b.author = DEFAULT_AUTHOR.into();
        assert!(!a.is_duplicate_of(&b));

        let mut a = listing("100");
        let mut b = listing("200");
        a.date_created = a.date_parsed;
        b.date_created = a.date_parsed;
        assert!(!a.is_duplicate_of(&b));
        assert!(!b.is_duplicate_of(&a));
    }

    #[test]
    fn serializes_enums_lowercase() {
        let json = serde_json::to_value(listing("7")).unwrap();
        assert_eq!(json["price_type"], "fixed");
        assert_eq!(json["status"], "new");
    }

    #[test]
    fn record_flattens_lists() {
        let mut item = listing("9");
        item.tags = vec!["rust".into(), "web".into()];
        let record = item.to_record();
        assert_eq!(record["tags"], "rust, web");
        assert_eq!(record["price"], "5000");
    }
}
