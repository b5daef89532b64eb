//! Listing card to [`Listing`] conversion.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Selector};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use super::selectors::{FieldKey, SelectorResolver};
use super::values::{element_text, normalize_text, parse_count, parse_posted_at, parse_price};
use crate::listing::{Listing, ListingStatus};

pub const DEFAULT_DESCRIPTION: &str = "No description";
pub const DEFAULT_AUTHOR: &str = "Anonymous";
pub const DEFAULT_CATEGORY: &str = "Uncategorized";
pub const DEFAULT_ID_ATTRIBUTE: &str = "data-want-id";

static ANCHOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("invalid anchor selector"));

/// Why a card produced no listing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("card has no title")]
    MissingTitle,
    #[error("card has no link")]
    MissingLink,
    #[error("card link `{0}` cannot be resolved")]
    InvalidLink(String),
}

/// Turns listing cards into [`Listing`] values.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    base_url: Url,
    id_attribute: String,
    currency: String,
}

impl FieldExtractor {
    pub fn new(base_url: Url, currency: impl Into<String>) -> Self {
        Self {
            base_url,
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            currency: currency.into(),
        }
    }

    pub fn with_id_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.id_attribute = attribute.into();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn extract(
        &self,
        resolver: &mut SelectorResolver<'_, '_>,
        card: ElementRef<'_>,
    ) -> Result<Listing, SkipReason> {
        self.extract_at(resolver, card, Utc::now())
    }

    /// Extract with an explicit "now" for relative dates.
    pub fn extract_at(
        &self,
        resolver: &mut SelectorResolver<'_, '_>,
        card: ElementRef<'_>,
        now: DateTime<Utc>,
    ) -> Result<Listing, SkipReason> {
        let title_el = resolver
            .first_in(card, FieldKey::Title)
            .ok_or(SkipReason::MissingTitle)?;
        let title = element_text(title_el);
        if title.is_empty() {
            return Err(SkipReason::MissingTitle);
        }

        let href = title_el
            .value()
            .attr("href")
            .or_else(|| {
                title_el
                    .select(&ANCHOR)
                    .find_map(|anchor| anchor.value().attr("href"))
            })
            .map(str::trim)
            .filter(|href| !href.is_empty())
            .ok_or(SkipReason::MissingLink)?;
        let link = self
            .base_url
            .join(href)
            .map_err(|_| SkipReason::InvalidLink(href.to_string()))?;

        let external_id = self.external_id(card, &link);

        let description = text_in(resolver, card, FieldKey::Description)
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.into());
        let author =
            text_in(resolver, card, FieldKey::Author).unwrap_or_else(|| DEFAULT_AUTHOR.into());
        let category =
            text_in(resolver, card, FieldKey::Category).unwrap_or_else(|| DEFAULT_CATEGORY.into());
        let (price, price_type) =
            parse_price(&text_in(resolver, card, FieldKey::Price).unwrap_or_default());
        let responses_count = text_in(resolver, card, FieldKey::ResponsesCount)
            .map(|text| parse_count(&text))
            .unwrap_or(0);
        let views_count = text_in(resolver, card, FieldKey::ViewsCount)
            .map(|text| parse_count(&text))
            .unwrap_or(0);
        let date_created = text_in(resolver, card, FieldKey::PostedAt)
            .and_then(|text| parse_posted_at(&text, now))
            .unwrap_or(now);
        let tags = texts_in(resolver, card, FieldKey::Tags);
        let skills = texts_in(resolver, card, FieldKey::Skills);

        Ok(Listing {
            external_id,
            title,
            description,
            price,
            price_type,
            currency: self.currency.clone(),
            author,
            category,
            subcategory: None,
            date_created,
            date_parsed: now,
            responses_count,
            views_count,
            link: link.to_string(),
            tags,
            skills,
            status: ListingStatus::New,
        })
    }

    /// Id attribute, then the leading digits of the first path segment that
    /// starts with one, then a hash of the link.
    fn external_id(&self, card: ElementRef<'_>, link: &Url) -> String {
        if let Some(id) = card
            .value()
            .attr(&self.id_attribute)
            .map(normalize_text)
            .filter(|id| !id.is_empty())
        {
            return id;
        }

        if let Some(digits) = link.path_segments().and_then(|mut segments| {
            segments.find_map(|segment| {
                let end = segment
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(segment.len());
                (end > 0).then(|| &segment[..end])
            })
        }) {
            return digits.to_string();
        }

        let digest = Sha256::digest(link.as_str().as_bytes());
        format!("url-{}", &hex::encode(digest)[..16])
    }
}

fn text_in(
    resolver: &mut SelectorResolver<'_, '_>,
    card: ElementRef<'_>,
    field: FieldKey,
) -> Option<String> {
    resolver
        .first_in(card, field)
        .map(element_text)
        .filter(|text| !text.is_empty())
}

fn texts_in(resolver: &mut SelectorResolver<'_, '_>, card: ElementRef<'_>, field: FieldKey) -> Vec<String> {
    resolver
        .all_in(card, field)
        .into_iter()
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::selectors::SelectorSet;
    use crate::listing::PriceType;
    use chrono::TimeZone;
    use scraper::Html;

    const CARD: &str = r#"
        <div class="wants-list">
          <div class="want-card" data-want-id="2451187">
            <div class="wants-card__header-title"><a href="/projects/2451187/view">  Parser
              for a marketplace </a></div>
            <div class="wants-card__description-text">Need a scraper written in Rust</div>
            <div class="wants-card__price">Желаемый бюджет: до 15 000 ₽</div>
            <a class="wants-card__header-username">ivan_dev</a>
            <div class="wants-card__category">Scripts, bots</div>
            <div class="wants-card__responses">Предложений: 7</div>
            <div class="wants-card__views">Просмотров: 1 204</div>
            <div class="wants-card__time">2 часа назад</div>
            <div class="wants-card__tags"><span class="tag">rust</span><span class="tag"> </span><span class="tag">parsing</span></div>
          </div>
        </div>
    "#;

    fn extractor() -> FieldExtractor {
        FieldExtractor::new(Url::parse("https://kwork.ru").unwrap(), "RUB")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn extract_first(html: &str) -> Result<Listing, SkipReason> {
        let document = Html::parse_document(html);
        let set = SelectorSet::default();
        let mut resolver = SelectorResolver::new(&set, document.root_element());
        let card = resolver.first(FieldKey::ListingCard).expect("card present");
        extractor().extract_at(&mut resolver, card, now())
    }

    #[test]
    fn extracts_full_card() {
        let listing = extract_first(CARD).unwrap();
        assert_eq!(listing.external_id, "2451187");
        assert_eq!(listing.title, "Parser for a marketplace");
        assert_eq!(listing.link, "https://kwork.ru/projects/2451187/view");
        assert_eq!(listing.price, Some(15_000.0));
        assert_eq!(listing.price_type, PriceType::Range);
        assert_eq!(listing.currency, "RUB");
        assert_eq!(listing.author, "ivan_dev");
        assert_eq!(listing.category, "Scripts, bots");
        assert_eq!(listing.responses_count, 7);
        assert_eq!(listing.views_count, 1204);
        assert_eq!(listing.date_created, now() - chrono::Duration::hours(2));
        assert_eq!(listing.tags, vec!["rust".to_string(), "parsing".to_string()]);
        assert!(listing.skills.is_empty());
    }

    #[test]
    fn missing_title_is_skipped() {
        let html = r#"<div class="want-card" data-want-id="1"><p>no title here</p></div>"#;
        assert_eq!(extract_first(html).unwrap_err(), SkipReason::MissingTitle);
    }

    #[test]
    fn title_without_href_is_skipped() {
        let html = r#"<div class="want-card"><h3><a>Orphan</a></h3></div>"#;
        assert_eq!(extract_first(html).unwrap_err(), SkipReason::MissingLink);
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let html = r#"<div class="want-card"><h3><a href="https://kwork.ru/projects/77">Logo</a></h3></div>"#;
        let listing = extract_first(html).unwrap();
        assert_eq!(listing.external_id, "77");
        assert_eq!(listing.description, DEFAULT_DESCRIPTION);
        assert_eq!(listing.author, DEFAULT_AUTHOR);
        assert_eq!(listing.category, DEFAULT_CATEGORY);
        assert_eq!(listing.price, None);
        assert_eq!(listing.price_type, PriceType::Negotiable);
        assert_eq!(listing.date_created, now());
    }

    #[test]
    fn slug_link_yields_its_leading_digits() {
        let html = r#"<div class="want-card"><h3><a href="/projects/123-logo">Logo</a></h3></div>"#;
        assert_eq!(extract_first(html).unwrap().external_id, "123");
    }

    #[test]
    fn hashed_id_is_stable_across_runs() {
        let html = r#"<div class="want-card"><h3><a href="/projects/logo-design">Logo</a></h3></div>"#;
        let first = extract_first(html).unwrap().external_id;
        let second = extract_first(html).unwrap().external_id;
        assert_eq!(first, second);
        assert!(first.starts_with("url-"));
        assert_eq!(first.len(), 20);
    }
}
