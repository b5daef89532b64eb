//! Text to value conversions for scraped fields.
//!
//! All functions are total: unparsable input degrades to a default instead of
//! failing.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;

use crate::listing::PriceType;

const NEGOTIABLE_KEYWORDS: &[&str] = &[
    "договорная",
    "по договоренности",
    "по договорённости",
    "договор",
    "обсуждается",
    "negotiable",
    "by agreement",
    "tbd",
];

const HOURLY_TOKENS: &[&str] = &["час", "/ч", "hour", "/h", "/hr"];
const RANGE_DASHES: &[char] = &['-', '–', '—'];

static PRICE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d\s.,]*").expect("invalid price regex"));
static RANGE_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(от|до|from|to)\b").expect("invalid range regex"));
static INTEGER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("invalid integer regex"));
static DOTTED_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b").expect("invalid dotted date regex")
});
static ISO_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").expect("invalid iso date regex"));
static WORDY_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})\s+([a-zа-яё]+)\.?,?\s+(\d{4})\b").expect("invalid month date regex")
});
static CLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2}):(\d{2})\b").expect("invalid clock regex"));

/// Collapse runs of whitespace (including non-breaking spaces) and trim.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized text content of an element.
pub fn element_text(element: ElementRef<'_>) -> String {
    normalize_text(&element.text().collect::<String>())
}

/// Parse a price cell into an amount and its kind.
///
/// Negotiable wording, empty text and text without digits yield
/// `(None, Negotiable)`. The first number is the amount; hourly tokens and
/// range markers decide the kind.
pub fn parse_price(raw: &str) -> (Option<f64>, PriceType) {
    let text = normalize_text(raw).to_lowercase();
    if text.is_empty() || NEGOTIABLE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        return (None, PriceType::Negotiable);
    }

    let Some(amount) = PRICE_NUMBER_RE
        .find(&text)
        .and_then(|m| normalize_number(m.as_str()))
    else {
        return (None, PriceType::Negotiable);
    };

    let kind = if HOURLY_TOKENS.iter().any(|token| text.contains(token)) {
        PriceType::Hourly
    } else if text.contains(RANGE_DASHES) || RANGE_WORD_RE.is_match(&text) {
        PriceType::Range
    } else {
        PriceType::Fixed
    };

    (Some(amount), kind)
}

/// Interpret a digit run with grouping and decimal separators.
///
/// With both `,` and `.` present the later one is the decimal mark. A single
/// separator kind is a thousands separator when it repeats or is followed by
/// exactly three digits, otherwise a decimal mark.
fn normalize_number(raw: &str) -> Option<f64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches(['.', ',']);
    if compact.is_empty() {
        return None;
    }

    let normalized = match compact.rfind(['.', ',']) {
        None => compact.to_string(),
        Some(index) => {
            let separator = compact[index..].chars().next()?;
            let tail = &compact[index + 1..];
            let mixed = compact.contains('.') && compact.contains(',');
            let repeated = compact.matches(separator).count() > 1;
            let decimal = mixed || (!repeated && tail.len() != 3);
            if decimal {
                let integer: String = compact[..index]
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect();
                format!("{integer}.{tail}")
            } else {
                compact.chars().filter(char::is_ascii_digit).collect()
            }
        }
    };

    normalized.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// First integer in the text with whitespace removed, or 0.
pub fn parse_count(raw: &str) -> u32 {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    INTEGER_RE
        .find(&compact)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(|value| value.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

/// Resolve a posting time relative to `now`.
///
/// Understands relative phrases ("5 минут назад", "2 hours ago", "вчера")
/// and absolute dates (`DD.MM.YYYY`, `YYYY-MM-DD`, `D <month> YYYY`), the
/// latter at midnight UTC unless a `HH:MM` time follows.
pub fn parse_posted_at(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = normalize_text(raw).to_lowercase();
    if text.is_empty() {
        return None;
    }

    if let Some(moment) = parse_relative(&text, now) {
        return Some(moment);
    }
    parse_absolute(&text)
}

fn parse_relative(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let amount = || {
        INTEGER_RE
            .find(text)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(1)
    };

    if contains_any(text, &["только что", "сейчас", "just now"]) {
        return Some(now);
    }
    if DOTTED_DATE_RE.is_match(text) || ISO_DATE_RE.is_match(text) || WORDY_DATE_RE.is_match(text) {
        return None;
    }
    // "сегодня" contains "дня" and "yesterday" contains "day".
    if contains_any(text, &["сегодня", "today"]) {
        return Some(at_clock(text, now));
    }
    if contains_any(text, &["вчера", "yesterday"]) {
        return Some(at_clock(text, now - Duration::days(1)));
    }
    if contains_any(text, &["мин", "min"]) {
        return Duration::try_minutes(amount()).and_then(|delta| now.checked_sub_signed(delta));
    }
    if contains_any(text, &["час", "hour"]) {
        return Duration::try_hours(amount()).and_then(|delta| now.checked_sub_signed(delta));
    }
    if contains_any(text, &["день", "дня", "дней", "day"]) {
        return Duration::try_days(amount()).and_then(|delta| now.checked_sub_signed(delta));
    }
    if contains_any(text, &["недел", "week"]) {
        return Duration::try_weeks(amount()).and_then(|delta| now.checked_sub_signed(delta));
    }
    None
}

/// `day` at the `HH:MM` found in `text`, or `day` unchanged.
fn at_clock(text: &str, day: DateTime<Utc>) -> DateTime<Utc> {
    clock(text)
        .map(|time| day.date_naive().and_time(time).and_utc())
        .unwrap_or(day)
}

fn clock(text: &str) -> Option<NaiveTime> {
    let caps = CLOCK_RE.captures(text)?;
    NaiveTime::from_hms_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, 0)
}

fn contains_any(text: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|token| text.contains(token))
}

fn parse_absolute(text: &str) -> Option<DateTime<Utc>> {
    let date = if let Some(caps) = DOTTED_DATE_RE.captures(text) {
        NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?)
    } else if let Some(caps) = ISO_DATE_RE.captures(text) {
        NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?)
    } else if let Some(caps) = WORDY_DATE_RE.captures(text) {
        let month = month_number(&caps[2])?;
        NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[1].parse().ok()?)
    } else {
        None
    }?;

    let time = clock(text).unwrap_or(NaiveTime::MIN);

    Some(date.and_time(time).and_utc())
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [(&[&str], u32); 12] = [
        (&["января", "январь", "jan", "january"], 1),
        (&["февраля", "февраль", "feb", "february"], 2),
        (&["марта", "март", "mar", "march"], 3),
        (&["апреля", "апрель", "apr", "april"], 4),
        (&["мая", "май", "may"], 5),
        (&["июня", "июнь", "jun", "june"], 6),
        (&["июля", "июль", "jul", "july"], 7),
        (&["августа", "август", "aug", "august"], 8),
        (&["сентября", "сентябрь", "sep", "sept", "september"], 9),
        (&["октября", "октябрь", "oct", "october"], 10),
        (&["ноября", "ноябрь", "nov", "november"], 11),
        (&["декабря", "декабрь", "dec", "december"], 12),
    ];
    let name = name.to_lowercase();
    MONTHS
        .iter()
        .find(|(names, _)| names.contains(&name.as_str()))
        .map(|(_, number)| *number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn fixed_prices_with_grouping() {
        assert_eq!(parse_price("50000 руб."), (Some(50_000.0), PriceType::Fixed));
        assert_eq!(parse_price("50 000 руб."), (Some(50_000.0), PriceType::Fixed));
        assert_eq!(parse_price("50\u{a0}000 ₽"), (Some(50_000.0), PriceType::Fixed));
        assert_eq!(parse_price("10,000"), (Some(10_000.0), PriceType::Fixed));
        assert_eq!(parse_price("1.234.567"), (Some(1_234_567.0), PriceType::Fixed));
    }

    #[test]
    fn decimal_separators() {
        assert_eq!(parse_price("1 500,50 руб"), (Some(1500.5), PriceType::Fixed));
        assert_eq!(parse_price("1,234.5"), (Some(1234.5), PriceType::Fixed));
        assert_eq!(parse_price("1.234,5"), (Some(1234.5), PriceType::Fixed));
        assert_eq!(parse_price("99.9"), (Some(99.9), PriceType::Fixed));
    }

    #[test]
    fn price_kinds() {
        assert_eq!(parse_price("от 10 000 до 20 000 руб"), (Some(10_000.0), PriceType::Range));
        assert_eq!(parse_price("5000 - 8000"), (Some(5000.0), PriceType::Range));
        assert_eq!(parse_price("1500 руб/час"), (Some(1500.0), PriceType::Hourly));
        assert_eq!(parse_price("$40 per hour"), (Some(40.0), PriceType::Hourly));
        assert_eq!(parse_price("5000 руб. за работу"), (Some(5000.0), PriceType::Fixed));
    }

    #[test]
    fn negotiable_and_empty_prices() {
        assert_eq!(parse_price("Договорная"), (None, PriceType::Negotiable));
        assert_eq!(parse_price("by agreement"), (None, PriceType::Negotiable));
        assert_eq!(parse_price("   "), (None, PriceType::Negotiable));
        assert_eq!(parse_price("бесплатно"), (None, PriceType::Negotiable));
        assert_eq!(parse_price("not a price"), (None, PriceType::Negotiable));
    }

    #[test]
    fn counts() {
        assert_eq!(parse_count("Предложений: 1 234"), 1234);
        assert_eq!(parse_count("12 views"), 12);
        assert_eq!(parse_count("нет"), 0);
        assert_eq!(parse_count("99999999999999"), u32::MAX);
    }

    #[test]
    fn relative_dates() {
        let now = now();
        assert_eq!(parse_posted_at("5 минут назад", now), Some(now - Duration::minutes(5)));
        assert_eq!(parse_posted_at("2 часа назад", now), Some(now - Duration::hours(2)));
        assert_eq!(parse_posted_at("3 дня назад", now), Some(now - Duration::days(3)));
        assert_eq!(parse_posted_at("час назад", now), Some(now - Duration::hours(1)));
        assert_eq!(parse_posted_at("Вчера", now), Some(now - Duration::days(1)));
        assert_eq!(parse_posted_at("сегодня", now), Some(now));
        assert_eq!(parse_posted_at("только что", now), Some(now));
        assert_eq!(parse_posted_at("2 weeks ago", now), Some(now - Duration::weeks(2)));
    }

    #[test]
    fn today_and_yesterday_keep_the_clock_time() {
        let now = now();
        assert_eq!(
            parse_posted_at("сегодня в 10:15", now),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 10, 15, 0).unwrap())
        );
        assert_eq!(
            parse_posted_at("вчера в 14:30", now),
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, 0).unwrap())
        );
        assert_eq!(
            parse_posted_at("Yesterday 09:05", now),
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 9, 5, 0).unwrap())
        );
    }

    #[test]
    fn absolute_dates_resolve_to_midnight_utc() {
        let midnight = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_posted_at("15.01.2024", now()), Some(midnight));
        assert_eq!(parse_posted_at("2024-01-15", now()), Some(midnight));
        assert_eq!(parse_posted_at("15 января 2024", now()), Some(midnight));
        assert_eq!(parse_posted_at("15 Jan 2024", now()), Some(midnight));
        assert_eq!(
            parse_posted_at("15.01.2024 14:30", now()),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap())
        );
    }

    #[test]
    fn unknown_dates_yield_none() {
        assert_eq!(parse_posted_at("", now()), None);
        assert_eq!(parse_posted_at("15 foo 2024", now()), None);
        assert_eq!(parse_posted_at("31.02.2024", now()), None);
        assert_eq!(parse_posted_at("когда-нибудь", now()), None);
    }

    #[test]
    fn normalizes_whitespace() {
        assert_eq!(normalize_text("  a\n\t b\u{a0}c  "), "a b c");
    }
}
