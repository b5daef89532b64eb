//! HTML extraction.
//!
//! Everything here is synchronous and works on owned input: `scraper`
//! documents are not `Send`, so they are parsed and dropped inside
//! [`parse_page`] and only owned [`ParsedPage`] values cross await points.

pub mod fields;
pub mod pagination;
pub mod selectors;
pub mod values;

pub use fields::{FieldExtractor, SkipReason};
pub use pagination::{PaginationCursor, ParsedPage, extract_cursor, parse_page, parse_page_at};
pub use selectors::{Candidate, FieldKey, SelectorError, SelectorResolver, SelectorSet};
pub use values::{normalize_text, parse_count, parse_posted_at, parse_price};
