//! Collaborators living outside the crawler.
//!
//! Storage and notification backends are reached through the traits defined
//! here; the crate ships in-memory and logging implementations.

pub mod notifier;
pub mod repository;

pub use notifier::{LogNotifier, Notifier, NotifierError};
pub use repository::{InMemoryRepository, ListingRepository, RecordId, RepositoryError};
