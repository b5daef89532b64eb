//! Persistence collaborator.
//!
//! The crawler only needs three operations from storage; the actual backend
//! lives outside this crate. [`InMemoryRepository`] is a reference
//! implementation for tests and small embeddings.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::listing::{Listing, ListingStatus};

pub type RecordId = i64;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("repository error: {0}")]
    Other(String),
}

#[async_trait]
pub trait ListingRepository: Send + Sync {
    async fn exists_project(&self, external_id: &str) -> Result<bool, RepositoryError>;

    /// Store a listing and return its record id. Storing an external id that
    /// already exists returns the existing id.
    async fn create_project(&self, listing: &Listing) -> Result<RecordId, RepositoryError>;

    /// Returns whether the record was found and updated.
    async fn mark_sent(&self, id: RecordId) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Default)]
struct Store {
    next_id: RecordId,
    by_external: HashMap<String, RecordId>,
    records: BTreeMap<RecordId, Listing>,
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    store: Mutex<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository pre-populated with already known listings.
    pub async fn seeded(listings: impl IntoIterator<Item = Listing>) -> Self {
        let repository = Self::new();
        for listing in listings {
            // The in-memory store cannot fail.
            let _ = repository.create_project(&listing).await;
        }
        repository
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: RecordId) -> Option<Listing> {
        self.store.lock().await.records.get(&id).cloned()
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.store.lock().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl ListingRepository for InMemoryRepository {
    async fn exists_project(&self, external_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.store.lock().await.by_external.contains_key(external_id))
    }

    async fn create_project(&self, listing: &Listing) -> Result<RecordId, RepositoryError> {
        let mut store = self.store.lock().await;
        if let Some(id) = store.by_external.get(&listing.external_id) {
            return Ok(*id);
        }
        store.next_id += 1;
        let id = store.next_id;
        store.by_external.insert(listing.external_id.clone(), id);
        store.records.insert(id, listing.clone());
        log::debug!("stored listing {} as record {id}", listing.external_id);
        Ok(id)
    }

    async fn mark_sent(&self, id: RecordId) -> Result<bool, RepositoryError> {
        let mut store = self.store.lock().await;
        match store.records.get_mut(&id) {
            Some(listing) => {
                listing.status = ListingStatus::Sent;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
