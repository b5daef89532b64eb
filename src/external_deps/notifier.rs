//! Notification collaborator.

use async_trait::async_trait;
use thiserror::Error;

use crate::listing::Listing;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notifier misconfigured: {0}")]
    Configuration(String),
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Delivers batches of new listings somewhere (chat, mail, queue).
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `true` when the whole batch was accepted.
    async fn send_batch(&self, listings: &[Listing]) -> Result<bool, NotifierError>;
}

/// Writes each listing to the `log` facade.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_batch(&self, listings: &[Listing]) -> Result<bool, NotifierError> {
        for listing in listings {
            let price = match listing.price {
                Some(amount) => format!("{amount} {}", listing.currency),
                None => listing.price_type.as_str().to_string(),
            };
            log::info!("[{}] {} ({price}) {}", listing.external_id, listing.title, listing.link);
        }
        Ok(true)
    }
}
