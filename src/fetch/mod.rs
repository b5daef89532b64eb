//! Network side of the crawler.

pub mod executor;
pub mod transport;

pub use executor::{FetchError, FetchExecutor, FetchedPage};
pub use transport::{HttpTransport, ReqwestTransport, TransportError, TransportResponse, TransportTimeouts};
