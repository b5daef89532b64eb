//! HTTP transport seam.
//!
//! The executor talks to an [`HttpTransport`]; the default implementation is a
//! thin adapter over `reqwest::Client`. Tests and embedders can plug their own.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap as HttpHeaderMap;
use reqwest::{Client, header::HeaderMap};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Failures that happen before anything reaches the network are not
    /// worth repeating.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub url: Url,
    pub headers: HttpHeaderMap,
    pub body: Bytes,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url, headers: &HttpHeaderMap) -> Result<TransportResponse, TransportError>;
}

/// Timeouts applied by [`ReqwestTransport`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(30),
            connect: Duration::from_secs(10),
        }
    }
}

/// Reqwest-backed transport with a cookie store and transparent
/// decompression.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeouts: TransportTimeouts) -> Result<Self, TransportError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeouts.request)
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url, headers: &HttpHeaderMap) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .get(url.as_str())
            .headers(convert_headers(headers))
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        Ok(TransportResponse {
            status,
            url: final_url,
            headers,
            body,
        })
    }
}

fn convert_headers(headers: &HttpHeaderMap) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        map.append(name.clone(), value.clone());
    }
    map
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_builder() {
        TransportError::Request(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
