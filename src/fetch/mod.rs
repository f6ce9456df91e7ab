// src/fetch/mod.rs
// =============================================================================
// The fetch capability: one asynchronous HTTP exchange.
//
// Everything that touches the network goes through the `Fetcher` trait, so
// the checker can be driven by the real HTTP client (see http.rs) or by a
// scripted fetcher in tests.
//
// An exchange yields, in order:
// 1. the status line and response headers (ResponseStream)
// 2. zero or more body chunks
// 3. optionally the trailers
// or a FetchError at any point.
// =============================================================================

mod http;

pub use http::HttpFetcher;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One header field, name and value, in the order it appeared on the wire.
pub type HeaderField = (String, String);

/// Why an exchange failed.
///
/// The variants mirror the failure modes a link checker cares about: a slow
/// server, a name that doesn't resolve, a TLS problem, or a broken message.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("could not resolve hostname: {0}")]
    Dns(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Other(String),
}

/// The request half of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<HeaderField>,
}

impl ExchangeRequest {
    pub fn get(uri: impl Into<String>, headers: Vec<HeaderField>) -> Self {
        Self {
            method: "GET".to_string(),
            uri: uri.into(),
            headers,
        }
    }

    /// Approximate bytes this request puts on the wire (request line plus
    /// header block).
    pub fn wire_size(&self) -> u64 {
        let request_line = self.method.len() + self.uri.len() + " HTTP/1.1\r\n".len() + 1;
        (request_line + header_block_size(&self.headers)) as u64
    }
}

/// Events that follow the response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Chunk(Vec<u8>),
    // reqwest doesn't surface trailers, so only other fetchers produce these
    #[allow(dead_code)]
    Trailers(Vec<HeaderField>),
}

/// The response head plus the rest of the exchange as a stream.
pub struct ResponseStream {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<HeaderField>,
    pub events: BoxStream<'static, Result<BodyEvent, FetchError>>,
}

impl ResponseStream {
    /// Approximate bytes of the status line and header block.
    pub fn head_size(&self) -> u64 {
        let status_line = "HTTP/1.1 000 \r\n".len() + self.reason.len();
        (status_line + header_block_size(&self.headers)) as u64
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs HTTP exchanges.
///
/// Retry policy, if any, belongs to implementations of this trait; the
/// checker itself never retries.
#[allow(async_fn_in_trait)]
pub trait Fetcher {
    async fn fetch(&self, request: &ExchangeRequest) -> Result<ResponseStream, FetchError>;
}

/// Bytes taken by a header block: "name: value\r\n" per field plus the
/// terminating blank line.
pub fn header_block_size(headers: &[HeaderField]) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.len() + value.len() + 4)
        .sum::<usize>()
        + 2
}

pub fn find_header<'a>(headers: &'a [HeaderField], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
