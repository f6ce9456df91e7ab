// src/fetch/http.rs
// =============================================================================
// The default fetch capability, backed by reqwest.
//
// Key functionality:
// - Sends exactly the request it is given (no redirect following: a 3xx is
//   something to analyze, not something to chase)
// - Streams the body back chunk by chunk instead of buffering it
// - Sorts reqwest's errors into FetchError categories (timeout, DNS, TLS...)
//
// reqwest doesn't surface HTTP trailers, so this fetcher never emits
// BodyEvent::Trailers.
// =============================================================================

use super::{BodyEvent, ExchangeRequest, FetchError, Fetcher, ResponseStream};
use futures::stream::StreamExt;
use reqwest::{Client, Method};
use std::time::Duration;

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    // Builds a client with a per-exchange timeout.
    //
    // The timeout covers the whole exchange including the body; the overall
    // check has its own, longer deadline on top of this.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &ExchangeRequest) -> Result<ResponseStream, FetchError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::Protocol(format!("bad method {}: {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.uri);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(categorize_error)?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let events = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| BodyEvent::Chunk(bytes.to_vec()))
                    .map_err(categorize_error)
            })
            .boxed();

        Ok(ResponseStream {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            events,
        })
    }
}

// Categorizes different error types from reqwest
//
// reqwest errors can happen for many reasons:
// - Network timeout
// - DNS resolution failure
// - SSL certificate issues
// - Too many redirects
// - A malformed message from the server
fn categorize_error(error: reqwest::Error) -> FetchError {
    // Convert error to string once; the source chain carries the useful detail
    let error_string = full_error_chain(&error);
    let lowered = error_string.to_lowercase();

    if error.is_timeout() {
        FetchError::Timeout
    } else if error.is_redirect() {
        FetchError::TooManyRedirects
    } else if error.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            FetchError::Dns(error_string)
        } else if lowered.contains("certificate") || lowered.contains("tls") {
            FetchError::Tls(error_string)
        } else {
            FetchError::Connect(error_string)
        }
    } else if lowered.contains("certificate") || lowered.contains("ssl") {
        FetchError::Tls(error_string)
    } else if error.is_body() || error.is_decode() {
        FetchError::Protocol(error_string)
    } else {
        FetchError::Other(error_string)
    }
}

fn full_error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}
