//! Error type shared by every provisioning API operation.

use thiserror::Error;

/// Failure modes of a provisioning API call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The base URL handed to [`crate::Client::new`] could not be parsed.
    #[error("invalid provisioning API base URL {0:?}")]
    InvalidBaseUrl(String),

    /// The underlying HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    /// The request never produced an HTTP response (connect failure,
    /// timeout, TLS error).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with a status outside 2xx.
    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        url: String,
        body: String,
    },

    /// The response body did not decode into the expected type.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}
