//! HTTP plumbing shared by the API operation modules.

use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// Per-request timeout. Long-running operations on the control plane are
/// asynchronous (the API answers immediately and progresses in the
/// background), so a request that takes longer than this is stuck.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle to one provisioning API server.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    /// Create a client for the API at `base_url` (e.g.
    /// `https://provisioner.internal.example.com`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::InvalidBaseUrl(base_url));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::Build)?;

        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ClientError> {
        let url = self.url(path);
        tracing::debug!(?method, %url, "provisioning API request");
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::UnexpectedStatus { status, url, body })
    }

    async fn decode<T: DeserializeOwned>(url: String, response: Response) -> Result<T, ClientError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode { url, source })
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.send(Method::GET, path, None::<&()>).await?;
        Self::decode(self.url(path), response).await
    }

    /// GET that maps 404 to `None`, for lookups of resources that may have
    /// been deleted out from under the caller.
    pub(crate) async fn get_json_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, ClientError> {
        match self.send(Method::GET, path, None::<&()>).await {
            Ok(response) => Ok(Some(Self::decode(self.url(path), response).await?)),
            Err(ClientError::UnexpectedStatus { status, .. }) if status == StatusCode::NOT_FOUND => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ClientError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        Self::decode(self.url(path), response).await
    }

    pub(crate) async fn post_empty<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ClientError> {
        self.send(Method::POST, path, body).await?;
        Ok(())
    }

    /// POST returning the raw response body, for CLI exec surfaces whose
    /// output is plain text rather than JSON.
    pub(crate) async fn post_bytes(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<Vec<u8>, ClientError> {
        let url = self.url(path);
        let response = self.send(Method::POST, path, Some(body)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport { url, source })?;
        Ok(bytes.to_vec())
    }

    pub(crate) async fn patch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ClientError> {
        let response = self.send(Method::PATCH, path, Some(body)).await?;
        Self::decode(self.url(path), response).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<(), ClientError> {
        self.send(Method::DELETE, path, None::<&()>).await?;
        Ok(())
    }
}
