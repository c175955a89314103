//! HTTP client for one platform instance.
//!
//! Provides a wrapper around reqwest with:
//! - API-key authentication on every request
//! - Configurable timeouts (a longer one for image transfers)
//! - Status checking that preserves the HTTP status in the error

use crate::config::NetworkConfig;
use crate::{Result, SyncError};
use super::multipart::{self, MultipartPart};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::Form;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Build the URL of an API method, e.g. `teams.list`.
pub fn endpoint_url(address: &str, method: &str) -> Result<Url> {
    let base = if address.ends_with('/') {
        address.to_string()
    } else {
        format!("{}/", address)
    };
    let base = Url::parse(&base).map_err(|e| SyncError::Config {
        message: format!("Invalid instance address '{}': {}", address, e),
    })?;
    base.join(&format!("{}/{}", NetworkConfig::API_PREFIX, method))
        .map_err(|e| SyncError::Config {
            message: format!("Invalid API method '{}': {}", method, e),
        })
}

/// Authenticated HTTP client bound to one instance address.
pub struct HttpClient {
    client: Client,
    /// Client without a short total timeout for image bytes.
    transfer_client: Client,
    address: String,
    api_key: String,
    default_timeout: Duration,
}

impl HttpClient {
    /// Create a new client with the default timeout.
    pub fn new(address: &str, api_key: &str) -> Result<Self> {
        Self::with_timeout(address, api_key, NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a new client with a custom default timeout.
    pub fn with_timeout(address: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(SyncError::Connection {
                address: address.to_string(),
                message: "API key is empty".to_string(),
            });
        }
        // Fail early on malformed addresses.
        endpoint_url(address, "teams.list")?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| SyncError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let transfer_client = Client::builder()
            .timeout(NetworkConfig::TRANSFER_TIMEOUT)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| SyncError::Network {
                message: format!("Failed to create HTTP transfer client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            transfer_client,
            address: address.to_string(),
            api_key: api_key.to_string(),
            default_timeout: timeout,
        })
    }

    /// Instance address this client talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Call an API method with a JSON body and decode the JSON response.
    pub async fn call<B, T>(&self, method: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.post_json(method, body).await?;
        response.json::<T>().await.map_err(|e| SyncError::Json {
            message: format!("Failed to decode {} response: {}", method, e),
            source: None,
        })
    }

    /// Call an API method with a JSON body and return the raw response.
    pub async fn post_json<B: Serialize + ?Sized>(&self, method: &str, body: &B) -> Result<Response> {
        let url = endpoint_url(&self.address, method)?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .header(NetworkConfig::API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::send_error(method, e, self.default_timeout))?;

        self.check_response_status(response, method).await
    }

    /// Call an API method whose response is a file body.
    pub async fn download_bytes<B: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<Vec<u8>> {
        let url = endpoint_url(&self.address, method)?;
        debug!("POST {} (download)", url);

        let response = self
            .transfer_client
            .post(url)
            .header(NetworkConfig::API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::send_error(method, e, NetworkConfig::TRANSFER_TIMEOUT))?;

        let response = self.check_response_status(response, method).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::send_error(method, e, NetworkConfig::TRANSFER_TIMEOUT))?;
        Ok(bytes.to_vec())
    }

    /// Call an API method whose response is a multipart body with one named
    /// part per file.
    pub async fn download_parts<B: Serialize + ?Sized>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<Vec<MultipartPart>> {
        let url = endpoint_url(&self.address, method)?;
        debug!("POST {} (bulk download)", url);

        let response = self
            .transfer_client
            .post(url)
            .header(NetworkConfig::API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::send_error(method, e, NetworkConfig::TRANSFER_TIMEOUT))?;

        let response = self.check_response_status(response, method).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::send_error(method, e, NetworkConfig::TRANSFER_TIMEOUT))?;

        multipart::decode(&content_type, &bytes)
    }

    /// Send a multipart form to an API method.
    pub async fn post_multipart(&self, method: &str, form: Form) -> Result<Response> {
        let url = endpoint_url(&self.address, method)?;
        debug!("POST {} (multipart)", url);

        let response = self
            .transfer_client
            .post(url)
            .header(NetworkConfig::API_KEY_HEADER, &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::send_error(method, e, NetworkConfig::TRANSFER_TIMEOUT))?;

        self.check_response_status(response, method).await
    }

    /// Map a transport failure, reporting the timeout the request ran with.
    fn send_error(method: &str, err: reqwest::Error, timeout: Duration) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout {
                endpoint: method.to_string(),
                after: timeout,
            }
        } else {
            SyncError::Network {
                message: format!("POST {} failed: {}", method, err),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }

    async fn check_response_status(&self, response: Response, method: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or(body);

        Err(SyncError::Http {
            status: status.as_u16(),
            endpoint: method.to_string(),
            message,
        })
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("address", &self.address)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
