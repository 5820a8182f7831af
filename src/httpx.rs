//! Thin typed wrappers around `reqwest` shared by all upstream fetchers.
//!
//! One attempt per refresh, finite timeout, typed failure. Providers decide
//! what to do with the error (usually: keep the last good snapshot).

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("eos-connect/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid payload: {0}")]
    Decode(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::Status(_) => "status",
            Self::Decode(_) => "decode",
            Self::MissingField(_) => "missing_field",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Builds a client with the per-provider timeout baked in. Construction only
/// fails on broken TLS setups, surface that at boot instead of per request.
pub fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))
}

pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T, FetchError> {
    get_json_with_headers(client, url, HeaderMap::new()).await
}

pub async fn get_json_with_headers<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
) -> Result<T, FetchError> {
    let response = client.get(url).headers(headers).send().await?;
    decode(response).await
}

pub async fn post_json<T: DeserializeOwned, B: serde::Serialize>(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &B,
) -> Result<T, FetchError> {
    let response = client.post(url).headers(headers).json(body).send().await?;
    decode(response).await
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, FetchError> {
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
}
