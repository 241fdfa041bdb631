//! # HTTP Retrieval Utilities
//!
//! An asynchronous JSON client around `reqwest`, with `reqwest-retry` middleware
//! retrying transient failures (connect errors, 5xx, 429) with exponential
//! backoff. Non-success statuses are returned, not raised, so callers can apply
//! provider-specific rules.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use url::Url;

/// Transient retries performed by the middleware for every request.
const TRANSIENT_RETRIES: u32 = 3;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid base url {url:?}: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("cannot join {path:?} onto the base url: {source}")]
    Path {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),
    #[error("response body error: {0}")]
    Body(#[from] reqwest::Error),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    /// A provider answered, but not with usable data.
    #[error("{0}")]
    Provider(String),
}

/// A response together with its HTTP metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a 2xx response.
    pub data: Option<T>,
    /// Raw body of a non-2xx response.
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
    pub headers: HeaderMap,
}

/// # API Client
///
/// Joins relative paths onto a base URL, injects an optional bearer token and
/// decodes JSON responses.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client for `base_url`, which must be absolute.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url).map_err(|source| ApiError::BaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ApiError::Build)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(TRANSIENT_RETRIES);
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            base_url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends one request and decodes a 2xx body as `T`.
    ///
    /// # Errors
    /// Path joining, transport and body decoding failures. A non-2xx status is
    /// not an error; it is reported through [`ApiResponse::success`].
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let url = self.base_url.join(path).map_err(|source| ApiError::Path {
            path: path.to_string(),
            source,
        })?;
        let mut req = self.inner.request(method, url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, "application/json").body(serde_json::to_string(&b)?);
        }

        let response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            Ok(ApiResponse {
                data: None,
                error_body: response.text().await.ok(),
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_base_url_is_rejected() {
        assert!(matches!(
            ApiClient::new("api/market-info", None),
            Err(ApiError::BaseUrl { .. })
        ));
    }

    #[test]
    fn test_paths_join_onto_base() {
        let client = ApiClient::new("https://api.nasdaq.com/", None).unwrap();
        let joined = client.base_url().join("api/market-info").unwrap();
        assert_eq!(joined.as_str(), "https://api.nasdaq.com/api/market-info");
    }
}
