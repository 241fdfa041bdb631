//! Nasdaq API client.
//!
//! Nasdaq wraps every payload as `{"data": .., "status": {"rCode": ..}}` and
//! refuses requests that do not look like they come from its own web page, so
//! this client sends browser headers and treats `rCode != 200` or `data: null`
//! as a failed attempt.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

use crate::retrieve::ky_http::{ApiClient, ApiError};

pub const NASDAQ_BASE_URL: &str = "https://api.nasdaq.com/";

/// Attempts per call at the Nasdaq business level, on top of the transport
/// retries done by the middleware.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct NasdaqClient {
    client: ApiClient,
}

impl NasdaqClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(NASDAQ_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self {
            client: ApiClient::new(base_url, None)?,
        })
    }

    /// GETs `path` and returns its `data` object.
    ///
    /// Retries up to three times with a linear delay (1 s, 2 s) when the HTTP
    /// status is not 2xx or the envelope reports a failure.
    pub async fn fetch(&self, path: &str) -> Result<Value, ApiError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .request::<Value, ()>(Method::GET, path, Some(nasdaq_headers()), None)
                .await?;

            let failure = match response.data {
                Some(mut body) if response.success => {
                    let r_code = body["status"]["rCode"].as_i64().unwrap_or(-1);
                    let data = body["data"].take();
                    if r_code == 200 && !data.is_null() {
                        return Ok(data);
                    }
                    tracing::warn!(
                        path,
                        attempt,
                        r_code,
                        data_is_null = data.is_null(),
                        message = %body["message"],
                        "nasdaq api business error"
                    );
                    format!("nasdaq api returned rCode {r_code} for {path}")
                }
                _ => {
                    tracing::warn!(path, attempt, status = response.status, "nasdaq http request failed");
                    format!("nasdaq api answered {path} with http status {}", response.status)
                }
            };

            if attempt >= MAX_ATTEMPTS {
                tracing::error!(path, attempts = attempt, "nasdaq api unreachable or invalid");
                return Err(ApiError::Provider(failure));
            }
            tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
        }
    }
}

fn nasdaq_headers() -> HeaderMap {
    const HEADERS: [(&str, &str); 13] = [
        ("accept", "application/json, text/plain, */*"),
        ("accept-language", "en-US,en;q=0.9"),
        ("cache-control", "no-cache"),
        ("origin", "https://www.nasdaq.com"),
        ("pragma", "no-cache"),
        ("referer", "https://www.nasdaq.com/"),
        ("sec-ch-ua", "\"Google Chrome\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\""),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", "\"Windows\""),
        ("sec-fetch-dest", "empty"),
        ("sec-fetch-mode", "cors"),
        ("sec-fetch-site", "same-site"),
        (
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
        ),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in HEADERS {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_headers_are_all_valid() {
        let headers = nasdaq_headers();
        assert_eq!(headers.len(), 13);
        assert_eq!(headers["origin"], "https://www.nasdaq.com");
    }
}
