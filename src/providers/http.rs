//! Shared HTTP plumbing for provider adapters.

use super::ProviderKey;
use crate::config::HubConfig;
use crate::error::{Error, FetchError, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Builds the client every built-in adapter shares.
pub(crate) fn build_client(config: &HubConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(config.timeouts.request)
        .connect_timeout(config.timeouts.request)
        .user_agent(config.user_agent.clone());

    if let Some(proxy) = &config.proxy {
        let proxy = proxy.to_reqwest().map_err(|source| Error::InvalidConfig {
            message: format!("invalid proxy {proxy}: {source}"),
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|source| Error::InvalidConfig {
        message: format!("cannot build HTTP client: {source}"),
    })
}

/// Reads `Retry-After` as delay-seconds. HTTP-date values are not supported.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Classifies a non-success fetch response.
pub(crate) fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    default_retry_after: Duration,
) -> FetchError {
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after: retry_after(headers).unwrap_or(default_retry_after),
        },
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::fatal(format!("provider rejected request: {status}"))
        }
        status => FetchError::unavailable(format!("unexpected status {status}")),
    }
}

/// Maps a transport failure onto the fetch taxonomy.
pub(crate) fn transport_error(error: &reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::fatal(error.to_string())
    } else {
        FetchError::unavailable(error.to_string())
    }
}

/// Wraps a transport failure outside the fetch path as [`Error::Http`].
pub(crate) fn request_failed(
    provider: ProviderKey,
    endpoint: &'static str,
) -> impl FnOnce(reqwest::Error) -> Error {
    move |source| Error::Http {
        provider,
        endpoint: endpoint.to_string(),
        source,
    }
}

/// Decodes a successful fetch response body.
pub(crate) async fn fetch_json<T: DeserializeOwned>(response: Response) -> std::result::Result<T, FetchError> {
    response.json::<T>().await.map_err(|e| {
        debug!(error = %e, "Malformed provider payload");
        FetchError::unavailable(format!("malformed payload: {e}"))
    })
}

/// Default retry-after when a fetch is rate limited without a header.
pub(crate) const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

/// Client, base URL and rate-limit fallback of one adapter.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) default_retry_after: Duration,
}

impl Endpoint {
    pub(crate) fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    /// Joins a path onto the base URL.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn classify(&self, response: &Response) -> FetchError {
        classify_status(response.status(), response.headers(), self.default_retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        let headers = HeaderMap::new();
        let fallback = Duration::from_secs(10);

        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &headers, fallback),
            FetchError::NotFound
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, fallback),
            FetchError::RateLimited {
                retry_after: fallback
            }
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &headers, fallback),
            FetchError::Fatal { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &headers, fallback),
            FetchError::Unavailable { .. }
        ));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(42)));

        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, Duration::from_secs(1)),
            FetchError::RateLimited {
                retry_after: Duration::from_secs(42)
            }
        );

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_endpoint_url_joining() {
        let endpoint = Endpoint::new(Client::new(), "https://api.mail.tm/");
        assert_eq!(endpoint.url("/domains"), "https://api.mail.tm/domains");
        assert_eq!(endpoint.url("token"), "https://api.mail.tm/token");
    }

    #[test]
    fn test_build_client_with_proxy() {
        let config = HubConfig::builder()
            .proxy(crate::Socks5Proxy::new("127.0.0.1", 1080))
            .build()
            .unwrap();
        assert!(build_client(&config).is_ok());
    }
}
