//! Snapmail adapter.
//!
//! Snapmail accepts mail for any local-part under `snapmail.cc` and exposes it
//! through one API-keyed filter endpoint, so creation is purely local. An
//! empty mailbox is reported by the service as a 404 with
//! `"Email was not found"`, and throttling sometimes arrives as a non-429 body
//! saying `"Please try again"`.

use super::http::{self, Endpoint};
use super::{random_local_part, split_address, CreatedMailbox, ProviderAdapter, ProviderKey};
use crate::error::{FetchError, Result};
use crate::message::Message;
use crate::normalize::{self, DateHint, RawMessage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const DOMAIN: &str = "snapmail.cc";
const PAGE_SIZE: u32 = 50;
const EMPTY_MAILBOX_MARKER: &str = "Email was not found";
const THROTTLE_MARKER: &str = "Please try again";

/// Adapter for <https://www.snapmail.cc>.
pub struct Snapmail {
    endpoint: Endpoint,
    api_key: SecretString,
}

impl fmt::Debug for Snapmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapmail")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl Snapmail {
    /// Production API root.
    pub const BASE_URL: &'static str = "https://www.snapmail.cc";

    /// Creates the adapter with the API key every request is signed with.
    #[must_use]
    pub fn new(client: Client, api_key: SecretString) -> Self {
        Self {
            endpoint: Endpoint::new(client, Self::BASE_URL),
            api_key,
        }
    }

    /// Points the adapter at another API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.endpoint = Endpoint::new(self.endpoint.client.clone(), base_url);
        self
    }

    /// Wait applied when a rate-limited response has no `Retry-After`.
    #[must_use]
    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.endpoint.default_retry_after = retry_after;
        self
    }

    async fn filter(&self, prefix: &str, count: u32) -> std::result::Result<Vec<MessageDto>, FetchError> {
        let request = FilterRequest {
            key: self.api_key.expose_secret(),
            email_address: prefix,
            is_prefix: true,
            page: 1,
            count,
        };

        let response = self
            .endpoint
            .client
            .post(self.endpoint.url("/emailList/filter"))
            .json(&request)
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;

        let status = response.status();
        let classified = self.endpoint.classify(&response);
        let body = response
            .text()
            .await
            .map_err(|e| http::transport_error(&e))?;

        classify_body(status, classified, &body, self.endpoint.default_retry_after)
    }
}

/// Interprets a filter response body, refining the status-based classification.
fn classify_body(
    status: StatusCode,
    by_status: FetchError,
    body: &str,
    default_retry_after: Duration,
) -> std::result::Result<Vec<MessageDto>, FetchError> {
    if status.is_success() {
        if let Ok(messages) = serde_json::from_str::<Vec<MessageDto>>(body) {
            return Ok(messages);
        }
    }

    if body.contains(THROTTLE_MARKER) {
        return Err(match by_status {
            limited @ FetchError::RateLimited { .. } => limited,
            _ => FetchError::RateLimited {
                retry_after: default_retry_after,
            },
        });
    }

    if status == StatusCode::NOT_FOUND && body.contains(EMPTY_MAILBOX_MARKER) {
        return Err(FetchError::NotFound);
    }

    if status.is_success() {
        debug!(body_len = body.len(), "Unexpected filter payload");
        return Err(FetchError::unavailable("malformed payload"));
    }
    Err(by_status)
}

#[async_trait]
impl ProviderAdapter for Snapmail {
    fn key(&self) -> ProviderKey {
        ProviderKey::SNAPMAIL
    }

    fn display_name(&self) -> &str {
        "Snapmail"
    }

    fn domains(&self) -> Vec<String> {
        vec![DOMAIN.to_string()]
    }

    #[instrument(name = "Snapmail::create_email", skip(self))]
    async fn create_email(&self, desired_prefix: Option<&str>) -> Result<CreatedMailbox> {
        let prefix = desired_prefix.map_or_else(random_local_part, str::to_string);
        Ok(CreatedMailbox::new(&prefix, DOMAIN, self.api_key.clone()))
    }

    /// Filters by local-part. The adapter's own key signs the request, so
    /// accounts keep working after a key rotation.
    #[instrument(name = "Snapmail::fetch_messages", skip(self, _credential))]
    async fn fetch_messages(
        &self,
        _credential: &SecretString,
        address: &str,
    ) -> std::result::Result<Vec<Message>, FetchError> {
        let prefix = split_address(address).map_or(address, |(local, _)| local);
        let listing = self.filter(prefix, PAGE_SIZE).await?;
        Ok(listing
            .into_iter()
            .map(|dto| normalize::normalize(&ProviderKey::SNAPMAIL, dto.into_raw()))
            .collect())
    }

    async fn check_liveness(&self) -> bool {
        match self.filter("test", 1).await {
            Ok(_) | Err(FetchError::NotFound) => true,
            Err(e) => {
                warn!(error = %e, "Snapmail liveness probe failed");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterRequest<'a> {
    key: &'a str,
    email_address: &'a str,
    is_prefix: bool,
    page: u32,
    count: u32,
}

#[derive(Deserialize)]
struct MessageDto {
    id: Value,
    #[serde(default)]
    from: Vec<SenderDto>,
    subject: Option<String>,
    #[serde(default)]
    date: Value,
    #[serde(default)]
    time: Value,
    text: Option<String>,
    html: Option<String>,
}

#[derive(Deserialize)]
struct SenderDto {
    address: Option<String>,
}

impl MessageDto {
    fn into_raw(self) -> RawMessage {
        let native_id = match self.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let date = match DateHint::from_json(&self.date) {
            DateHint::Missing => DateHint::from_json(&self.time),
            hint => hint,
        };
        RawMessage {
            native_id,
            from: self.from.into_iter().find_map(|s| s.address),
            subject: self.subject,
            date,
            text: self.text,
            html: self.html,
        }
    }
}
