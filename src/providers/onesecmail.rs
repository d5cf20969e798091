//! 1secmail adapter.
//!
//! 1secmail needs no registration: any local-part under its domains receives
//! mail, and the address itself is the credential.

use super::http::{self, Endpoint};
use super::{random_local_part, split_address, CreatedMailbox, ProviderAdapter, ProviderKey};
use crate::error::{FetchError, Result};
use crate::message::Message;
use crate::normalize::{self, DateHint, RawMessage};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{instrument, warn};

const DOMAINS: [&str; 7] = [
    "1secmail.com",
    "1secmail.org",
    "1secmail.net",
    "wwjmp.com",
    "esiix.com",
    "oosln.com",
    "vddaz.com",
];

/// Adapter for <https://www.1secmail.com>.
#[derive(Debug)]
pub struct OneSecMail {
    endpoint: Endpoint,
}

impl OneSecMail {
    /// Production API root.
    pub const BASE_URL: &'static str = "https://www.1secmail.com/api/v1/";

    /// Creates the adapter against the production API.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            endpoint: Endpoint::new(client, Self::BASE_URL),
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

    async fn call<T: DeserializeOwned>(&self, query: &[(&str, &str)]) -> std::result::Result<T, FetchError> {
        let response = self
            .endpoint
            .client
            .get(self.endpoint.url("/"))
            .query(query)
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(self.endpoint.classify(&response));
        }
        http::fetch_json(response).await
    }
}

#[async_trait]
impl ProviderAdapter for OneSecMail {
    fn key(&self) -> ProviderKey {
        ProviderKey::ONE_SEC_MAIL
    }

    fn display_name(&self) -> &str {
        "1secmail"
    }

    fn domains(&self) -> Vec<String> {
        DOMAINS.iter().map(ToString::to_string).collect()
    }

    #[instrument(name = "OneSecMail::create_email", skip(self))]
    async fn create_email(&self, desired_prefix: Option<&str>) -> Result<CreatedMailbox> {
        let prefix = desired_prefix.map_or_else(random_local_part, str::to_string);
        let address = format!("{prefix}@{}", DOMAINS[0]);
        Ok(CreatedMailbox::new(&prefix, DOMAINS[0], SecretString::from(address)))
    }

    #[instrument(name = "OneSecMail::fetch_messages", skip(self, credential))]
    async fn fetch_messages(
        &self,
        credential: &SecretString,
        address: &str,
    ) -> std::result::Result<Vec<Message>, FetchError> {
        let bound = credential.expose_secret();
        let bound = if bound.is_empty() { address } else { bound };
        let (login, domain) =
            split_address(bound).ok_or_else(|| FetchError::fatal(format!("not an address: {bound}")))?;

        let listing: Vec<ListItemDto> = self
            .call(&[("action", "getMessages"), ("login", login), ("domain", domain)])
            .await?;

        let mut messages = Vec::with_capacity(listing.len());
        for item in listing {
            let id = match &item.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let read: std::result::Result<MessageDto, FetchError> = self
                .call(&[
                    ("action", "readMessage"),
                    ("login", login),
                    ("domain", domain),
                    ("id", id.as_str()),
                ])
                .await;
            match read {
                Ok(detail) => messages.push(normalize::normalize(
                    &ProviderKey::ONE_SEC_MAIL,
                    detail.into_raw(id),
                )),
                Err(e @ FetchError::RateLimited { .. }) => return Err(e),
                Err(e) => warn!(%id, error = %e, "Skipping unreadable message"),
            }
        }
        Ok(messages)
    }

    async fn check_liveness(&self) -> bool {
        let probe: std::result::Result<Vec<ListItemDto>, FetchError> = self
            .call(&[("action", "getMessages"), ("login", "test"), ("domain", DOMAINS[0])])
            .await;
        match probe {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "1secmail liveness probe failed");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListItemDto {
    id: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    from: Option<String>,
    subject: Option<String>,
    date: Option<String>,
    text_body: Option<String>,
    body: Option<String>,
    html_body: Option<String>,
}

impl MessageDto {
    fn into_raw(self, native_id: String) -> RawMessage {
        RawMessage {
            native_id,
            from: self.from,
            subject: self.subject,
            date: self.date.map_or(DateHint::Missing, DateHint::Text),
            text: self.text_body.or(self.body),
            html: self.html_body,
        }
    }
}
