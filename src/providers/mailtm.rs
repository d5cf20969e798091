//! mail.tm adapter.
//!
//! Mailboxes are registered remotely with a random password; the JWT returned by
//! `/token` is the credential. Listings come from `/messages`, which only carries
//! the message intro, so that is what ends up in the text body.

use super::http::{self, Endpoint};
use super::{random_local_part, CreatedMailbox, ProviderAdapter, ProviderKey};
use crate::error::{Error, FetchError, Result};
use crate::message::Message;
use crate::normalize::{self, DateHint, RawMessage};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const LD_JSON: &str = "application/ld+json";

/// Adapter for <https://mail.tm>.
#[derive(Debug)]
pub struct MailTm {
    endpoint: Endpoint,
    domains: RwLock<Vec<String>>,
}

impl MailTm {
    /// Production API root.
    pub const BASE_URL: &'static str = "https://api.mail.tm";

    /// Creates the adapter against the production API.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            endpoint: Endpoint::new(client, Self::BASE_URL),
            domains: RwLock::new(Vec::new()),
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

    async fn load_domains(&self) -> std::result::Result<Vec<String>, reqwest::Error> {
        let listing: Collection<DomainDto> = self
            .endpoint
            .client
            .get(self.endpoint.url("/domains"))
            .header(ACCEPT, LD_JSON)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let domains: Vec<String> = listing
            .member
            .into_iter()
            .filter(|d| d.is_active)
            .map(|d| d.domain)
            .collect();

        self.domains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clone_from(&domains);
        Ok(domains)
    }

    fn rejected(&self, message: String) -> Error {
        Error::CreateMailbox {
            provider: ProviderKey::MAIL_TM,
            message,
        }
    }
}

#[async_trait]
impl ProviderAdapter for MailTm {
    fn key(&self) -> ProviderKey {
        ProviderKey::MAIL_TM
    }

    fn display_name(&self) -> &str {
        "Mail.tm"
    }

    fn domains(&self) -> Vec<String> {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[instrument(name = "MailTm::create_email", skip(self))]
    async fn create_email(&self, desired_prefix: Option<&str>) -> Result<CreatedMailbox> {
        let domains = self
            .load_domains()
            .await
            .map_err(http::request_failed(ProviderKey::MAIL_TM, "/domains"))?;
        let domain = domains
            .first()
            .ok_or_else(|| self.rejected("no active domain offered".to_string()))?;

        let prefix = desired_prefix.map_or_else(random_local_part, str::to_string);
        let address = format!("{prefix}@{domain}");
        let password = random_password();
        let credentials = Credentials {
            address: &address,
            password: &password,
        };

        let response = self
            .endpoint
            .client
            .post(self.endpoint.url("/accounts"))
            .header(ACCEPT, LD_JSON)
            .json(&credentials)
            .send()
            .await
            .map_err(http::request_failed(ProviderKey::MAIL_TM, "/accounts"))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(%address, "Address already registered");
                return Err(Error::PrefixTaken {
                    prefix,
                    provider: ProviderKey::MAIL_TM,
                });
            }
            status => return Err(self.rejected(format!("account registration returned {status}"))),
        }

        let token: TokenDto = self
            .endpoint
            .client
            .post(self.endpoint.url("/token"))
            .json(&credentials)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http::request_failed(ProviderKey::MAIL_TM, "/token"))?
            .json()
            .await
            .map_err(http::request_failed(ProviderKey::MAIL_TM, "/token"))?;

        Ok(CreatedMailbox::new(&prefix, domain, SecretString::from(token.token)))
    }

    #[instrument(name = "MailTm::fetch_messages", skip(self, credential))]
    async fn fetch_messages(
        &self,
        credential: &SecretString,
        address: &str,
    ) -> std::result::Result<Vec<Message>, FetchError> {
        let response = self
            .endpoint
            .client
            .get(self.endpoint.url("/messages"))
            .header(ACCEPT, LD_JSON)
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|e| http::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(self.endpoint.classify(&response));
        }

        let listing: Collection<MessageDto> = http::fetch_json(response).await?;
        Ok(listing
            .member
            .into_iter()
            .map(|dto| normalize::normalize(&ProviderKey::MAIL_TM, dto.into_raw()))
            .collect())
    }

    async fn check_liveness(&self) -> bool {
        match self.load_domains().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "mail.tm liveness probe failed");
                false
            }
        }
    }
}

fn random_password() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Credentials<'a> {
    address: &'a str,
    password: &'a str,
}

/// Hydra collection envelope. Newer API versions drop the `hydra:` prefix.
#[derive(Deserialize)]
struct Collection<T> {
    #[serde(rename = "hydra:member", alias = "member", default = "Vec::new")]
    member: Vec<T>,
}

#[derive(Deserialize)]
struct DomainDto {
    domain: String,
    #[serde(rename = "isActive", default = "active_by_default")]
    is_active: bool,
}

fn active_by_default() -> bool {
    true
}

#[derive(Deserialize)]
struct TokenDto {
    token: String,
}

#[derive(Deserialize)]
struct MessageDto {
    id: String,
    from: Option<AddressDto>,
    subject: Option<String>,
    intro: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct AddressDto {
    address: Option<String>,
}

impl MessageDto {
    fn into_raw(self) -> RawMessage {
        RawMessage {
            native_id: self.id,
            from: self.from.and_then(|f| f.address),
            subject: self.subject,
            date: self.created_at.map_or(DateHint::Missing, DateHint::Text),
            text: self.intro,
            html: None,
        }
    }
}
