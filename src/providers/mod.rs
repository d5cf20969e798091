//! Third-party disposable mailbox providers.
//!
//! Every provider implements [`ProviderAdapter`]. The registry holds them as
//! `Arc<dyn ProviderAdapter>` keyed by [`ProviderKey`]; nothing outside this module
//! knows any provider's wire format.
//!
//! Built-in adapters:
//!
//! | Key             | Service        | Remote registration | Credential   |
//! |-----------------|----------------|---------------------|--------------|
//! | `mailtm`        | mail.tm        | yes                 | JWT          |
//! | `guerrillamail` | GuerrillaMail  | yes (session)       | `sid_token`  |
//! | `onesecmail`    | 1secmail       | no                  | the address  |
//! | `snapmail`      | Snapmail       | no                  | API key      |

use crate::config::HubConfig;
use crate::error::{FetchError, Result};
use crate::message::Message;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

mod guerrilla;
pub(crate) mod http;
mod mailtm;
mod onesecmail;
mod snapmail;

pub use guerrilla::GuerrillaMail;
pub use mailtm::MailTm;
pub use onesecmail::OneSecMail;
pub use snapmail::Snapmail;

/// Stable identifier of a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(Cow<'static, str>);

impl ProviderKey {
    /// mail.tm
    pub const MAIL_TM: ProviderKey = ProviderKey(Cow::Borrowed("mailtm"));
    /// GuerrillaMail
    pub const GUERRILLA_MAIL: ProviderKey = ProviderKey(Cow::Borrowed("guerrillamail"));
    /// 1secmail
    pub const ONE_SEC_MAIL: ProviderKey = ProviderKey(Cow::Borrowed("onesecmail"));
    /// Snapmail
    pub const SNAPMAIL: ProviderKey = ProviderKey(Cow::Borrowed("snapmail"));

    /// Creates a key for a custom adapter.
    pub fn new(key: impl Into<String>) -> Self {
        Self(Cow::Owned(key.into()))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reliability-first creation order: simplest and most stable remote contract first.
pub const DEFAULT_PRIORITY: [ProviderKey; 4] = [
    ProviderKey::MAIL_TM,
    ProviderKey::GUERRILLA_MAIL,
    ProviderKey::ONE_SEC_MAIL,
    ProviderKey::SNAPMAIL,
];

/// A mailbox allocated or bound by a provider.
#[derive(Debug, Clone)]
pub struct CreatedMailbox {
    /// Full address.
    pub address: String,
    /// Credential needed to fetch mail.
    pub credential: SecretString,
    /// Domain part of the address.
    pub domain: String,
    /// Local-part of the address.
    pub prefix: String,
}

impl CreatedMailbox {
    /// Builds a mailbox from a local-part and domain.
    pub fn new(prefix: &str, domain: &str, credential: SecretString) -> Self {
        Self {
            address: format!("{prefix}@{domain}"),
            credential,
            domain: domain.to_string(),
            prefix: prefix.to_string(),
        }
    }
}

/// Uniform capability set of a disposable mailbox provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key.
    fn key(&self) -> ProviderKey;

    /// Human-readable name.
    fn display_name(&self) -> &str;

    /// Domains the adapter can currently allocate under.
    fn domains(&self) -> Vec<String>;

    /// Allocates or binds a mailbox.
    ///
    /// A remote prefix collision must be reported as
    /// [`Error::PrefixTaken`](crate::Error::PrefixTaken) so the caller can retry with
    /// another candidate.
    async fn create_email(&self, desired_prefix: Option<&str>) -> Result<CreatedMailbox>;

    /// Returns every message the provider currently holds for the mailbox.
    ///
    /// An existing mailbox without mail may be reported as [`FetchError::NotFound`].
    async fn fetch_messages(
        &self,
        credential: &SecretString,
        address: &str,
    ) -> std::result::Result<Vec<Message>, FetchError>;

    /// Lightweight round-trip proving the provider is reachable.
    async fn check_liveness(&self) -> bool;
}

/// Builds the built-in adapters from configuration.
///
/// Snapmail is included only when an API key is configured.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built (e.g. an invalid proxy).
pub fn default_adapters(config: &HubConfig) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
    let client = http::build_client(config)?;

    let retry_after = config.polling.default_retry_after;

    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(MailTm::new(client.clone()).with_default_retry_after(retry_after)),
        Arc::new(GuerrillaMail::new(client.clone()).with_default_retry_after(retry_after)),
        Arc::new(OneSecMail::new(client.clone()).with_default_retry_after(retry_after)),
    ];
    if let Some(key) = &config.snapmail_api_key {
        adapters.push(Arc::new(
            Snapmail::new(client, key.clone()).with_default_retry_after(retry_after),
        ));
    }
    Ok(adapters)
}

/// Random local-part for adapters asked to create a mailbox without a prefix.
pub(crate) fn random_local_part() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// Splits `local@domain`, returning `None` when either side is empty.
pub(crate) fn split_address(address: &str) -> Option<(&str, &str)> {
    address
        .split_once('@')
        .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
}
