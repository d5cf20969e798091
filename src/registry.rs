//! Provider registry: adapters, liveness and creation routing.
//!
//! # Example
//!
//! ```no_run
//! use tempmail_hub::providers::{MailTm, OneSecMail};
//! use tempmail_hub::registry::ProviderRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> tempmail_hub::Result<()> {
//! let client = reqwest::Client::new();
//! let registry = ProviderRegistry::builder()
//!     .register(Arc::new(MailTm::new(client.clone())))
//!     .register(Arc::new(OneSecMail::new(client)))
//!     .build()?;
//!
//! registry.check_all_liveness().await;
//! let key = registry.select_for_creation();
//! println!("creating on {key}");
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::providers::{ProviderAdapter, ProviderKey, DEFAULT_PRIORITY};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default per-adapter liveness timeout.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of the last liveness check of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Never checked.
    #[default]
    Unknown,
    /// The probe succeeded.
    Active,
    /// The probe completed but reported the provider unusable.
    Inactive,
    /// The probe panicked or timed out.
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        })
    }
}

/// Status of one provider as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Provider key.
    pub provider_key: ProviderKey,
    /// Human-readable name.
    pub display_name: String,
    /// `true` only after a successful probe.
    pub is_active: bool,
    /// Detailed outcome of the last probe.
    #[serde(default)]
    pub state: ServiceState,
    /// When the last probe finished.
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Domains the provider can allocate under.
    #[serde(default)]
    pub supported_domains: Vec<String>,
}

impl ProviderStatus {
    fn unchecked(adapter: &dyn ProviderAdapter) -> Self {
        Self {
            provider_key: adapter.key(),
            display_name: adapter.display_name().to_string(),
            is_active: false,
            state: ServiceState::Unknown,
            last_checked_at: None,
            supported_domains: adapter.domains(),
        }
    }
}

/// A domain new accounts can be created under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEntry {
    /// The domain.
    pub domain: String,
    /// Provider serving it.
    pub provider_key: ProviderKey,
}

/// All adapters, keyed by [`ProviderKey`], with their last known status.
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    priority: Vec<ProviderKey>,
    statuses: RwLock<BTreeMap<ProviderKey, ProviderStatus>>,
    liveness_timeout: Duration,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("adapters", &self.keys())
            .field("priority", &self.priority)
            .field("liveness_timeout", &self.liveness_timeout)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Adapter registered under `key`.
    #[must_use]
    pub fn get(&self, key: &ProviderKey) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| &a.key() == key).cloned()
    }

    /// Registered keys in registration order.
    #[must_use]
    pub fn keys(&self) -> Vec<ProviderKey> {
        self.adapters.iter().map(|a| a.key()).collect()
    }

    /// Picks the provider for a new account.
    ///
    /// Active providers are tried in priority order, then any other active
    /// provider in registration order. If none is active the first configured
    /// provider is returned anyway, so the caller surfaces the adapter's own
    /// error instead of a generic one.
    #[must_use]
    pub fn select_for_creation(&self) -> ProviderKey {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        let is_active = |key: &ProviderKey| statuses.get(key).is_some_and(|s| s.is_active);

        self.ordered_keys()
            .into_iter()
            .find(|key| is_active(key))
            .or_else(|| self.ordered_keys().into_iter().next())
            // `build` rejects an empty registry.
            .unwrap_or_else(|| ProviderKey::MAIL_TM)
    }

    /// Snapshot of every provider's status.
    #[must_use]
    pub fn status(&self) -> BTreeMap<ProviderKey, ProviderStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies previously persisted statuses. Unknown keys are ignored.
    pub fn restore_statuses(&self, saved: BTreeMap<ProviderKey, ProviderStatus>) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        for (key, status) in saved {
            if let Some(current) = statuses.get_mut(&key) {
                current.is_active = status.is_active;
                current.state = status.state;
                current.last_checked_at = status.last_checked_at;
                if !status.supported_domains.is_empty() {
                    current.supported_domains = status.supported_domains;
                }
            }
        }
    }

    /// Domains of currently active providers, in selection order.
    #[must_use]
    pub fn active_domains(&self) -> Vec<DomainEntry> {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        self.ordered_keys()
            .into_iter()
            .filter_map(|key| statuses.get(&key).filter(|s| s.is_active))
            .flat_map(|status| {
                status.supported_domains.iter().map(|domain| DomainEntry {
                    domain: domain.clone(),
                    provider_key: status.provider_key.clone(),
                })
            })
            .collect()
    }

    /// Probes every adapter concurrently, each under the liveness timeout.
    ///
    /// A probe that panics or times out is recorded as [`ServiceState::Error`];
    /// it never affects the other probes.
    #[instrument(name = "ProviderRegistry::check_all_liveness", skip(self))]
    pub async fn check_all_liveness(&self) -> BTreeMap<ProviderKey, ProviderStatus> {
        let timeout = self.liveness_timeout;
        let probes = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            async move {
                let probe = Arc::clone(&adapter);
                let mut handle = tokio::spawn(async move { probe.check_liveness().await });

                let state = match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(true)) => ServiceState::Active,
                    Ok(Ok(false)) => ServiceState::Inactive,
                    Ok(Err(e)) => {
                        warn!(provider = %adapter.key(), error = %e, "Liveness probe failed");
                        ServiceState::Error
                    }
                    Err(_) => {
                        handle.abort();
                        warn!(provider = %adapter.key(), ?timeout, "Liveness probe timed out");
                        ServiceState::Error
                    }
                };

                ProviderStatus {
                    provider_key: adapter.key(),
                    display_name: adapter.display_name().to_string(),
                    is_active: state == ServiceState::Active,
                    state,
                    last_checked_at: Some(Utc::now()),
                    supported_domains: adapter.domains(),
                }
            }
        });
        let results = join_all(probes).await;

        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        for mut status in results {
            debug!(provider = %status.provider_key, state = %status.state, "Liveness checked");
            if let Some(previous) = statuses.get(&status.provider_key) {
                // Keep domains learned earlier when the probe could not refresh them.
                if status.supported_domains.is_empty() {
                    status.supported_domains.clone_from(&previous.supported_domains);
                }
            }
            statuses.insert(status.provider_key.clone(), status);
        }
        statuses.clone()
    }

    /// Priority keys that are registered, then the remaining registered keys.
    fn ordered_keys(&self) -> Vec<ProviderKey> {
        let registered = self.keys();
        let mut ordered: Vec<ProviderKey> = self
            .priority
            .iter()
            .filter(|key| registered.contains(key))
            .cloned()
            .collect();
        for key in registered {
            if !ordered.contains(&key) {
                ordered.push(key);
            }
        }
        ordered
    }
}

/// Builder for [`ProviderRegistry`].
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    priority: Option<Vec<ProviderKey>>,
    liveness_timeout: Option<Duration>,
}

impl ProviderRegistryBuilder {
    /// Registers an adapter. A later adapter with the same key replaces an earlier one.
    #[must_use]
    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let key = adapter.key();
        self.adapters.retain(|a| a.key() != key);
        self.adapters.push(adapter);
        self
    }

    /// Registers several adapters.
    #[must_use]
    pub fn register_many(self, adapters: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>) -> Self {
        adapters.into_iter().fold(self, Self::register)
    }

    /// Sets the creation priority. Defaults to [`DEFAULT_PRIORITY`].
    #[must_use]
    pub fn priority(mut self, keys: impl IntoIterator<Item = ProviderKey>) -> Self {
        self.priority = Some(keys.into_iter().collect());
        self
    }

    /// Sets the per-adapter liveness timeout.
    #[must_use]
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = Some(timeout);
        self
    }

    /// Builds the registry. Every provider starts as [`ServiceState::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoProviderAvailable`] if no adapter was registered.
    pub fn build(self) -> Result<ProviderRegistry> {
        if self.adapters.is_empty() {
            return Err(Error::NoProviderAvailable);
        }

        let statuses = self
            .adapters
            .iter()
            .map(|a| (a.key(), ProviderStatus::unchecked(a.as_ref())))
            .collect();

        Ok(ProviderRegistry {
            adapters: self.adapters,
            priority: self.priority.unwrap_or_else(|| DEFAULT_PRIORITY.to_vec()),
            statuses: RwLock::new(statuses),
            liveness_timeout: self.liveness_timeout.unwrap_or(DEFAULT_LIVENESS_TIMEOUT),
        })
    }
}
