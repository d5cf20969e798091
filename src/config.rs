//! Configuration for the mail hub.
//!
//! Use [`HubConfigBuilder`] to create a configuration with sensible defaults:
//!
//! ```
//! use tempmail_hub::HubConfig;
//! use std::time::Duration;
//!
//! let config = HubConfig::builder()
//!     .brand_prefix("kpay")
//!     .storage_dir("./data")
//!     .min_fetch_interval(Duration::from_secs(20))
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.brand_prefix(), "kpay");
//! ```

use crate::allocator::AllocationStrategy;
use crate::error::{Error, Result};
use crate::proxy::Socks5Proxy;
use email_address::EmailAddress;
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the account snapshot inside the storage directory.
pub const ACCOUNTS_FILE: &str = "email_storage.json";
/// File name of the provider status snapshot inside the storage directory.
pub const STATUS_FILE: &str = "service_status.json";

/// Configuration for a [`MailHub`](crate::MailHub).
///
/// Create using [`HubConfig::builder()`].
#[derive(Clone)]
pub struct HubConfig {
    brand_prefix: String,
    /// Strategy used when a prefix collides.
    pub allocation_strategy: AllocationStrategy,
    /// Retries the prefix allocator may spend after its first candidate.
    pub max_allocation_attempts: u32,
    /// Optional SOCKS5 proxy for all provider traffic.
    pub proxy: Option<Socks5Proxy>,
    /// Snapmail API key. Snapmail is only registered when this is set.
    pub snapmail_api_key: Option<SecretString>,
    /// Directory for the account and status snapshots. In-memory when unset.
    pub storage_dir: Option<PathBuf>,
    /// User-Agent header sent to providers.
    pub user_agent: String,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Polling and backoff configuration.
    pub polling: PollingConfig,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("brand_prefix", &self.brand_prefix)
            .field("allocation_strategy", &self.allocation_strategy)
            .field("max_allocation_attempts", &self.max_allocation_attempts)
            .field("proxy", &self.proxy)
            .field(
                "snapmail_api_key",
                &self.snapmail_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("storage_dir", &self.storage_dir)
            .field("user_agent", &self.user_agent)
            .field("timeouts", &self.timeouts)
            .field("polling", &self.polling)
            .finish()
    }
}

impl HubConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::default()
    }

    /// Namespace tag used for generated prefixes (`kpay` → `kpay001`).
    #[must_use]
    pub fn brand_prefix(&self) -> &str {
        &self.brand_prefix
    }

    /// Path of the account snapshot, if persistence is configured.
    #[must_use]
    pub fn accounts_path(&self) -> Option<PathBuf> {
        self.storage_dir.as_deref().map(|dir| dir.join(ACCOUNTS_FILE))
    }

    /// Path of the provider status snapshot, if persistence is configured.
    #[must_use]
    pub fn status_path(&self) -> Option<PathBuf> {
        self.storage_dir.as_deref().map(|dir| dir.join(STATUS_FILE))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            brand_prefix: DEFAULT_BRAND_PREFIX.to_string(),
            allocation_strategy: AllocationStrategy::default(),
            max_allocation_attempts: DEFAULT_MAX_ALLOCATION_ATTEMPTS,
            proxy: None,
            snapmail_api_key: None,
            storage_dir: None,
            user_agent: default_user_agent(),
            timeouts: TimeoutConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

const DEFAULT_BRAND_PREFIX: &str = "kpay";
const DEFAULT_MAX_ALLOCATION_ATTEMPTS: u32 = 20;

fn default_user_agent() -> String {
    format!("tempmail-hub/{}", env!("CARGO_PKG_VERSION"))
}

/// Timeout configuration for provider calls.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for a single provider HTTP request and for a whole fetch.
    pub request: Duration,
    /// Timeout for one adapter's liveness check.
    pub liveness: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            liveness: Duration::from_secs(10),
        }
    }
}

/// Scheduling and backoff configuration for the polling engine.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval of the global scheduler tick.
    pub tick_interval: Duration,
    /// Minimum time between two fetch attempts of the same account.
    pub min_fetch_interval: Duration,
    /// Upper bound of a single backoff delay.
    pub max_backoff: Duration,
    /// Upper bound of the backoff step multiplier.
    pub max_backoff_step: u32,
    /// Retry-after used when a provider rate-limits without saying for how long.
    pub default_retry_after: Duration,
    /// Interval between provider liveness passes.
    pub liveness_interval: Duration,
    /// Accounts fetched in parallel during one polling pass.
    pub max_concurrent_fetches: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            min_fetch_interval: Duration::from_secs(15),
            max_backoff: Duration::from_secs(60),
            max_backoff_step: 8,
            default_retry_after: Duration::from_secs(10),
            liveness_interval: Duration::from_secs(300),
            max_concurrent_fetches: 4,
        }
    }
}

/// Validates the brand prefix: lowercase ASCII alphanumerics that form a valid local-part.
fn validate_brand_prefix(prefix: &str) -> Result<String> {
    let prefix = prefix.trim().to_lowercase();
    let well_formed = !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !well_formed || !EmailAddress::is_valid(&format!("{prefix}000@example.com")) {
        return Err(Error::InvalidConfig {
            message: format!("brand prefix '{prefix}' must be lowercase ASCII letters/digits"),
        });
    }
    Ok(prefix)
}

/// Builder for [`HubConfig`].
#[derive(Debug, Default)]
pub struct HubConfigBuilder {
    brand_prefix: Option<String>,
    allocation_strategy: Option<AllocationStrategy>,
    max_allocation_attempts: Option<u32>,
    proxy: Option<Socks5Proxy>,
    snapmail_api_key: Option<String>,
    storage_dir: Option<PathBuf>,
    user_agent: Option<String>,
    timeouts: Option<TimeoutConfig>,
    polling: Option<PollingConfig>,
}

impl HubConfigBuilder {
    /// Sets the namespace tag for generated prefixes (default `kpay`).
    #[must_use]
    pub fn brand_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.brand_prefix = Some(prefix.into());
        self
    }

    /// Sets the default collision strategy.
    #[must_use]
    pub fn allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = Some(strategy);
        self
    }

    /// Sets the prefix allocator's retry cap (default 20).
    #[must_use]
    pub fn max_allocation_attempts(mut self, attempts: u32) -> Self {
        self.max_allocation_attempts = Some(attempts);
        self
    }

    /// Routes provider traffic through a SOCKS5 proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: Socks5Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Sets the Snapmail API key, enabling the Snapmail provider.
    #[must_use]
    pub fn snapmail_api_key(mut self, key: impl Into<String>) -> Self {
        self.snapmail_api_key = Some(key.into());
        self
    }

    /// Persists accounts and provider status under this directory.
    #[must_use]
    pub fn storage_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.storage_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Overrides the User-Agent header.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the provider request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .request = timeout;
        self
    }

    /// Sets the per-adapter liveness timeout.
    #[must_use]
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .liveness = timeout;
        self
    }

    /// Sets polling configuration.
    #[must_use]
    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.polling = Some(polling);
        self
    }

    /// Sets the scheduler tick interval.
    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .tick_interval = interval;
        self
    }

    /// Sets the interval between provider liveness passes.
    #[must_use]
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .liveness_interval = interval;
        self
    }

    /// Sets the per-account minimum fetch interval.
    #[must_use]
    pub fn min_fetch_interval(mut self, interval: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .min_fetch_interval = interval;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a field is out of range.
    pub fn build(self) -> Result<HubConfig> {
        let brand_prefix = validate_brand_prefix(
            self.brand_prefix
                .as_deref()
                .unwrap_or(DEFAULT_BRAND_PREFIX),
        )?;

        let max_allocation_attempts = self
            .max_allocation_attempts
            .unwrap_or(DEFAULT_MAX_ALLOCATION_ATTEMPTS);
        if max_allocation_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "max_allocation_attempts must be at least 1".into(),
            });
        }

        let polling = self.polling.unwrap_or_default();
        if polling.tick_interval.is_zero() || polling.liveness_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "tick_interval and liveness_interval must be non-zero".into(),
            });
        }
        if polling.max_backoff_step == 0 || polling.max_concurrent_fetches == 0 {
            return Err(Error::InvalidConfig {
                message: "max_backoff_step and max_concurrent_fetches must be at least 1".into(),
            });
        }

        let snapmail_api_key = match self.snapmail_api_key {
            Some(key) if key.trim().is_empty() => {
                return Err(Error::InvalidConfig {
                    message: "snapmail api key is empty".into(),
                })
            }
            Some(key) => Some(SecretString::from(key)),
            None => None,
        };

        Ok(HubConfig {
            brand_prefix,
            allocation_strategy: self.allocation_strategy.unwrap_or_default(),
            max_allocation_attempts,
            proxy: self.proxy,
            snapmail_api_key,
            storage_dir: self.storage_dir,
            user_agent: self.user_agent.unwrap_or_else(default_user_agent),
            timeouts: self.timeouts.unwrap_or_default(),
            polling,
        })
    }
}
