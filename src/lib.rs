//! # tempmail-hub
//!
//! Async aggregator for disposable email providers.
//!
//! This crate provides a high-level, async API for:
//! - Provisioning disposable addresses across several third-party providers
//!   (mail.tm, GuerrillaMail, 1secmail, Snapmail), with collision-free prefixes
//! - Polling every mailbox with per-account rate-limit backoff
//! - Normalizing provider payloads into one [`Message`] model
//! - Extracting one-time verification codes from new mail
//!
//! ## Quick Start
//!
//! ```no_run
//! use tempmail_hub::{CreateAccount, HubConfig, MailHub};
//!
//! # async fn example() -> tempmail_hub::Result<()> {
//! let config = HubConfig::builder()
//!     .brand_prefix("kpay")
//!     .storage_dir("./data")
//!     .build()?;
//!
//! let hub = MailHub::start(config).await?;
//!
//! // kpay001@<domain>, kpay002@<domain>, ...
//! let account = hub.create_account(CreateAccount::new()).await?;
//!
//! // Or ask for a specific local-part; a taken one is renumbered.
//! let wanted = hub
//!     .create_account(CreateAccount::new().prefix("shop007"))
//!     .await?;
//!
//! hub.refresh_account(account.id()).await?;
//! for message in hub.messages(wanted.id()).await? {
//!     println!("{}: {}", message.from, message.subject);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Background Polling and Events
//!
//! ```no_run
//! use std::sync::Arc;
//! use tempmail_hub::{Event, HubConfig, MailHub, MemoryBackend, ProviderRegistry};
//! use tempmail_hub::providers::default_adapters;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> tempmail_hub::Result<()> {
//! let config = HubConfig::builder().build()?;
//! let registry = ProviderRegistry::builder()
//!     .register_many(default_adapters(&config)?)
//!     .build()?;
//!
//! let (events, mut rx) = mpsc::unbounded_channel();
//! let hub = MailHub::open(config, registry, Arc::new(MemoryBackend::new()), Arc::new(events)).await?;
//! let _poller = hub.spawn_poller(); // stops when dropped
//!
//! while let Some(event) = rx.recv().await {
//!     if let Event::VerificationCode { address, code, .. } = event {
//!         println!("{address}: {code}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Using a SOCKS5 Proxy
//!
//! ```no_run
//! use tempmail_hub::{HubConfig, Socks5Proxy};
//!
//! # fn example() -> tempmail_hub::Result<()> {
//! let config = HubConfig::builder()
//!     .proxy(Socks5Proxy::with_auth("proxy.example.com", 1080, "user", "pass"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Verification Codes
//!
//! ```
//! use tempmail_hub::extract_verification_code;
//!
//! assert_eq!(extract_verification_code("您的验证码：123456", "").as_deref(), Some("123456"));
//! assert_eq!(extract_verification_code("your code is 4821", "").as_deref(), Some("4821"));
//! assert_eq!(extract_verification_code("order #12 shipped", ""), None);
//! ```
//!
//! ## Error Handling
//!
//! Use [`Error::is_retryable`] to tell transient failures from permanent ones.
//! Provider fetch failures never surface from the polling engine; they are
//! logged and reported as a [`FetchOutcome`].
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation.
//!
//! ### Span Naming Convention
//!
//! - `MailHub::start` - Hub startup
//! - `MailHub::create_account` - Account creation
//! - `MailHub::delete_account` - Account deletion
//! - `PollingEngine::refresh_account` - One account fetch
//! - `PollingEngine::refresh_all` - Polling pass
//! - `PollingEngine::check_liveness` - Liveness pass
//! - `ProviderRegistry::check_all_liveness` - Concurrent provider probes
//! - `store::load` / `store::save` - Snapshot persistence
//!
//! ### Standard Fields
//!
//! - `account_id` - Account id
//! - `address` - Mailbox address
//! - `provider` - Provider key
//! - `delay_ms` - Backoff delay
//! - `new_messages` - Newly cached messages

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod account;
pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod matcher;
pub mod message;
pub mod normalize;
pub mod providers;
pub mod proxy;
pub mod registry;
pub mod store;

// Internal modules
mod hub;

#[cfg(test)]
mod test_support;

// Re-exports for ergonomic API
pub use account::{Account, AccountId, BackoffState};
pub use allocator::{AddressIndex, AllocationStrategy, PrefixAllocator};
pub use config::{HubConfig, HubConfigBuilder, PollingConfig, TimeoutConfig};
pub use email_address::EmailAddress;
pub use engine::{FetchOutcome, PollingEngine, SkipReason};
pub use error::{Error, ErrorCategory, FetchError, Result};
pub use events::{Event, EventSink, TracingSink};
pub use hub::{CreateAccount, MailHub, PollerGuard};
pub use matcher::{extract_verification_code, VerificationCodeMatcher};
pub use message::{Message, MessageId};
pub use providers::{CreatedMailbox, ProviderAdapter, ProviderKey};
pub use proxy::{ProxyAuth, Socks5Proxy};
pub use registry::{
    DomainEntry, ProviderRegistry, ProviderRegistryBuilder, ProviderStatus, ServiceState,
};
pub use store::{AccountStore, JsonFileBackend, MemoryBackend, PersistenceError, SnapshotBackend};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        // Ensure all public types are accessible
        let _ = HubConfig::builder();
        let _ = Socks5Proxy::new("localhost", 1080);
        let _ = CreateAccount::new().prefix("kpay007");
        let _ = ProviderRegistry::builder();
        let _ = MemoryBackend::new();
    }
}
