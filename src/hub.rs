//! The boundary API used by a CLI or HTTP layer.
//!
//! [`MailHub`] owns the provider registry, the account store, the prefix
//! allocator and the polling engine, and is the only place they are wired
//! together.
//!
//! # Example
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
//! let account = hub.create_account(CreateAccount::new()).await?;
//! println!("Created {}", account.address());
//!
//! let poller = hub.spawn_poller();
//! // ... later
//! poller.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::account::{Account, AccountId};
use crate::allocator::{AllocationStrategy, PrefixAllocator};
use crate::config::HubConfig;
use crate::engine::{FetchOutcome, PollingEngine};
use crate::error::{Error, Result};
use crate::events::{EventSink, TracingSink};
use crate::message::Message;
use crate::providers::{self, ProviderKey, DEFAULT_PRIORITY};
use crate::registry::{DomainEntry, ProviderRegistry, ProviderStatus};
use crate::store::{self, AccountStore, JsonFileBackend, MemoryBackend, SnapshotBackend};
use chrono::Utc;
use email_address::EmailAddress;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Parameters of [`MailHub::create_account`].
#[derive(Debug, Clone, Default)]
pub struct CreateAccount {
    /// Wanted local-part. The allocator picks one when absent or taken.
    pub desired_prefix: Option<String>,
    /// Collision strategy; the configured default when absent.
    pub strategy: Option<AllocationStrategy>,
    /// Preferred provider; the registry picks one when absent or unknown.
    pub provider: Option<ProviderKey>,
}

impl CreateAccount {
    /// A request with every choice left to the hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the wanted local-part.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.desired_prefix = Some(prefix.into());
        self
    }

    /// Sets the collision strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Sets the preferred provider.
    #[must_use]
    pub fn provider(mut self, provider: ProviderKey) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// Process-scoped state container for disposable mailboxes.
///
/// Create with [`MailHub::start`] for the built-in providers, or with
/// [`MailHub::open`] to supply the registry, persistence and event sink.
pub struct MailHub {
    config: HubConfig,
    registry: Arc<ProviderRegistry>,
    store: Arc<AccountStore>,
    engine: Arc<PollingEngine>,
    allocator: PrefixAllocator,
    creating: Mutex<()>,
}

impl std::fmt::Debug for MailHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailHub")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

impl MailHub {
    /// Starts a hub over the built-in providers.
    ///
    /// Loads the account snapshot (or starts in memory when no storage
    /// directory is configured), restores the last saved provider statuses,
    /// runs one liveness pass and logs events through [`TracingSink`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the snapshot
    /// cannot be read.
    #[instrument(
        name = "MailHub::start",
        skip_all,
        fields(
            brand = %config.brand_prefix(),
            storage = ?config.storage_dir,
            proxy_enabled = config.proxy.is_some()
        )
    )]
    pub async fn start(config: HubConfig) -> Result<Self> {
        let registry = ProviderRegistry::builder()
            .register_many(providers::default_adapters(&config)?)
            .priority(DEFAULT_PRIORITY)
            .liveness_timeout(config.timeouts.liveness)
            .build()?;

        let backend: Arc<dyn SnapshotBackend> = match config.accounts_path() {
            Some(path) => Arc::new(JsonFileBackend::new(path)),
            None => Arc::new(MemoryBackend::new()),
        };

        let hub = Self::open(config, registry, backend, Arc::new(TracingSink)).await?;
        hub.check_services().await;
        Ok(hub)
    }

    /// Opens a hub over an explicit registry, persistence backend and sink.
    ///
    /// No liveness pass is run; call [`check_services`](Self::check_services)
    /// when provider statuses are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the snapshot cannot be loaded.
    pub async fn open(
        config: HubConfig,
        registry: ProviderRegistry,
        backend: Arc<dyn SnapshotBackend>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let store = Arc::new(AccountStore::open(backend).await?);

        if let Some(path) = config.status_path() {
            match store::read_json_file::<BTreeMap<ProviderKey, ProviderStatus>>(&path).await {
                Ok(Some(saved)) => registry.restore_statuses(saved),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Ignoring unreadable provider status snapshot"),
            }
        }

        let allocator = PrefixAllocator::seeded(
            config.brand_prefix(),
            &store.address_index().await,
            config.max_allocation_attempts,
        );

        let registry = Arc::new(registry);
        let engine = Arc::new(PollingEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            sink,
            &config,
        ));

        info!(accounts = store.len().await, "Mail hub ready");
        Ok(Self {
            config,
            registry,
            store,
            engine,
            allocator,
            creating: Mutex::new(()),
        })
    }

    /// Creates an account on a provider.
    ///
    /// Candidates already bound locally are skipped; a candidate the provider
    /// rejects as taken is replaced by the next one. Both count against the
    /// same attempt cap.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPrefix`] for a malformed desired prefix
    /// - [`Error::AllocationExhausted`] when every candidate was taken
    /// - [`Error::Timeout`] when the adapter does not answer within the request timeout
    /// - provider errors from the adapter's mailbox creation
    /// - [`Error::Persistence`] if the new account could not be saved
    #[instrument(
        name = "MailHub::create_account",
        skip_all,
        fields(desired_prefix = ?request.desired_prefix, provider = ?request.provider)
    )]
    pub async fn create_account(&self, request: CreateAccount) -> Result<Account> {
        // One creation at a time: the local index must not change between check and insert.
        let _creating = self.creating.lock().await;

        let provider = match request.provider {
            Some(key) if self.registry.get(&key).is_some() => key,
            Some(key) => {
                let fallback = self.registry.select_for_creation();
                warn!(requested = %key, %fallback, "Unknown provider requested, falling back");
                fallback
            }
            None => self.registry.select_for_creation(),
        };
        let adapter = self
            .registry
            .get(&provider)
            .ok_or_else(|| Error::UnknownProvider {
                key: provider.to_string(),
            })?;

        let strategy = request.strategy.unwrap_or(self.config.allocation_strategy);
        let request_timeout = self.config.timeouts.request;
        let mut index = self.store.address_index().await;
        let mut candidates = self
            .allocator
            .candidates(request.desired_prefix.as_deref(), strategy)?;

        let mailbox = loop {
            let Some(candidate) = candidates.next() else {
                return Err(candidates.exhausted());
            };
            if index.is_taken(&candidate) {
                debug!(%candidate, "Prefix already bound locally");
                continue;
            }
            let created = timeout(request_timeout, adapter.create_email(Some(&candidate)))
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("{provider} create_email"),
                    timeout: request_timeout,
                })?;
            match created {
                Ok(mailbox) => break mailbox,
                Err(Error::PrefixTaken { .. }) => {
                    debug!(%candidate, %provider, "Prefix taken at provider");
                    // Random draws may repeat; never offer a rejected candidate twice.
                    index.insert_prefix(&candidate);
                }
                Err(e) => return Err(e),
            }
        };

        if !EmailAddress::is_valid(&mailbox.address) {
            return Err(Error::InvalidEmailFormat {
                email: mailbox.address,
            });
        }

        let account = Account::new(
            mailbox.address,
            mailbox.prefix,
            provider,
            mailbox.credential,
            Utc::now(),
        );
        self.store.insert(account.clone()).await?;

        info!(
            account_id = %account.id(),
            address = %account.address(),
            provider = %account.provider_key(),
            "Account created"
        );
        Ok(account)
    }

    /// Deletes an account and its cached messages.
    ///
    /// A fetch still in flight for the account is discarded when it returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown id and
    /// [`Error::Persistence`] if the deletion could not be saved.
    #[instrument(name = "MailHub::delete_account", skip(self), fields(account_id = %id))]
    pub async fn delete_account(&self, id: AccountId) -> Result<Account> {
        let removed = self.store.remove(id).await?.ok_or_else(|| not_found(id))?;
        self.engine.forget(id);
        info!(address = %removed.address(), "Account deleted");
        Ok(removed)
    }

    /// Fetches one account now, subject to its backoff and minimum interval.
    ///
    /// Returns the number of newly cached messages; zero when the fetch was
    /// skipped or failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown id and
    /// [`Error::Persistence`] if the result could not be saved.
    pub async fn refresh_account(&self, id: AccountId) -> Result<usize> {
        match self.engine.refresh_account(id).await? {
            FetchOutcome::Gone => Err(not_found(id)),
            outcome => Ok(outcome.new_messages()),
        }
    }

    /// Runs one polling pass over every account.
    ///
    /// Returns the total number of newly cached messages.
    pub async fn refresh_all(&self) -> usize {
        self.engine.refresh_all().await
    }

    /// Last known status of every provider.
    #[must_use]
    pub fn get_status(&self) -> BTreeMap<ProviderKey, ProviderStatus> {
        self.registry.status()
    }

    /// Runs a liveness pass now and returns the fresh statuses.
    pub async fn check_services(&self) -> BTreeMap<ProviderKey, ProviderStatus> {
        self.engine.check_liveness().await
    }

    /// Domains of the currently active providers.
    #[must_use]
    pub fn list_domains(&self) -> Vec<DomainEntry> {
        self.registry.active_domains()
    }

    /// All accounts, oldest first.
    pub async fn accounts(&self) -> Vec<Account> {
        self.store.list().await
    }

    /// One account, if it exists.
    pub async fn account(&self, id: AccountId) -> Option<Account> {
        self.store.get(id).await
    }

    /// Cached messages of an account, newest first.
    ///
    /// An account that was never fetched gets one gated refresh first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] for an unknown id and
    /// [`Error::Persistence`] if the refresh result could not be saved.
    pub async fn messages(&self, id: AccountId) -> Result<Vec<Message>> {
        let account = self.store.get(id).await.ok_or_else(|| not_found(id))?;
        if account.last_fetched_at().is_some() {
            return Ok(account.messages().to_vec());
        }

        if self.engine.refresh_account(id).await? == FetchOutcome::Gone {
            return Err(not_found(id));
        }
        self.store
            .get(id)
            .await
            .map(|account| account.messages().to_vec())
            .ok_or_else(|| not_found(id))
    }

    /// The polling engine, for callers that want per-fetch outcomes.
    #[must_use]
    pub fn engine(&self) -> &Arc<PollingEngine> {
        &self.engine
    }

    /// The configuration the hub was opened with.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Starts the background scheduler.
    ///
    /// Must be called inside a tokio runtime. The scheduler stops when the
    /// returned guard is dropped or [`PollerGuard::stop`] is awaited.
    #[must_use = "the poller stops when the guard is dropped"]
    pub fn spawn_poller(&self) -> PollerGuard {
        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.engine).run(signal));
        PollerGuard {
            shutdown,
            handle: Some(handle),
        }
    }
}

fn not_found(id: AccountId) -> Error {
    Error::AccountNotFound { id: id.to_string() }
}

/// Keeps the background scheduler alive.
///
/// Dropping the guard signals the scheduler to stop after its current pass.
pub struct PollerGuard {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PollerGuard {
    /// Stops the scheduler and waits for it to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Poller task ended abnormally");
            }
        }
    }

    /// Returns `true` while the scheduler task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for PollerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerGuard")
            .field("running", &self.is_running())
            .finish()
    }
}
