//! Polling engine: per-account fetch scheduling, backoff and cache refresh.
//!
//! Each account moves through `Idle → Fetching → (Idle | Backoff)`. Before a
//! fetch starts, two gates apply: an active backoff window, and the minimum
//! interval since the last attempt. Both scheduled passes and on-demand
//! refreshes go through [`PollingEngine::refresh_account`], so neither path can
//! push a provider past its rate limit.
//!
//! Fetch results are merged only if the account still exists when the
//! provider answers. A deleted account's in-flight result is dropped.

use crate::account::AccountId;
use crate::config::{HubConfig, PollingConfig};
use crate::error::FetchError;
use crate::events::{Event, EventSink};
use crate::matcher::VerificationCodeMatcher;
use crate::message::Message;
use crate::registry::{ProviderRegistry, ProviderStatus};
use crate::providers::ProviderKey;
use crate::store::{self, AccountStore, PersistenceError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Why a fetch was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A rate-limit backoff is in effect until the given time.
    BackoffActive {
        /// Earliest time the next fetch may start.
        until: DateTime<Utc>,
    },
    /// The previous attempt was less than the minimum interval ago.
    TooSoon {
        /// Earliest time the next fetch may start.
        next_at: DateTime<Utc>,
    },
    /// Another fetch of the same account is running.
    InFlight,
}

/// Result of one refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The provider answered; `new` messages were added to the cache.
    Fetched {
        /// Newly cached messages.
        new: usize,
    },
    /// No fetch was attempted.
    Skipped(SkipReason),
    /// The provider rate-limited the fetch; fetching is suspended for `delay`.
    RateLimited {
        /// Suspension applied.
        delay: Duration,
    },
    /// The fetch failed without affecting backoff.
    Failed(FetchError),
    /// The account does not exist (anymore).
    Gone,
}

impl FetchOutcome {
    /// Newly cached messages, zero for anything but [`FetchOutcome::Fetched`].
    #[must_use]
    pub fn new_messages(&self) -> usize {
        match self {
            Self::Fetched { new } => *new,
            _ => 0,
        }
    }
}

/// Drives fetches for every account in an [`AccountStore`].
pub struct PollingEngine {
    registry: Arc<ProviderRegistry>,
    store: Arc<AccountStore>,
    sink: Arc<dyn EventSink>,
    matcher: VerificationCodeMatcher,
    policy: PollingConfig,
    fetch_timeout: Duration,
    status_path: Option<PathBuf>,
    locks: StdMutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for PollingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingEngine")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl PollingEngine {
    /// Creates an engine over a registry and store.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<AccountStore>,
        sink: Arc<dyn EventSink>,
        config: &HubConfig,
    ) -> Self {
        Self {
            registry,
            store,
            sink,
            matcher: VerificationCodeMatcher::new(),
            policy: config.polling.clone(),
            fetch_timeout: config.timeouts.request,
            status_path: config.status_path(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// The registry the engine fetches through.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The store the engine merges into.
    #[must_use]
    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    /// Fetches one account if its gates allow it.
    ///
    /// Provider failures are reported in the outcome, never as an error.
    ///
    /// # Errors
    ///
    /// Returns a [`PersistenceError`] if the account state could not be saved.
    pub async fn refresh_account(&self, id: AccountId) -> Result<FetchOutcome, PersistenceError> {
        self.refresh_account_at(id, Utc::now()).await
    }

    #[instrument(name = "PollingEngine::refresh_account", skip(self, now), fields(account_id = %id))]
    pub(crate) async fn refresh_account_at(
        &self,
        id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, PersistenceError> {
        let Ok(_in_flight) = self.account_lock(id).try_lock_owned() else {
            debug!("Fetch already in flight");
            return Ok(FetchOutcome::Skipped(SkipReason::InFlight));
        };

        let Some(account) = self.store.get(id).await else {
            self.forget(id);
            return Ok(FetchOutcome::Gone);
        };

        if account.backoff().is_active(now) {
            if let Some(until) = account.backoff().resume_at() {
                return Ok(FetchOutcome::Skipped(SkipReason::BackoffActive { until }));
            }
        }
        if let Some(last) = account.last_fetched_at() {
            let next_at = last + to_chrono(self.policy.min_fetch_interval);
            if now < next_at {
                return Ok(FetchOutcome::Skipped(SkipReason::TooSoon { next_at }));
            }
        }

        // Failed attempts count against the interval too.
        if self.store.update(id, |a| a.mark_fetch_attempt(now)).await?.is_none() {
            return Ok(FetchOutcome::Gone);
        }

        let provider = account.provider_key().clone();
        let Some(adapter) = self.registry.get(&provider) else {
            warn!(%provider, "Account bound to an unregistered provider");
            return Ok(FetchOutcome::Failed(FetchError::fatal(format!(
                "provider {provider} is not registered"
            ))));
        };

        let started = Instant::now();
        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            adapter.fetch_messages(account.credential(), account.address()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(FetchError::unavailable(format!(
                "fetch timed out after {:?}",
                self.fetch_timeout
            )))
        });
        let answered_at = now + to_chrono(started.elapsed());

        match fetched {
            Ok(messages) => self.apply_success(id, &provider, messages).await,
            Err(FetchError::NotFound) => self.apply_success(id, &provider, Vec::new()).await,
            Err(FetchError::RateLimited { retry_after }) => {
                let policy = &self.policy;
                let Some(delay) = self
                    .store
                    .update(id, |a| a.backoff_mut().register_rate_limit(answered_at, retry_after, policy))
                    .await?
                else {
                    return Ok(FetchOutcome::Gone);
                };

                info!(%provider, delay_ms = delay.as_millis() as u64, "Rate limited, backing off");
                self.sink.notify(Event::Backoff { account_id: id, delay });
                Ok(FetchOutcome::RateLimited { delay })
            }
            Err(e) => {
                warn!(%provider, error = %e, retryable = e.is_retryable(), "Fetch failed");
                Ok(FetchOutcome::Failed(e))
            }
        }
    }

    async fn apply_success(
        &self,
        id: AccountId,
        provider: &ProviderKey,
        messages: Vec<Message>,
    ) -> Result<FetchOutcome, PersistenceError> {
        let merged = self
            .store
            .update(id, |a| {
                a.backoff_mut().reset();
                let fresh = a.merge_messages(messages);
                (a.address().to_string(), fresh)
            })
            .await?;
        let Some((address, fresh)) = merged else {
            debug!("Account deleted during fetch, result dropped");
            return Ok(FetchOutcome::Gone);
        };

        debug!(%provider, new_messages = fresh.len(), "Fetch merged");
        if !fresh.is_empty() {
            self.sink.notify(Event::NewMessages {
                account_id: id,
                address: address.clone(),
                count: fresh.len(),
                message_ids: fresh.iter().map(|m| m.id.clone()).collect(),
            });
        }
        // Only newly cached messages are scanned.
        for message in &fresh {
            if let Some(code) = self.matcher.extract(&message.text, &message.subject) {
                self.sink.notify(Event::VerificationCode {
                    account_id: id,
                    address: address.clone(),
                    message_id: message.id.clone(),
                    code,
                });
            }
        }
        Ok(FetchOutcome::Fetched { new: fresh.len() })
    }

    /// Runs one polling pass over every account, with bounded parallelism.
    ///
    /// A failing account never aborts the pass. Returns the number of newly
    /// cached messages.
    #[instrument(name = "PollingEngine::refresh_all", skip(self))]
    pub async fn refresh_all(&self) -> usize {
        let ids = self.store.ids().await;
        let outcomes: Vec<(AccountId, Result<FetchOutcome, PersistenceError>)> = stream::iter(ids)
            .map(|id| async move { (id, self.refresh_account(id).await) })
            .buffer_unordered(self.policy.max_concurrent_fetches)
            .collect()
            .await;

        outcomes
            .into_iter()
            .map(|(id, outcome)| match outcome {
                Ok(outcome) => outcome.new_messages(),
                Err(e) => {
                    warn!(account_id = %id, error = %e, "Could not persist fetch result");
                    0
                }
            })
            .sum()
    }

    /// Runs a liveness pass, emitting [`Event::StatusChange`] for every
    /// provider whose liveness flipped and persisting the statuses when a
    /// storage directory is configured.
    #[instrument(name = "PollingEngine::check_liveness", skip(self))]
    pub async fn check_liveness(&self) -> BTreeMap<ProviderKey, ProviderStatus> {
        let before = self.registry.status();
        let after = self.registry.check_all_liveness().await;

        for (key, status) in &after {
            let was_active = before.get(key).is_some_and(|s| s.is_active);
            if was_active != status.is_active {
                self.sink.notify(Event::StatusChange {
                    provider_key: key.clone(),
                    is_active: status.is_active,
                    state: status.state,
                });
            }
        }

        if let Some(path) = &self.status_path {
            if let Err(e) = store::write_json_file(path, &after).await {
                warn!(path = %path.display(), error = %e, "Could not save provider status");
            }
        }
        after
    }

    /// Drops the per-account bookkeeping of a deleted account.
    pub fn forget(&self, id: AccountId) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Scheduler loop: a polling pass every tick, a liveness pass every
    /// liveness interval. Returns when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.policy.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut liveness = tokio::time::interval_at(
            tokio::time::Instant::now() + self.policy.liveness_interval,
            self.policy.liveness_interval,
        );
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_ms = self.policy.tick_interval.as_millis() as u64,
            liveness_ms = self.policy.liveness_interval.as_millis() as u64,
            "Poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = liveness.tick() => {
                    self.check_liveness().await;
                }
                _ = tick.tick() => {
                    let new = self.refresh_all().await;
                    if new > 0 {
                        debug!(new_messages = new, "Polling pass done");
                    }
                }
            }
        }
        info!("Poller stopped");
    }

    fn account_lock(&self, id: AccountId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::providers::ProviderAdapter;
    use crate::store::MemoryBackend;
    use crate::test_support::FakeProvider;
    use chrono::TimeZone;
    use secrecy::SecretString;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: Arc<PollingEngine>,
        provider: Arc<FakeProvider>,
        events: mpsc::UnboundedReceiver<Event>,
        id: AccountId,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    async fn fixture(config: HubConfig) -> Fixture {
        let provider = FakeProvider::new(ProviderKey::SNAPMAIL, "snapmail.cc");
        let registry = ProviderRegistry::builder()
            .register(Arc::clone(&provider) as Arc<dyn ProviderAdapter>)
            .liveness_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let account = Account::new(
            "kpay001@snapmail.cc",
            "kpay001",
            ProviderKey::SNAPMAIL,
            SecretString::from("key".to_string()),
            t0(),
        );
        let id = account.id();
        let store = AccountStore::open(Arc::new(MemoryBackend::with_accounts([account])))
            .await
            .unwrap();

        let (tx, events) = mpsc::unbounded_channel();
        let engine = PollingEngine::new(Arc::new(registry), Arc::new(store), Arc::new(tx), &config);
        Fixture {
            engine: Arc::new(engine),
            provider,
            events,
            id,
        }
    }

    async fn default_fixture() -> Fixture {
        fixture(HubConfig::builder().build().unwrap()).await
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_success_merges_and_reports_codes_once() {
        let mut f = default_fixture().await;
        let listing = vec![
            f.provider.message("1", 1, "your code is 4821"),
            f.provider.message("2", 2, "welcome aboard"),
        ];
        f.provider.set_fallback(Ok(listing));

        let outcome = f.engine.refresh_account_at(f.id, t0()).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched { new: 2 });

        let events = drain(&mut f.events);
        assert!(matches!(&events[0], Event::NewMessages { count: 2, .. }));
        let codes: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::VerificationCode { code, .. } => Some(code.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(codes, ["4821"]);

        // Same listing again: nothing new, nothing re-scanned.
        let outcome = f.engine.refresh_account_at(f.id, t0() + secs(20)).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched { new: 0 });
        assert!(drain(&mut f.events).is_empty());
        assert_eq!(f.engine.store().get(f.id).await.unwrap().messages().len(), 2);
    }

    #[tokio::test]
    async fn test_min_interval_gate_skips_provider() {
        let f = default_fixture().await;
        f.engine.refresh_account_at(f.id, t0()).await.unwrap();

        let outcome = f.engine.refresh_account_at(f.id, t0() + secs(5)).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Skipped(SkipReason::TooSoon {
                next_at: t0() + secs(15)
            })
        );
        assert_eq!(f.provider.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_and_success_resets() {
        let mut f = default_fixture().await;
        f.provider.set_fallback(Ok(vec![f.provider.message("1", 1, "hello")]));
        f.engine.refresh_account_at(f.id, t0()).await.unwrap();
        drain(&mut f.events);

        f.provider.push_fetch(Err(FetchError::RateLimited {
            retry_after: Duration::from_secs(10),
        }));
        let outcome = f.engine.refresh_account_at(f.id, t0() + secs(20)).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::RateLimited {
                delay: Duration::from_secs(10)
            }
        );

        let account = f.engine.store().get(f.id).await.unwrap();
        assert!(account.backoff().resume_not_before_ms >= (t0() + secs(30)).timestamp_millis());
        assert_eq!(account.backoff().step_multiplier, 2);
        assert_eq!(account.messages().len(), 1);
        assert!(matches!(drain(&mut f.events)[..], [Event::Backoff { .. }]));

        // Inside the backoff window: skipped without calling the provider.
        let calls = f.provider.fetch_calls();
        let outcome = f.engine.refresh_account_at(f.id, t0() + secs(25)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Skipped(SkipReason::BackoffActive { .. })));
        assert_eq!(f.provider.fetch_calls(), calls);

        let outcome = f.engine.refresh_account_at(f.id, t0() + secs(60)).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched { new: 0 });
        assert!(f.engine.store().get(f.id).await.unwrap().backoff().is_identity());
    }

    #[tokio::test]
    async fn test_failures_leave_backoff_untouched() {
        let f = default_fixture().await;
        f.provider.push_fetch(Err(FetchError::unavailable("502")));

        let outcome = f.engine.refresh_account_at(f.id, t0()).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Failed(FetchError::Unavailable { .. })));

        let account = f.engine.store().get(f.id).await.unwrap();
        assert!(account.backoff().is_identity());
        assert_eq!(account.last_fetched_at(), Some(t0()));
    }

    #[tokio::test]
    async fn test_not_found_is_an_empty_mailbox() {
        let f = default_fixture().await;
        f.provider.push_fetch(Err(FetchError::NotFound));
        let outcome = f.engine.refresh_account_at(f.id, t0()).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched { new: 0 });
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_skipped() {
        let f = default_fixture().await;
        f.provider.set_fetch_delay(Duration::from_millis(100));

        let (a, b) = tokio::join!(
            f.engine.refresh_account_at(f.id, t0()),
            f.engine.refresh_account_at(f.id, t0()),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert!(outcomes.contains(&FetchOutcome::Skipped(SkipReason::InFlight)));
        assert!(outcomes.contains(&FetchOutcome::Fetched { new: 0 }));
        assert_eq!(f.provider.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_delete_during_fetch_drops_result() {
        let f = default_fixture().await;
        f.provider.set_fetch_delay(Duration::from_millis(100));
        f.provider.set_fallback(Ok(vec![f.provider.message("late", 1, "code 123456")]));

        let engine = Arc::clone(&f.engine);
        let id = f.id;
        let fetch = tokio::spawn(async move { engine.refresh_account_at(id, t0()).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.engine.store().remove(f.id).await.unwrap().is_some());

        assert_eq!(fetch.await.unwrap().unwrap(), FetchOutcome::Gone);
        assert!(f.engine.store().get(f.id).await.is_none());
    }

    #[tokio::test]
    async fn test_hanging_fetch_times_out() {
        let config = HubConfig::builder()
            .request_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let f = fixture(config).await;
        f.provider.set_fetch_delay(Duration::from_secs(5));

        let outcome = f.engine.refresh_account_at(f.id, t0()).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Failed(FetchError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_refresh_all_survives_a_failing_account() {
        let config = HubConfig::builder()
            .min_fetch_interval(Duration::ZERO)
            .build()
            .unwrap();
        let f = fixture(config).await;

        let broken = Account::new(
            "ghost@nowhere.test",
            "ghost",
            ProviderKey::new("unregistered"),
            SecretString::from("x".to_string()),
            t0(),
        );
        f.engine.store().insert(broken).await.unwrap();
        f.provider.set_fallback(Ok(vec![f.provider.message("1", 1, "hi")]));

        assert_eq!(f.engine.refresh_all().await, 1);
        assert_eq!(f.engine.refresh_all().await, 0);
    }

    #[tokio::test]
    async fn test_liveness_flip_emits_status_change() {
        let mut f = default_fixture().await;
        f.engine.check_liveness().await;
        assert!(matches!(
            drain(&mut f.events)[..],
            [Event::StatusChange { is_active: true, .. }]
        ));

        f.engine.check_liveness().await;
        assert!(drain(&mut f.events).is_empty());

        f.provider.set_alive(false);
        f.engine.check_liveness().await;
        assert!(matches!(
            drain(&mut f.events)[..],
            [Event::StatusChange { is_active: false, .. }]
        ));
    }

    #[tokio::test]
    async fn test_run_polls_until_shutdown() {
        let config = HubConfig::builder()
            .tick_interval(Duration::from_millis(20))
            .min_fetch_interval(Duration::ZERO)
            .build()
            .unwrap();
        let f = fixture(config).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&f.engine).run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let calls = f.provider.fetch_calls();
        assert!(calls >= 2, "only {calls} fetches");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.provider.fetch_calls(), calls);
    }
}
