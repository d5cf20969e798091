//! Account model: one disposable mailbox bound to one provider.

use crate::config::PollingConfig;
use crate::message::{Message, MessageId};
use crate::providers::ProviderKey;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Opaque, immutable account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Rate-limit backoff of one account.
///
/// The identity state (`step_multiplier == 1`, `resume_not_before_ms == 0`) means
/// "no backoff".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    /// Multiplier applied to the provider's retry-after on the next rate limit.
    pub step_multiplier: u32,
    /// Unix epoch milliseconds before which no fetch may start.
    pub resume_not_before_ms: i64,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            step_multiplier: 1,
            resume_not_before_ms: 0,
        }
    }
}

impl BackoffState {
    /// Returns `true` when no backoff is in effect.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `true` while fetches are suspended.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.resume_not_before_ms
    }

    /// Earliest time the next fetch may start, if backoff was ever applied.
    #[must_use]
    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        (self.resume_not_before_ms > 0)
            .then(|| DateTime::from_timestamp_millis(self.resume_not_before_ms))
            .flatten()
    }

    /// Applies a rate-limit response and returns the resulting delay.
    ///
    /// delay = `min(step * retry_after, max_backoff)`; the step then doubles up to
    /// `max_backoff_step`. With the step starting at 1 and the cap at 60 s, a
    /// retry-after above the cap yields a delay shorter than the provider asked for.
    pub fn register_rate_limit(
        &mut self,
        now: DateTime<Utc>,
        retry_after: Duration,
        policy: &PollingConfig,
    ) -> Duration {
        let scaled = retry_after.as_millis() * u128::from(self.step_multiplier);
        let delay_ms = scaled.min(policy.max_backoff.as_millis());
        let delay_ms = i64::try_from(delay_ms).unwrap_or(i64::MAX);

        self.step_multiplier = self
            .step_multiplier
            .saturating_mul(2)
            .min(policy.max_backoff_step);

        let resume = now.timestamp_millis().saturating_add(delay_ms);
        // Must strictly advance even for a zero retry-after.
        self.resume_not_before_ms = resume.max(self.resume_not_before_ms.saturating_add(1));

        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0))
    }

    /// Returns to the identity state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A provisioned mailbox and its cached messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    #[serde(default)]
    address: String,
    #[serde(default)]
    prefix: String,
    provider_key: ProviderKey,
    #[serde(with = "credential_serde")]
    credential: SecretString,
    created_at: DateTime<Utc>,
    #[serde(default)]
    backoff: BackoffState,
    #[serde(default)]
    last_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    messages: Vec<Message>,
}

impl Account {
    /// Creates a fresh account with an empty cache and no backoff.
    pub fn new(
        address: impl Into<String>,
        prefix: impl Into<String>,
        provider_key: ProviderKey,
        credential: SecretString,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AccountId::generate(),
            address: address.into(),
            prefix: prefix.into(),
            provider_key,
            credential,
            created_at,
            backoff: BackoffState::default(),
            last_fetched_at: None,
            messages: Vec::new(),
        }
    }

    /// Account id.
    #[must_use]
    pub fn id(&self) -> AccountId {
        self.id
    }

    /// Full address, `prefix@domain`.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Local-part of the address.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Provider owning this mailbox.
    #[must_use]
    pub fn provider_key(&self) -> &ProviderKey {
        &self.provider_key
    }

    /// Provider-defined credential (API key, JWT, session token or the address).
    #[must_use]
    pub fn credential(&self) -> &SecretString {
        &self.credential
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current backoff state.
    #[must_use]
    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    /// Mutable backoff state.
    pub fn backoff_mut(&mut self) -> &mut BackoffState {
        &mut self.backoff
    }

    /// Last fetch attempt, successful or not.
    #[must_use]
    pub fn last_fetched_at(&self) -> Option<DateTime<Utc>> {
        self.last_fetched_at
    }

    /// Records a fetch attempt.
    pub fn mark_fetch_attempt(&mut self, at: DateTime<Utc>) {
        self.last_fetched_at = Some(at);
    }

    /// Cached messages, newest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Merges a full provider listing into the cache and returns the messages that were new.
    ///
    /// Additive: cached messages are never removed. Messages whose id is already
    /// cached (or repeated within `incoming`) are ignored, so merging the same
    /// listing twice is a no-op the second time.
    pub fn merge_messages(&mut self, incoming: Vec<Message>) -> Vec<Message> {
        let mut seen: HashSet<MessageId> = self.messages.iter().map(|m| m.id.clone()).collect();

        let mut fresh: Vec<Message> = incoming
            .into_iter()
            .filter(|message| seen.insert(message.id.clone()))
            .collect();
        fresh.sort_by(|a, b| b.date.cmp(&a.date));

        if !fresh.is_empty() {
            self.messages.extend(fresh.iter().cloned());
            self.messages.sort_by(|a, b| b.date.cmp(&a.date));
        }
        fresh
    }
}

mod credential_serde {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        secret: &SecretString,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(secret.expose_secret())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<SecretString, D::Error> {
        String::deserialize(deserializer).map(SecretString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(native: &str, minute: u32) -> Message {
        Message {
            id: MessageId::new(ProviderKey::MAIL_TM, native),
            from: "sender@example.com".into(),
            subject: format!("subject {native}"),
            date: Utc.with_ymd_and_hms(2025, 1, 1, 12, minute, 0).unwrap(),
            text: String::new(),
            html: String::new(),
        }
    }

    fn account() -> Account {
        Account::new(
            "kpay001@example.com",
            "kpay001",
            ProviderKey::MAIL_TM,
            SecretString::from("jwt".to_string()),
            Utc::now(),
        )
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut account = account();
        let listing = vec![message("a", 1), message("b", 2)];

        assert_eq!(account.merge_messages(listing.clone()).len(), 2);
        assert!(account.merge_messages(listing).is_empty());
        assert_eq!(account.messages().len(), 2);
    }

    #[test]
    fn test_merge_keeps_newest_first_and_never_removes() {
        let mut account = account();
        account.merge_messages(vec![message("a", 1), message("c", 3)]);

        // The provider no longer lists "a"; it must stay cached.
        let fresh = account.merge_messages(vec![message("b", 2), message("c", 3)]);
        assert_eq!(fresh.len(), 1);

        let order: Vec<&str> = account
            .messages()
            .iter()
            .map(|m| m.id.native.as_str())
            .collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn test_merge_dedups_within_one_listing() {
        let mut account = account();
        let fresh = account.merge_messages(vec![message("a", 1), message("a", 1)]);
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn test_backoff_progression() {
        let policy = PollingConfig::default();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut backoff = BackoffState::default();

        let delay = backoff.register_rate_limit(now, Duration::from_secs(10), &policy);
        assert_eq!(delay, Duration::from_secs(10));
        assert_eq!(backoff.step_multiplier, 2);
        assert_eq!(backoff.resume_not_before_ms, now.timestamp_millis() + 10_000);
        assert!(backoff.is_active(now));

        let delay = backoff.register_rate_limit(now, Duration::from_secs(10), &policy);
        assert_eq!(delay, Duration::from_secs(20));
        assert_eq!(backoff.step_multiplier, 4);

        backoff.register_rate_limit(now, Duration::from_secs(10), &policy);
        let delay = backoff.register_rate_limit(now, Duration::from_secs(10), &policy);
        // 8 * 10 s capped to 60 s; step stays at the cap.
        assert_eq!(delay, Duration::from_secs(60));
        assert_eq!(backoff.step_multiplier, 8);

        backoff.reset();
        assert!(backoff.is_identity());
        assert_eq!(backoff.resume_at(), None);
    }

    #[test]
    fn backoff_cap_can_undercut_provider_retry_after() {
        // Known characteristic of the formula: the 60 s cap wins over a longer
        // provider-suggested retry-after.
        let policy = PollingConfig::default();
        let now = Utc::now();
        let mut backoff = BackoffState::default();
        let delay = backoff.register_rate_limit(now, Duration::from_secs(120), &policy);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_strictly_advances_on_zero_retry_after() {
        let policy = PollingConfig::default();
        let now = Utc::now();
        let mut backoff = BackoffState::default();
        backoff.register_rate_limit(now, Duration::ZERO, &policy);
        let first = backoff.resume_not_before_ms;
        backoff.register_rate_limit(now, Duration::ZERO, &policy);
        assert!(backoff.resume_not_before_ms > first);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_credential() {
        use secrecy::ExposeSecret;

        let mut original = account();
        original.merge_messages(vec![message("a", 1)]);
        let json = serde_json::to_string(&original).unwrap();
        let restored: Account = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id(), original.id());
        assert_eq!(restored.credential().expose_secret(), "jwt");
        assert_eq!(restored.messages(), original.messages());
        assert!(!format!("{restored:?}").contains("\"jwt\""));
    }
}
