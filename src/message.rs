//! The canonical message model shared by every provider.

use crate::providers::ProviderKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-namespaced message identifier.
///
/// Equality and ordering compare the provider key first, then the native id, so two
/// providers can never collide even when a native id contains the `_` used by the
/// display form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Provider that issued the id.
    pub provider: ProviderKey,
    /// Id as the provider knows it.
    pub native: String,
}

impl MessageId {
    /// Creates a message id.
    pub fn new(provider: ProviderKey, native: impl Into<String>) -> Self {
        Self {
            provider,
            native: native.into(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.provider, self.native)
    }
}

/// A normalized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique id.
    pub id: MessageId,
    /// Sender.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Send or receive time.
    pub date: DateTime<Utc>,
    /// Plain-text body.
    pub text: String,
    /// HTML body.
    pub html: String,
}

impl Message {
    /// Provider that produced this message.
    #[must_use]
    pub fn provider_key(&self) -> &ProviderKey {
        &self.id.provider
    }
}
