//! Notifications for the presentation layer.
//!
//! The engine reports what it observed through an [`EventSink`]. Two sinks
//! ship with the crate: [`TracingSink`] logs every event, and an unbounded
//! `tokio` channel sender forwards them to a consumer task.

use crate::account::AccountId;
use crate::message::MessageId;
use crate::providers::ProviderKey;
use crate::registry::ServiceState;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Something a consumer may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A fetch added messages to an account's cache.
    NewMessages {
        /// Account that received mail.
        account_id: AccountId,
        /// Its address.
        address: String,
        /// Number of newly cached messages.
        count: usize,
        /// Ids of the new messages, newest first.
        message_ids: Vec<MessageId>,
    },

    /// A newly cached message carried a verification code.
    VerificationCode {
        /// Account that received the code.
        account_id: AccountId,
        /// Its address.
        address: String,
        /// Message the code was found in.
        message_id: MessageId,
        /// The code.
        code: String,
    },

    /// A provider became active or inactive.
    StatusChange {
        /// Provider whose status flipped.
        provider_key: ProviderKey,
        /// New liveness.
        is_active: bool,
        /// Detailed state.
        state: ServiceState,
    },

    /// A rate limit suspended fetching for an account.
    Backoff {
        /// Suspended account.
        account_id: AccountId,
        /// How long fetches stay suspended.
        delay: Duration,
    },
}

/// Receiver of engine events. Must not block.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn notify(&self, event: Event);
}

/// Sink that logs each event at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: Event) {
        match event {
            Event::NewMessages {
                account_id,
                address,
                count,
                ..
            } => info!(%account_id, %address, count, "New messages"),
            Event::VerificationCode {
                account_id,
                address,
                code,
                message_id,
            } => info!(%account_id, %address, %message_id, %code, "Verification code received"),
            Event::StatusChange {
                provider_key,
                is_active,
                state,
            } => info!(provider = %provider_key, is_active, %state, "Provider status changed"),
            Event::Backoff { account_id, delay } => {
                info!(%account_id, delay_ms = delay.as_millis() as u64, "Fetching suspended");
            }
        }
    }
}

/// A closed channel drops events silently; the engine keeps running.
impl EventSink for UnboundedSender<Event> {
    fn notify(&self, event: Event) {
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_channel_sink_forwards_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let event = Event::Backoff {
            account_id: AccountId::generate(),
            delay: Duration::from_secs(10),
        };
        tx.notify(event.clone());
        assert_eq!(rx.try_recv().unwrap(), event);

        drop(rx);
        tx.notify(event);
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingSink;
        sink.notify(Event::StatusChange {
            provider_key: ProviderKey::MAIL_TM,
            is_active: false,
            state: ServiceState::Error,
        });
        sink.notify(Event::NewMessages {
            account_id: AccountId::generate(),
            address: "a@b.c".into(),
            count: 0,
            message_ids: Vec::new(),
        });
    }
}
