//! Error types for the tempmail-hub crate.
//!
//! Two layers exist:
//!
//! - [`FetchError`] is the classified outcome of a single provider fetch. The polling
//!   engine reacts to it (backoff, skip, log) and never lets it escape a polling pass.
//! - [`Error`] is what the boundary operations on [`MailHub`](crate::MailHub) return.
//!
//! Errors are categorized by their retryability - see [`Error::is_retryable`].

use crate::providers::ProviderKey;
use crate::store::PersistenceError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure of a provider message fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The mailbox exists but holds no messages. Not an outage.
    #[error("mailbox has no messages")]
    NotFound,

    /// The provider asked us to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Provider-suggested wait before the next attempt.
        retry_after: Duration,
    },

    /// Transient network or provider fault.
    #[error("provider unavailable: {message}")]
    Unavailable {
        /// Description of the fault.
        message: String,
    },

    /// Non-retryable failure, e.g. a malformed or expired credential.
    #[error("fatal provider error: {message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },
}

impl FetchError {
    /// Shorthand for [`FetchError::Unavailable`].
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Shorthand for [`FetchError::Fatal`].
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns `true` if a later attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Fatal { .. })
    }
}

/// Errors returned by the hub's boundary operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / validation errors (NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// A provider handed back an address that is not a valid email address.
    #[error("invalid email format: {email}")]
    InvalidEmailFormat {
        /// The invalid email address.
        email: String,
    },

    /// The requested prefix cannot be used as a mailbox local-part.
    #[error("invalid prefix '{prefix}'")]
    InvalidPrefix {
        /// The rejected prefix.
        prefix: String,
    },

    /// No adapter is known under this key.
    #[error("unknown provider '{key}'")]
    UnknownProvider {
        /// The key that was looked up.
        key: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Allocation errors (NOT retryable with the same input)
    // ─────────────────────────────────────────────────────────────────────────
    /// The prefix allocator hit its retry cap. Try a different prefix or strategy.
    #[error("no free prefix found for '{head}' after {attempts} attempts")]
    AllocationExhausted {
        /// The head the allocator was numbering.
        head: String,
        /// Number of candidates tried.
        attempts: u32,
    },

    /// The provider rejected the prefix because it is already registered remotely.
    #[error("prefix '{prefix}' is already taken at {provider}")]
    PrefixTaken {
        /// The colliding prefix.
        prefix: String,
        /// Provider that reported the collision.
        provider: ProviderKey,
    },

    /// No provider adapter is registered at all.
    #[error("no mail provider available")]
    NoProviderAvailable,

    // ─────────────────────────────────────────────────────────────────────────
    // Provider errors (mixed retryability)
    // ─────────────────────────────────────────────────────────────────────────
    /// HTTP request to a provider failed.
    #[error("{provider}: request to {endpoint} failed")]
    Http {
        /// Provider issuing the request.
        provider: ProviderKey,
        /// Endpoint (path or action) that failed.
        endpoint: String,
        /// The underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },

    /// The provider refused to create a mailbox.
    #[error("{provider}: mailbox creation failed: {message}")]
    CreateMailbox {
        /// Provider that refused.
        provider: ProviderKey,
        /// Description of the failure.
        message: String,
    },

    /// A provider call exceeded its timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Account / persistence errors
    // ─────────────────────────────────────────────────────────────────────────
    /// No account exists under this id.
    #[error("account {id} not found")]
    AccountNotFound {
        /// The id that was looked up.
        id: String,
    },

    /// Loading or saving the account snapshot failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http { .. } | Error::CreateMailbox { .. } | Error::Timeout { .. } => true,

            // Persistence failures are left to the caller to retry.
            Error::InvalidConfig { .. }
            | Error::InvalidEmailFormat { .. }
            | Error::InvalidPrefix { .. }
            | Error::UnknownProvider { .. }
            | Error::AllocationExhausted { .. }
            | Error::PrefixTaken { .. }
            | Error::NoProviderAvailable
            | Error::AccountNotFound { .. }
            | Error::Persistence(_) => false,
        }
    }

    /// Returns the error category for metrics/logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidConfig { .. }
            | Error::InvalidEmailFormat { .. }
            | Error::InvalidPrefix { .. }
            | Error::UnknownProvider { .. }
            | Error::NoProviderAvailable => ErrorCategory::Configuration,

            Error::AllocationExhausted { .. } | Error::PrefixTaken { .. } => {
                ErrorCategory::Allocation
            }

            Error::Http { .. } => ErrorCategory::Network,

            Error::Timeout { .. } => ErrorCategory::Timeout,

            Error::CreateMailbox { .. } => ErrorCategory::Provider,

            Error::Persistence(_) => ErrorCategory::Persistence,

            Error::AccountNotFound { .. } => ErrorCategory::NotFound,
        }
    }
}

/// Error categories for metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Prefix allocation errors.
    Allocation,
    /// Network connectivity errors.
    Network,
    /// Timeout errors.
    Timeout,
    /// Errors reported by a provider.
    Provider,
    /// Snapshot load/save errors.
    Persistence,
    /// Missing account.
    NotFound,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Allocation => write!(f, "allocation"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Provider => write!(f, "provider"),
            ErrorCategory::Persistence => write!(f, "persistence"),
            ErrorCategory::NotFound => write!(f, "not_found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = Error::AllocationExhausted {
            head: "kpay".into(),
            attempts: 21,
        };
        assert!(!err.is_retryable());

        let err = Error::Timeout {
            operation: "mailtm create_email".into(),
            timeout: Duration::from_secs(15),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Timeout);

        let err = Error::CreateMailbox {
            provider: ProviderKey::MAIL_TM,
            message: "no active domain offered".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Provider);
    }

    #[test]
    fn test_error_categories() {
        let err = Error::PrefixTaken {
            prefix: "kpay007".into(),
            provider: ProviderKey::MAIL_TM,
        };
        assert_eq!(err.category(), ErrorCategory::Allocation);

        let err = Error::AccountNotFound { id: "x".into() };
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(err.category().to_string(), "not_found");

        let err = Error::NoProviderAvailable;
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_fetch_error_retryable() {
        assert!(FetchError::NotFound.is_retryable());
        assert!(FetchError::unavailable("502").is_retryable());
        assert!(!FetchError::fatal("bad key").is_retryable());
    }
}
