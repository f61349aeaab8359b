//! Error taxonomy for the sync engine.
//!
//! Record-level errors never abort a batch, source-level errors never abort a
//! run. Only configuration errors abort the run; those surface as
//! `ConfigError` or `anyhow` errors during setup, not as `SyncError`.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which outbound dependency a breaker or error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Upstream,
    ContentStore,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Upstream => f.write_str("upstream"),
            Domain::ContentStore => f.write_str("content store"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("credentials expired or rejected")]
    AuthExpired,
    #[error("{0} circuit is open")]
    CircuitOpen(Domain),
    #[error("invalid record: {0}")]
    Validation(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },
    #[error("content store error: {0}")]
    ContentStore(String),
    #[error("content store rejected credentials: {0}")]
    ContentStoreAuth(String),
    #[error("pagination limit exceeded: {pages} pages reported, cap is {cap}")]
    PaginationLimitExceeded { pages: u32, cap: u32 },
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),
    #[error("run timed out before the source completed")]
    Timeout,
    #[error("storage error: {0}")]
    Storage(String),
}

/// How a retry policy should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Exponential backoff with jitter.
    Backoff,
    /// Wait exactly this long, no randomization.
    WaitFor(Duration),
    Never,
}

impl SyncError {
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            SyncError::TransientNetwork(_) => RetryHint::Backoff,
            SyncError::RateLimited { retry_after } => RetryHint::WaitFor(*retry_after),
            _ => RetryHint::Never,
        }
    }

    /// Whether the error says something about the health of the remote side.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_)
                | SyncError::UpstreamUnavailable(_)
                | SyncError::ContentStore(_)
        )
    }

    /// Errors after which the rest of a source's entity sync cannot make
    /// progress. Everything else is charged to the single record.
    pub fn is_source_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::CircuitOpen(_)
                | SyncError::UpstreamUnavailable(_)
                | SyncError::AuthExpired
                | SyncError::ContentStoreAuth(_)
                | SyncError::CredentialRefresh(_)
                | SyncError::RateLimited { .. }
                | SyncError::PaginationLimitExceeded { .. }
                | SyncError::Timeout
        )
    }

    /// Convert an exhausted transient failure into the domain's terminal error.
    pub fn exhausted(self, domain: Domain) -> SyncError {
        match (self, domain) {
            (SyncError::TransientNetwork(msg), Domain::Upstream) => {
                SyncError::UpstreamUnavailable(msg)
            }
            (SyncError::TransientNetwork(msg), Domain::ContentStore) => {
                SyncError::ContentStore(msg)
            }
            (other, _) => other,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Storage(format!("{err:#}"))
    }
}
