//! Error taxonomy for the store and the admission pipeline.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::model::AccountId;

/// Failures of the persistent or counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[cfg(feature = "redis-counters")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt stored credential: {0}")]
    CorruptCredential(#[from] api_key::ApiKeyError),

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("unknown plan '{0}'")]
    UnknownPlan(String),

    /// Plans are immutable while an active subscription references them.
    #[error("plan '{0}' is referenced by an active subscription")]
    PlanInUse(String),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    /// The operation's deadline passed; nothing was committed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Pipeline stage, used to label timeouts and internal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Credential,
    Account,
    Plan,
    RateLimit,
    Billing,
    Usage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Credential => "credential lookup",
            Stage::Account => "account lookup",
            Stage::Plan => "plan resolution",
            Stage::RateLimit => "rate limiting",
            Stage::Billing => "billing",
            Stage::Usage => "usage query",
        };
        f.write_str(name)
    }
}

/// Why a request was not admitted.
///
/// `RateLimitExceeded` clears once the window rolls over, and `Timeout` and
/// `Internal` may be retried with the same idempotency key. Everything else
/// is a terminal answer about the caller.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Unknown, revoked or malformed credential. Deliberately carries no detail.
    #[error("invalid API key")]
    Unauthorized,

    #[error("account is locked")]
    AccountLocked,

    #[error("no active plan found")]
    NoActivePlan,

    #[error("plan has expired")]
    PlanExpired,

    #[error("rate limit exceeded: {ceiling} requests per {window_secs}s")]
    RateLimitExceeded { ceiling: u32, window_secs: u64 },

    #[error("insufficient balance: have {balance}, need {price}")]
    InsufficientBalance { balance: i64, price: i64 },

    #[error("{stage} timed out")]
    Timeout { stage: Stage },

    #[error("{stage} failed: {source}")]
    Internal {
        stage: Stage,
        #[source]
        source: StoreError,
    },
}

impl AdmissionError {
    pub(crate) fn from_store(stage: Stage, err: StoreError) -> Self {
        match err {
            StoreError::DeadlineExceeded => AdmissionError::Timeout { stage },
            source => AdmissionError::Internal { stage, source },
        }
    }

    /// HTTP status used by the front end for this rejection.
    pub fn http_status(&self) -> u16 {
        match self {
            AdmissionError::Unauthorized => 401,
            AdmissionError::AccountLocked
            | AdmissionError::NoActivePlan
            | AdmissionError::PlanExpired => 403,
            AdmissionError::RateLimitExceeded { .. } => 429,
            AdmissionError::InsufficientBalance { .. } => 402,
            AdmissionError::Timeout { .. } => 503,
            AdmissionError::Internal { .. } => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::RateLimitExceeded { .. }
                | AdmissionError::Timeout { .. }
                | AdmissionError::Internal { .. }
        )
    }
}

/// Run one store call under the per-call deadline.
pub(crate) async fn bounded<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T, AdmissionError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(|err| AdmissionError::from_store(stage, err)),
        Err(_) => Err(AdmissionError::Timeout { stage }),
    }
}
