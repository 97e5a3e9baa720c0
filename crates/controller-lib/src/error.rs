//! Error types for the ServiceMonitor controller

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an [`ObjectStore`](crate::store::ObjectStore)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency rejected the write (stale resourceVersion)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Create raced with another writer
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The API server rejected the request (validation, RBAC, ...)
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// Network failure, timeout or 5xx
    #[error("transient: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
                (404, _) => StoreError::NotFound(resp.message),
                (409, "AlreadyExists") => StoreError::AlreadyExists(resp.message),
                (409, _) => StoreError::Conflict(resp.message),
                (code, _) if code >= 500 || code == 429 => StoreError::Transient(resp.message),
                (code, _) => StoreError::Rejected {
                    code,
                    message: resp.message,
                },
            },
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// Why a reconciliation pass did not complete
///
/// An unhealthy metrics endpoint is not an error; it is the
/// [`ReconcileOutcome::Unhealthy`](crate::reconciler::ReconcileOutcome::Unhealthy) outcome.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Store call failed; the pass can be retried as is
    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    /// A write kept conflicting after the in-pass re-fetch
    #[error("write conflict on {0} persisted after retry")]
    Conflict(String),

    /// The Service cannot be reconciled until it changes (no probe-able port, ...)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The pass was cancelled from outside
    #[error("reconciliation cancelled")]
    Cancelled,

    /// The pass ran past its deadline
    #[error("reconciliation exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl ReconcileError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Store(StoreError::Transient(_)) => "transient",
            ReconcileError::Store(StoreError::Rejected { .. }) => "rejected",
            ReconcileError::Store(_) => "store",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::Configuration(_) => "configuration",
            ReconcileError::Cancelled => "cancelled",
            ReconcileError::DeadlineExceeded(_) => "deadline",
        }
    }

    /// When the caller should run the pass again; `None` means wait for the
    /// next change event
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::Conflict(_) => Some(Duration::from_secs(1)),
            ReconcileError::Store(StoreError::Rejected { .. }) => Some(Duration::from_secs(300)),
            ReconcileError::Store(_) => Some(Duration::from_secs(15)),
            ReconcileError::DeadlineExceeded(_) => Some(Duration::from_secs(30)),
            ReconcileError::Configuration(_) | ReconcileError::Cancelled => None,
        }
    }
}
