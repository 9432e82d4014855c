//! Error types for down-pvscope
//!
//! Every cluster-facing operation returns this error. Variants carry the
//! object kind and name they concern so a failed migration can be traced
//! back to the resource that stalled it.

use thiserror::Error;

/// Main error type for migration operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kubernetes kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Create was rejected because the object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kubernetes kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Optimistic-concurrency clash on update; re-read and retry
    #[error("conflicting write on {kind} {name}")]
    Conflict {
        /// Kubernetes kind
        kind: String,
        /// Object name
        name: String,
    },

    /// A polled condition never became true
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// Description of the awaited condition
        what: String,
        /// Wait budget in seconds
        seconds: u64,
    },

    /// A claim never reached the Bound phase
    #[error("claim {claim} not bound after {seconds}s")]
    BindTimeout {
        /// Claim name
        claim: String,
        /// Wait budget in seconds
        seconds: u64,
    },

    /// A workload never reached the requested replica count
    #[error("workload {workload} did not reach {replicas} ready replicas after {seconds}s")]
    ScaleTimeout {
        /// Workload name
        workload: String,
        /// Target replica count
        replicas: i32,
        /// Wait budget in seconds
        seconds: u64,
    },

    /// The poll predicate itself failed
    #[error("check failed while waiting for {what}: {source}")]
    Predicate {
        /// Description of the awaited condition
        what: String,
        /// Error surfaced by the predicate
        source: Box<Error>,
    },

    /// The data-copy job reported a failed pod
    #[error("copy job {job} failed ({failed} failed pods)")]
    CopyFailed {
        /// Job name
        job: String,
        /// Failed pod count reported by the job
        failed: i32,
    },

    /// The operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// A saga step ran before the step that produces its input
    #[error("migration state is missing {field}")]
    MissingState {
        /// Name of the missing field
        field: String,
    },

    /// Invalid input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Checkpoint persistence failed
    #[error("checkpoint error: {message}")]
    Checkpoint {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflicting-write error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a missing-state error
    pub fn missing_state(field: impl Into<String>) -> Self {
        Self::MissingState {
            field: field.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap an error surfaced by a poll predicate
    pub fn predicate(what: impl Into<String>, source: Error) -> Self {
        Self::Predicate {
            what: what.into(),
            source: Box::new(source),
        }
    }

    /// True for `NotFound` and for raw 404 responses
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True for `AlreadyExists` and for raw 409 AlreadyExists responses
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// True for `Conflict` and for raw 409 Conflict responses
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "Conflict",
            _ => false,
        }
    }

    /// True for timeouts of any flavor
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::BindTimeout { .. } | Error::ScaleTimeout { .. }
        )
    }

    /// Check if this error is retryable
    ///
    /// A failed copy is never retried automatically, and cancellation always
    /// unwinds. Kubernetes errors retry unless the API rejected the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::NotFound { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::Conflict { .. } => true,
            Error::Timeout { .. } => true,
            Error::BindTimeout { .. } => true,
            Error::ScaleTimeout { .. } => true,
            Error::Predicate { source, .. } => source.is_retryable(),
            Error::CopyFailed { .. } => false,
            Error::Cancelled => false,
            Error::MissingState { .. } => false,
            Error::Validation { .. } => false,
            Error::Checkpoint { .. } => true,
            Error::Serialization(_) => false,
            Error::Internal { .. } => true,
        }
    }
}
