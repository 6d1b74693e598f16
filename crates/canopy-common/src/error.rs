//! Error types for Canopy
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant maps onto one failure category with its own handling rule:
//! validation fails fast, not-found is a signal for the caller to interpret,
//! conflicts are re-fetched and retried, and everything else fails the task.

use thiserror::Error;

use crate::graph::GraphError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Canopy operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed desired-state input, detected before any side effect
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource or document section with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "dataStore.backup.provider")
        field: Option<String>,
    },

    /// Vendor tag that no provider implementation exists for
    #[error("unsupported provider: {tag}")]
    UnsupportedProvider {
        /// The tag as it appeared in the input
        tag: String,
    },

    /// Object does not exist in the remote store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (Secret, StatefulSet, bucket, ...)
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Optimistic-concurrency violation (stale resourceVersion or racing create)
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Namespaced name of the contended object
        name: String,
        /// Server-provided reason
        message: String,
    },

    /// A bounded wait ran past its ceiling
    #[error("deadline exceeded after {seconds}s waiting for {what}")]
    DeadlineExceeded {
        /// What was being waited for
        what: String,
        /// Ceiling that was hit
        seconds: u64,
    },

    /// Remote store or object storage unavailable
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Operation that failed (e.g., "get Secret canopy/etcd-ca")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Certificate generation, reload or chain verification failed
    #[error("certificate error for {name}: {message}")]
    Certificate {
        /// Logical certificate (secret) name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Cloud provider operation error
    #[error("provider error [{provider}]: {message}")]
    Provider {
        /// Provider tag (aws, gcp, alicloud, fake)
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// Task graph could not be compiled
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// A task in the graph failed; dependents were not run
    #[error("task {task} failed: {message} (not run: {})", format_not_run(.not_run))]
    TaskFailed {
        /// Id of the first task that failed
        task: String,
        /// Originating error message
        message: String,
        /// Tasks that never ran because of the failure or cancellation
        not_run: Vec<String>,
    },

    /// Operation was cancelled by the caller
    #[error("cancelled: {context}")]
    Cancelled {
        /// What was in flight when cancellation was observed
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

fn format_not_run(tasks: &[String]) -> String {
    if tasks.is_empty() {
        "none".to_string()
    } else {
        tasks.join(", ")
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a document field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: "desired state".to_string(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unsupported-provider error
    pub fn unsupported_provider(tag: impl Into<String>) -> Self {
        Self::UnsupportedProvider { tag: tag.into() }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict_for(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a deadline-exceeded error
    pub fn deadline_exceeded(what: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::DeadlineExceeded {
            what: what.into(),
            seconds: timeout.as_secs(),
        }
    }

    /// Create a transport error with context
    pub fn transport(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a certificate error
    pub fn certificate(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Certificate {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a provider error
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for the not-found signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for optimistic-concurrency violations
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if re-running the same operation could succeed without changing input
    ///
    /// Validation, unsupported-provider and graph compilation errors require a
    /// config fix. Everything remote is worth another reconcile pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::UnsupportedProvider { .. } => false,
            Error::Graph(_) => false,
            Error::Serialization { .. } => false,
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::DeadlineExceeded { .. } => true,
            Error::Transport { .. } => true,
            Error::Certificate { .. } => false,
            Error::Provider { .. } => true,
            Error::TaskFailed { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
                kind: ae.reason,
                name: ae.message,
            },
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
                kind: ae.reason,
                name: UNKNOWN_CONTEXT.to_string(),
                message: ae.message,
            },
            other => Error::transport("kubernetes", other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
