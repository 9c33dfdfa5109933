//! Error types shared by the Strata operator and agent
//!
//! Errors carry enough context (resource kind and name) to be useful in logs.
//! Status-write and lookup failures use this type and are returned to the
//! controller driver; everything a user should see ends up in a Condition.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Strata infrastructure operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The target object no longer exists
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Optimistic concurrency rejection; the caller should retry with fresh state
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Message from the API server
        message: String,
    },

    /// A reason change not permitted by the kind's transition table
    #[error("illegal transition for {kind}: {from} -> {to}")]
    IllegalTransition {
        /// Resource kind
        kind: String,
        /// Current reason
        from: String,
        /// Rejected reason
        to: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "crontab", "controller")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_for(UNKNOWN_CONTEXT, msg)
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
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

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// True when the target object is gone (deleted between watch and write)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True for stale-write rejections, which are always retryable
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
