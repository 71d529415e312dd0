//! Error types for the one-click operator
//!
//! Errors carry the kind and name of the object involved so a failed
//! reconcile pass can be traced back to the resource that broke it.

use thiserror::Error;

/// Main error type for rollout operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Replace rejected because the object changed since it was read
    #[error("conflict updating {kind} {name}: object was modified")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Create rejected because the object already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// Object expected to exist was not found
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// A declared value could not be interpreted (e.g. an unparseable quantity)
    #[error("malformed {field}: {message}")]
    MalformedInput {
        /// Field path of the offending value (e.g. "spec.volumes[0].size")
        field: String,
        /// Description of what's wrong
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

    /// Validation error for Rollout specs
    #[error("validation error for {rollout}: {message}")]
    Validation {
        /// Name of the rollout with invalid configuration
        rollout: String,
        /// Description of what's invalid
        message: String,
    },

    /// The reconcile pass was cancelled before it finished
    #[error("reconcile cancelled")]
    Cancelled,
}

impl Error {
    /// Create a conflict error for the given object
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for the given object
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a malformed-input error for a field
    pub fn malformed(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedInput {
            field: field.into(),
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

    /// Create a validation error with rollout context
    pub fn validation_for(rollout: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            rollout: rollout.into(),
            message: msg.into(),
        }
    }

    /// Whether this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is retryable
    ///
    /// Malformed input, validation and serialization errors need a spec fix.
    /// Conflicts and transient API failures clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::NotFound { .. } => true,
            Error::MalformedInput { .. } => false,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::Cancelled => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
