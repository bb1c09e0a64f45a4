//! Error types for the Hetzner provider
//!
//! Errors carry the identity of the object or cloud resource they concern so
//! that a single log line is enough to locate the failing piece. Cloud API
//! failures are kept in their own [`ComputeError`] enum because the
//! reconcilers branch on them (unauthorized, rate limited, not found).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Errors returned by the external compute API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputeError {
    /// The API token was rejected
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Message returned by the API
        message: String,
    },

    /// The project exceeded its request budget
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        /// Message returned by the API
        message: String,
    },

    /// The addressed resource does not exist
    #[error("{resource} not found")]
    NotFound {
        /// Resource path or description (e.g. "server 42")
        resource: String,
    },

    /// Any other error reported by the API
    #[error("api error [{code}]: {message}")]
    Api {
        /// Machine-readable error code (e.g. "uniqueness_error")
        code: String,
        /// Human-readable message
        message: String,
    },

    /// The request never produced an API response
    #[error("transport error: {0}")]
    Transport(String),

    /// The API answered with a body we could not decode
    #[error("decode error: {0}")]
    Decode(String),
}

impl ComputeError {
    /// Whether the API rejected our credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Whether the API asked us to slow down
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether the resource is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Main error type for provider operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A Kubernetes object that must exist is missing
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// namespace/name of the missing object
        name: String,
    },

    /// The credentials secret could not be read
    #[error("secret {namespace}/{name} unreachable: {message}")]
    SecretUnreachable {
        /// Namespace of the secret
        namespace: String,
        /// Name of the secret
        name: String,
        /// Description of what failed
        message: String,
    },

    /// The credentials secret exists but holds no usable token
    #[error("invalid credentials in secret {namespace}/{name}: {message}")]
    CredentialsInvalid {
        /// Namespace of the secret
        namespace: String,
        /// Name of the secret
        name: String,
        /// Description of what is wrong
        message: String,
    },

    /// The external compute API failed for a specific resource
    #[error("compute api error for {resource}: {source}")]
    Compute {
        /// Resource the call was about (e.g. "network caph-cluster-a")
        resource: String,
        /// The API error
        #[source]
        source: ComputeError,
    },

    /// Validation error for a spec
    #[error("validation error for {object}: {message}")]
    Validation {
        /// namespace/name of the invalid object
        object: String,
        /// Description of what's invalid
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

    /// The workload cluster could not be reached or driven
    #[error("target cluster error for {cluster}: {message}")]
    TargetCluster {
        /// namespace/name of the cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A reconcile stage failed; wraps the cause with the object identity
    #[error("failed to reconcile {stage} for {object}: {source}")]
    Stage {
        /// Stage name (network, load balancer, ...)
        stage: String,
        /// Kind namespace/name of the reconciled object
        object: String,
        /// The failure
        #[source]
        source: Box<Error>,
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

impl Error {
    /// Create a not-found error for a Kubernetes object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap a compute API error with the resource it concerns
    pub fn compute(resource: impl Into<String>, source: ComputeError) -> Self {
        Self::Compute {
            resource: resource.into(),
            source,
        }
    }

    /// Create a validation error for an object
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
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

    /// Create a serialization error naming the kind being converted
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a target cluster error
    pub fn target_cluster(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TargetCluster {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the stage and object it happened in
    pub fn stage(stage: impl Into<String>, object: impl Into<String>, source: Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            object: object.into(),
            source: Box::new(source),
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

    /// The innermost error, looking through stage wrappers
    pub fn root(&self) -> &Error {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The compute API error behind this error, if any
    pub fn compute_error(&self) -> Option<&ComputeError> {
        match self.root() {
            Self::Compute { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the object or resource this error is about is gone
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Self::Compute { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            Self::Kube {
                source: kube::Error::Api(ae),
            } if ae.code == 409
        )
    }

    /// Whether the compute API rejected our token
    pub fn is_unauthorized(&self) -> bool {
        self.compute_error().is_some_and(ComputeError::is_unauthorized)
    }

    /// Whether the compute API rate limited us
    pub fn is_rate_limited(&self) -> bool {
        self.compute_error().is_some_and(ComputeError::is_rate_limited)
    }

    /// Whether this is a credential problem
    pub fn is_credentials_error(&self) -> bool {
        matches!(
            self.root(),
            Self::SecretUnreachable { .. } | Self::CredentialsInvalid { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
