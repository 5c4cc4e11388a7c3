//! Error types for the Caravel orchestration core
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like app names, pool names
//! and cluster names, and is classified for retry handling:
//!
//! - `NoCluster` is a routine, expected resolution outcome for unconfigured
//!   pools; callers record it and move on rather than retrying.
//! - `ClientConstruction` is a configuration error and is fatal to the
//!   operation that needed the client.
//! - Kubernetes transport errors are retryable unless the API returned a 4xx.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Caravel core operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// No cluster is bound to the requested (provisioner-type, pool) pair
    ///
    /// This is the routine outcome for pools that are not (yet) configured
    /// and must stay distinguishable from transport and storage failures.
    #[error("no cluster found for pool {pool} (provisioner {provisioner})")]
    NoCluster {
        /// Provisioner-type the lookup was scoped to
        provisioner: String,
        /// Pool name the lookup was for
        pool: String,
    },

    /// Cluster client construction failed due to bad addresses or credentials
    #[error("cannot build client for cluster {cluster}: {message}")]
    ClientConstruction {
        /// Name of the cluster whose definition is malformed
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// No provisioner implementation is registered under the given name
    #[error("unknown provisioner type {name:?}")]
    UnknownProvisioner {
        /// The provisioner-type name that failed to dispatch
        name: String,
    },

    /// An application references a pool that does not exist
    #[error("pool {pool} referenced by app {app} not found")]
    PoolNotFound {
        /// Name of the application holding the dangling reference
        app: String,
        /// The missing pool name
        pool: String,
    },

    /// An operation needed a running unit but the app has none
    #[error("app {app} has no unit available")]
    NoUnit {
        /// Name of the application with zero units
        app: String,
    },

    /// Provisioner-specific operation failure
    #[error("provisioner error for app {app}: {message}")]
    Provision {
        /// Name of the application being acted on
        app: String,
        /// Description of what failed
        message: String,
    },

    /// Primary datastore error
    #[error("storage error: {message}")]
    Storage {
        /// Description of what failed
        message: String,
    },

    /// A cluster API call exceeded its per-call deadline
    #[error("timeout during {operation} against cluster {cluster}")]
    Timeout {
        /// The operation that timed out (e.g. "create app resource")
        operation: String,
        /// The cluster the call was directed at
        cluster: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "migrate", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Create a `NoCluster` error for the given provisioner-type and pool
    pub fn no_cluster(provisioner: impl Into<String>, pool: impl Into<String>) -> Self {
        Self::NoCluster {
            provisioner: provisioner.into(),
            pool: pool.into(),
        }
    }

    /// Create a client construction error with cluster context
    pub fn client_construction(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClientConstruction {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an unknown-provisioner error
    pub fn unknown_provisioner(name: impl Into<String>) -> Self {
        Self::UnknownProvisioner { name: name.into() }
    }

    /// Create a dangling pool reference error
    pub fn pool_not_found(app: impl Into<String>, pool: impl Into<String>) -> Self {
        Self::PoolNotFound {
            app: app.into(),
            pool: pool.into(),
        }
    }

    /// Create a no-unit-available error
    pub fn no_unit(app: impl Into<String>) -> Self {
        Self::NoUnit { app: app.into() }
    }

    /// Create a provisioner operation error with app context
    pub fn provision_for(app: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provision {
            app: app.into(),
            message: msg.into(),
        }
    }

    /// Create a storage error with the given message
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
        }
    }

    /// Create a timeout error for a cluster API call
    pub fn timeout(operation: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            cluster: cluster.into(),
        }
    }

    /// Create an internal error with the given message
    ///
    /// For simple internal errors without specific context.
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

    /// Returns true if this is the routine "no cluster bound" resolution outcome
    pub fn is_no_cluster(&self) -> bool {
        matches!(self, Error::NoCluster { .. })
    }

    /// Returns true if the underlying Kubernetes API reported a create conflict
    ///
    /// A 409 on create means a concurrent creator won the race; for idempotent
    /// operations like migration this is success-equivalent.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Resolution misses and configuration errors require an operator fix and
    /// are not retryable. Transport errors and timeouts may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry transient K8s errors, not 4xx responses
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::NoCluster { .. } => false,
            Error::ClientConstruction { .. } => false,
            Error::UnknownProvisioner { .. } => false,
            Error::PoolNotFound { .. } => false,
            Error::NoUnit { .. } => false,
            Error::Provision { .. } => true,
            Error::Storage { .. } => true,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::ClientConstruction { cluster, .. } => Some(cluster),
            Error::Timeout { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: unconfigured pools resolve to NoCluster, which operators fix
    /// by binding a cluster and re-running, never by blind retries.
    #[test]
    fn story_no_cluster_is_routine_and_not_retryable() {
        let err = Error::no_cluster("kubernetes", "kube-failed");
        assert!(err.is_no_cluster());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("kube-failed"));
        assert!(err.to_string().contains("kubernetes"));
    }

    /// Story: malformed cluster definitions abort the calling operation
    /// immediately; there is no point retrying with the same bad config.
    #[test]
    fn story_client_construction_is_fatal() {
        let err = Error::client_construction("c1", "address is not a valid URL");
        assert!(!err.is_retryable());
        assert_eq!(err.cluster(), Some("c1"));
        assert!(err.to_string().contains("c1"));
        assert!(!err.is_no_cluster());
    }

    /// Story: a create conflict means someone else already created the
    /// object, which idempotent batch operations treat as success.
    #[test]
    fn story_conflict_on_create_is_success_equivalent() {
        let conflict = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "already exists".to_string(),
                reason: "AlreadyExists".to_string(),
                code: 409,
            }),
        };
        assert!(conflict.is_conflict());

        let not_found = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            }),
        };
        assert!(!not_found.is_conflict());
    }

    #[test]
    fn test_kube_4xx_not_retryable_5xx_retryable() {
        let forbidden = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }),
        };
        assert!(!forbidden.is_retryable());

        let unavailable = Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "service unavailable".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            }),
        };
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn test_timeout_carries_cluster_context() {
        let err = Error::timeout("create app resource", "c1");
        assert!(err.is_retryable());
        assert_eq!(err.cluster(), Some("c1"));
        assert!(err.to_string().contains("create app resource"));
    }

    #[test]
    fn test_no_unit_error() {
        let err = Error::no_unit("app-a");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("app-a"));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));

        let err = Error::internal_with_context("migrate", "unexpected state");
        assert!(err.to_string().contains("[migrate]"));
    }
}
