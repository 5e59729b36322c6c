//! Error handling in [`kube_broker`][crate]
//!
//! Every failure in the broker is one of a closed set of kinds, constructed at
//! the point of failure with the structured context a log consumer needs.
//! Two surfaces exist per error: the [`Display`](std::fmt::Display) message is
//! the detailed internal one, while [`Error::user_message`] computes the
//! sanitized sentence shown to end users. Host fields are sanitized with
//! [`crate::sanitize::sanitize_host`] before they are stored here, so neither
//! surface ever carries a literal IP address.
use std::time::Duration;

use thiserror::Error;
use tower::BoxError;

/// The single external message for every cluster-related failure.
///
/// Collapsing not-found, missing-secret, parse, connection and TLS failures
/// into one opaque sentence prevents a caller from enumerating which clusters
/// exist on the management cluster.
pub const USER_MESSAGE_CLUSTER: &str = "cluster access denied or unavailable";

/// Possible errors when brokering cluster clients
#[derive(Error, Debug)]
pub enum Error {
    /// The requested CAPI cluster could not be located on the management cluster
    #[error("cluster {cluster} not found: {reason}")]
    ClusterNotFound {
        /// Requested cluster name
        cluster: String,
        /// Why the lookup failed (summarized, no stack)
        reason: String,
    },

    /// The `<cluster>-kubeconfig` secret does not exist in the cluster's namespace
    #[error("kubeconfig secret for cluster {cluster} not found in namespace {namespace}")]
    KubeconfigMissing {
        /// Requested cluster name
        cluster: String,
        /// Namespace established by CAPI discovery
        namespace: String,
    },

    /// The kubeconfig secret exists but could not be read or parsed
    #[error("kubeconfig for cluster {cluster} invalid: {reason}")]
    KubeconfigInvalid {
        /// Requested cluster name
        cluster: String,
        /// What was wrong (key names only, never payloads)
        reason: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The target cluster's API server could not be reached
    #[error("connection to cluster {cluster} at {host} failed")]
    ConnectionFailed {
        /// Requested cluster name
        cluster: String,
        /// Sanitized host of the target API server
        host: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The connection validation deadline elapsed
    #[error("connection to cluster {cluster} at {host} timed out after {timeout:?}")]
    ConnectionTimeout {
        /// Requested cluster name
        cluster: String,
        /// Sanitized host of the target API server
        host: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The TLS handshake with the target cluster failed
    #[error("TLS handshake with cluster {cluster} at {host} failed: {reason}")]
    TlsFailed {
        /// Requested cluster name
        cluster: String,
        /// Sanitized host of the target API server
        host: String,
        /// Matched TLS sub-kind ("certificate has expired", "signed by unknown authority", "hostname mismatch") or a summary
        reason: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },

    /// Building the impersonating client failed
    #[error("impersonation setup for {user_hash} on cluster {cluster} failed: {reason}")]
    ImpersonationFailed {
        /// Anonymized caller identifier
        user_hash: String,
        /// Requested cluster name
        cluster: String,
        /// What went wrong
        reason: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },

    /// The target cluster denied the requested operation
    #[error("access denied on cluster {cluster}: {verb} {resource}: {reason}")]
    AccessDenied {
        /// Requested cluster name
        cluster: String,
        /// Verb of the denied operation
        verb: String,
        /// Resource of the denied operation
        resource: String,
        /// Reason reported by the target cluster, if any
        reason: String,
    },

    /// The access review request itself failed
    #[error("access check on cluster {cluster} failed")]
    AccessCheckFailed {
        /// Requested cluster name
        cluster: String,
        /// Underlying cause
        #[source]
        source: BoxError,
    },

    /// The access check descriptor was malformed
    #[error("invalid access check: {reason}")]
    InvalidAccessCheck {
        /// What was wrong with the descriptor
        reason: String,
    },

    /// The broker has been shut down
    #[error("broker is closed")]
    BrokerClosed,

    /// A structural check on caller input failed
    #[error("validation of {field} failed: {reason} (value: {preview})")]
    ValidationFailed {
        /// Which input failed ("user", "groups", "extras", "cluster name", ...)
        field: &'static str,
        /// Safely truncated preview of the offending value
        preview: String,
        /// Sub-reason for the rejection
        reason: String,
    },

    /// The caller exceeded the privileged-access rate limit
    #[error("rate limit exceeded for {user_hash}")]
    RateLimited {
        /// Anonymized caller identifier
        user_hash: String,
    },

    /// A privileged client was required but unavailable, and strict mode forbids fallback
    #[error("privileged client required for {operation} but unavailable in strict mode")]
    StrictPrivilegedRequired {
        /// The sub-step that needed the privileged client
        operation: &'static str,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    /// The single sanitized sentence shown to end users.
    ///
    /// Never contains a cluster name, namespace, secret name, host, or user
    /// identifier. Callers are expected to log the [`Display`](std::fmt::Display)
    /// form internally and present only this.
    pub fn user_message(&self) -> String {
        match self {
            Error::ClusterNotFound { .. }
            | Error::KubeconfigMissing { .. }
            | Error::KubeconfigInvalid { .. }
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout { .. }
            | Error::TlsFailed { .. }
            | Error::StrictPrivilegedRequired { .. } => USER_MESSAGE_CLUSTER.to_string(),
            Error::ImpersonationFailed { .. } => {
                "unable to act on your behalf: contact your administrator to verify your RBAC permissions"
                    .to_string()
            }
            Error::AccessDenied { .. } => "access denied for the requested operation".to_string(),
            Error::AccessCheckFailed { .. } => {
                "unable to verify access for the requested operation".to_string()
            }
            Error::InvalidAccessCheck { .. } => "invalid access check request".to_string(),
            Error::BrokerClosed => "service is shutting down".to_string(),
            Error::ValidationFailed { field, .. } => format!("invalid {field} provided"),
            Error::RateLimited { .. } => "rate limit exceeded, try again later".to_string(),
        }
    }

    /// Whether this error concerns the target cluster (and therefore collapses
    /// to [`USER_MESSAGE_CLUSTER`] externally).
    pub fn is_cluster_related(&self) -> bool {
        matches!(
            self,
            Error::ClusterNotFound { .. }
                | Error::KubeconfigMissing { .. }
                | Error::KubeconfigInvalid { .. }
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::TlsFailed { .. }
                | Error::StrictPrivilegedRequired { .. }
        )
    }

    /// Whether this is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    /// Whether this is a structural validation failure.
    pub fn is_validation_failed(&self) -> bool {
        matches!(self, Error::ValidationFailed { .. })
    }

    /// Whether strict mode blocked a privileged-path fallback.
    pub fn is_strict_privileged_required(&self) -> bool {
        matches!(self, Error::StrictPrivilegedRequired { .. })
    }
}
