// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

/// Cluster state error type
#[derive(Error, Debug, Diagnostic)]
pub enum StateError {
    /// A lease or release named a node the ledger does not hold
    #[error("Node not found: {name}")]
    #[diagnostic(
        code(state::node_not_found),
        help("The node may have been removed. List nodes to see what the ledger currently holds")
    )]
    NodeNotFound { name: String },

    /// No node passed the selector and schedulability filters
    #[error("No node matches the request: {reason}")]
    #[diagnostic(
        code(state::no_matching_node),
        help("Check the selector labels against the node labels, and that nodes are Ready and not cordoned")
    )]
    NoMatchingNode { reason: String },

    /// Matching nodes exist but none has room
    #[error("No matching node has room for the request: {reason}")]
    #[diagnostic(
        code(state::no_resource_available),
        help("Release existing leases or add capacity to the cluster")
    )]
    NoResourceAvailable { reason: String },

    /// The watch could not be resumed from the last known revision
    #[error("Watch on {kind} could not resume from revision {revision}: {reason}")]
    #[diagnostic(
        code(state::watch_resume_failed),
        help("The subscriber re-lists and restarts the watch. Persistent failures point at the storage backend")
    )]
    WatchResumeFailed {
        kind: String,
        revision: u64,
        reason: String,
    },

    /// A lease decision could not be persisted
    #[error("Storage backend unavailable: {message}")]
    #[diagnostic(
        code(state::backend_unavailable),
        help("The ledger was rolled back. Retry once the storage backend is healthy")
    )]
    BackendUnavailable { message: String },

    /// Malformed lease or release request
    #[error("Invalid request: {message}")]
    #[diagnostic(code(state::invalid_request), help("{suggestion}"))]
    InvalidRequest { message: String, suggestion: String },

    /// Release of an object that was never placed on a node
    #[error("{kind} {name} is not bound to a node")]
    #[diagnostic(
        code(state::not_bound),
        help("Only objects that were placed on a node can be released")
    )]
    NotBound { kind: String, name: String },

    /// The caller stopped waiting for the coordinator
    #[error("Lease request timed out after {timeout:?}")]
    #[diagnostic(
        code(state::lease_timeout),
        help("The request may still complete. Inspect the node before retrying")
    )]
    LeaseTimeout { timeout: Duration },

    /// The coordinator task is no longer running
    #[error("Cluster state coordinator has stopped")]
    #[diagnostic(
        code(state::coordinator_stopped),
        help("The cluster state was shut down. Start a new one")
    )]
    CoordinatorStopped,

    /// IP pool exhausted
    #[error("IPAM pool exhausted: no free addresses in {cidr}")]
    #[diagnostic(
        code(state::ipam_pool_exhausted),
        help("Expand the pod CIDR range or release unused allocations")
    )]
    IpamPoolExhausted { cidr: String },

    /// Storage error
    #[error("Storage error: {0}")]
    #[diagnostic(
        code(state::storage_error),
        help("Check the underlying storage system")
    )]
    Storage(#[from] berth_storage::StorageError),

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(state::core_error), help("This is an internal error"))]
    Core(#[from] berth_core::CoreError),
}

/// Result type for cluster state operations
pub type Result<T> = std::result::Result<T, StateError>;

impl StateError {
    pub fn node_not_found(name: impl Into<String>) -> Self {
        Self::NodeNotFound { name: name.into() }
    }

    pub fn no_matching_node(reason: impl Into<String>) -> Self {
        Self::NoMatchingNode {
            reason: reason.into(),
        }
    }

    pub fn no_resource_available(reason: impl Into<String>) -> Self {
        Self::NoResourceAvailable {
            reason: reason.into(),
        }
    }

    pub fn watch_resume_failed(kind: impl Into<String>, revision: u64, reason: impl Into<String>) -> Self {
        Self::WatchResumeFailed {
            kind: kind.into(),
            revision,
            reason: reason.into(),
        }
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn not_bound(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotBound {
            kind: kind.into(),
            name: name.into(),
        }
    }
}
