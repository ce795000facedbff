// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// The cluster state refused or failed the lease
    #[error("Lease failed: {0}")]
    #[diagnostic(
        code(scheduler::lease_failed),
        help("Check node capacity, labels and the pod's node selector")
    )]
    LeaseFailed(#[from] berth_state::StateError),

    /// The provisioner could not start the pod on its node
    #[error("Provisioning pod {pod} on node {node} failed: {message}")]
    #[diagnostic(
        code(scheduler::provisioning_failed),
        help("The lease was released. The pod is retried on the next resume or update")
    )]
    ProvisioningFailed {
        pod: String,
        node: String,
        message: String,
    },

    /// Storage error
    #[error("Storage error: {0}")]
    #[diagnostic(
        code(scheduler::storage_error),
        help("Check the underlying storage system")
    )]
    StorageError(#[from] berth_storage::StorageError),

    /// Core error
    #[error("Core error: {0}")]
    #[diagnostic(code(scheduler::core_error), help("This is an internal error"))]
    CoreError(#[from] berth_core::CoreError),

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError { message: String },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a ProvisioningFailed error
    pub fn provisioning_failed(
        pod: impl Into<String>,
        node: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ProvisioningFailed {
            pod: pod.into(),
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
