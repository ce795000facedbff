use crate::{Result, SchedulerError};
use async_trait::async_trait;
use berth_core::{Node, Pod, Resource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Starts a leased pod on its node
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, pod: &Pod, node: &Node) -> Result<()>;
}

/// A recorded `provision` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionCall {
    /// `namespace/name`
    pub pod: String,
    pub node: String,
}

/// Provisioner that records calls instead of starting anything
#[derive(Default)]
pub struct MockProvisioner {
    calls: Arc<RwLock<Vec<ProvisionCall>>>,
    failing: AtomicBool,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<ProvisionCall> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, pod: &Pod, node: &Node) -> Result<()> {
        let key = pod
            .resource_key()
            .map_err(|e| SchedulerError::internal_error(e.to_string()))?;
        let call = ProvisionCall {
            pod: format!("{}/{}", key.namespace, key.name),
            node: node.name().to_string(),
        };

        self.calls.write().await.push(call.clone());

        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::provisioning_failed(
                call.pod,
                call.node,
                "mock provisioner set to fail",
            ));
        }

        info!("Provisioned pod {} on node {}", call.pod, call.node);
        Ok(())
    }
}
