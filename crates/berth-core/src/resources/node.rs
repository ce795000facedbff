use super::{Resource, BERTH_API_VERSION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A worker node and its resource accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Cordoned nodes keep their leases but accept no new ones
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub phase: NodePhase,
    /// Total resources the node offers
    #[serde(default)]
    pub capacity: NodeResources,
    /// Sum of all active leases on this node
    #[serde(default)]
    pub allocated: NodeResources,
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Ready,
    NotReady,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePhase::Ready => write!(f, "Ready"),
            NodePhase::NotReady => write!(f, "NotReady"),
        }
    }
}

/// A resource vector: CPU, memory and storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    #[serde(default)]
    pub cpu_millicores: i64,
    #[serde(default)]
    pub memory_bytes: i64,
    #[serde(default)]
    pub storage_bytes: i64,
}

impl NodeResources {
    pub fn new(cpu_millicores: i64, memory_bytes: i64, storage_bytes: i64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
            storage_bytes,
        }
    }

    /// True when every dimension of `self` is at most the one in `other`
    pub fn fits_within(&self, other: &NodeResources) -> bool {
        self.cpu_millicores <= other.cpu_millicores
            && self.memory_bytes <= other.memory_bytes
            && self.storage_bytes <= other.storage_bytes
    }

    pub fn is_negative(&self) -> bool {
        self.cpu_millicores < 0 || self.memory_bytes < 0 || self.storage_bytes < 0
    }

    /// Component-wise subtraction floored at zero
    pub fn saturating_sub(&self, other: &NodeResources) -> NodeResources {
        NodeResources {
            cpu_millicores: (self.cpu_millicores - other.cpu_millicores).max(0),
            memory_bytes: (self.memory_bytes - other.memory_bytes).max(0),
            storage_bytes: (self.storage_bytes - other.storage_bytes).max(0),
        }
    }

    pub fn saturating_add(&self, other: &NodeResources) -> NodeResources {
        NodeResources {
            cpu_millicores: self.cpu_millicores.saturating_add(other.cpu_millicores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_add(other.storage_bytes),
        }
    }
}

impl fmt::Display for NodeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m memory={} storage={}",
            self.cpu_millicores,
            super::ResourceQuantities::format_bytes(self.memory_bytes),
            super::ResourceQuantities::format_bytes(self.storage_bytes)
        )
    }
}

impl Node {
    /// Create a ready node with the given capacity and nothing allocated
    pub fn new(name: impl Into<String>, capacity: NodeResources) -> Self {
        let mut node = Node::default();
        node.metadata.name = Some(name.into());
        node.status.capacity = capacity;
        node
    }

    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels = Some(
            labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect::<BTreeMap<_, _>>(),
        );
        self
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.labels.as_ref()
    }

    /// Capacity minus what is already leased
    pub fn allocatable(&self) -> NodeResources {
        self.status.capacity.saturating_sub(&self.status.allocated)
    }

    pub fn is_schedulable(&self) -> bool {
        self.status.phase == NodePhase::Ready && !self.spec.unschedulable
    }
}

impl Resource for Node {
    const API_VERSION: &'static str = BERTH_API_VERSION;
    const KIND: &'static str = "Node";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocatable() {
        let mut node = Node::new("node-a", NodeResources::new(4000, 1024, 2048));
        node.status.allocated = NodeResources::new(1000, 600, 0);

        assert_eq!(node.allocatable(), NodeResources::new(3000, 424, 2048));
    }

    #[test]
    fn test_saturating_sub_floors_at_zero() {
        let a = NodeResources::new(100, 100, 100);
        let b = NodeResources::new(50, 200, 100);
        assert_eq!(a.saturating_sub(&b), NodeResources::new(50, 0, 0));
    }

    #[test]
    fn test_fits_within() {
        let request = NodeResources::new(0, 512, 0);
        assert!(request.fits_within(&NodeResources::new(0, 512, 0)));
        assert!(!request.fits_within(&NodeResources::new(0, 511, 10)));
    }

    #[test]
    fn test_schedulable() {
        let mut node = Node::new("node-a", NodeResources::default());
        assert!(node.is_schedulable());

        node.spec.unschedulable = true;
        assert!(!node.is_schedulable());

        node.spec.unschedulable = false;
        node.status.phase = NodePhase::NotReady;
        assert!(!node.is_schedulable());
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::new("node-a", NodeResources::new(2000, 1024, 0)).with_labels([("disk", "ssd")]);
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["metadata"]["name"], "node-a");
        assert_eq!(json["status"]["capacity"]["memoryBytes"], 1024);
        assert_eq!(json["status"]["phase"], "Ready");
        assert_eq!(json["metadata"]["labels"]["disk"], "ssd");
    }
}
