//! Berth Core - resource model for the Berth control plane
//!
//! This crate provides:
//! - Node, Volume, Ingress and Cluster resources (plus k8s Pod/Namespace)
//! - The `Resource` trait and storage keys
//! - Resource quantity parsing
//! - Error types with miette diagnostics

pub mod error;
pub mod events;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use events::{WatchEvent, WatchEventType};
pub use resources::pod::{is_awaiting_provisioning, pod_demand, pod_node_name, pod_node_selector};
pub use resources::{
    is_valid_name, Cluster, ClusterSpec, Ingress, IngressSpec, IngressStatus, Node, NodePhase,
    NodeResources, NodeSpec, NodeStatus, Resource, ResourceError, ResourceQuantities, Selector,
    Volume, VolumeCapacity, VolumePhase, VolumeSpec, VolumeStatus, BERTH_API_VERSION,
    DEFAULT_NAMESPACE,
};
pub use types::{GroupVersionKind, ResourceKey};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Namespace, Pod};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a resource to YAML
pub fn to_yaml<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_yaml::to_string(resource).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from YAML
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_manifest_from_yaml() {
        let manifest = r#"
metadata:
  name: berth
spec:
  description: lab cluster
  podCidr: 10.88.0.0/16
"#;
        let cluster: Cluster = from_yaml(manifest).unwrap();
        assert_eq!(cluster.metadata.name.as_deref(), Some("berth"));
        assert_eq!(cluster.spec.pod_cidr, "10.88.0.0/16");
        assert_eq!(cluster.spec.description.as_deref(), Some("lab cluster"));
    }

    #[test]
    fn test_node_yaml_roundtrip() {
        let node = Node::new("node-a", NodeResources::new(2000, 4096, 0));
        let yaml = to_yaml(&node).unwrap();
        assert!(yaml.contains("node-a"));

        let back: Node = from_yaml(&yaml).unwrap();
        assert_eq!(back, node);
    }
}
