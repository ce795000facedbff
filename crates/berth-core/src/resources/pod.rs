//! Placement helpers for k8s `Pod` objects

use super::ResourceQuantities;
use crate::Result;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Sum of the CPU and memory requests of every container in the pod.
/// Recomputed from the spec on every call, never stored.
pub fn pod_demand(pod: &Pod) -> Result<ResourceQuantities> {
    let mut total = ResourceQuantities::default();

    let Some(spec) = &pod.spec else {
        return Ok(total);
    };

    for container in &spec.containers {
        if let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
            total = total + ResourceQuantities::from_resource_map(requests)?;
        }
    }

    Ok(total)
}

/// Node selector labels of the pod (empty when unset)
pub fn pod_node_selector(pod: &Pod) -> BTreeMap<String, String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_selector.clone())
        .unwrap_or_default()
}

/// Node the pod is bound to, if any
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

/// A pod awaits provisioning until it is bound to a node. Pods that already
/// reached a terminal phase are never placed.
pub fn is_awaiting_provisioning(pod: &Pod) -> bool {
    if pod.spec.is_none() || pod_node_name(pod).is_some() {
        return false;
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn container(memory: &str) -> Container {
        let mut requests = BTreeMap::new();
        requests.insert("memory".to_string(), Quantity(memory.to_string()));
        Container {
            name: "c".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn create_test_pod(memories: &[&str]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web".to_string());
        pod.spec = Some(PodSpec {
            containers: memories.iter().map(|m| container(m)).collect(),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_pod_demand_sums_containers() {
        let pod = create_test_pod(&["256Mi", "512Mi"]);
        let demand = pod_demand(&pod).unwrap();
        assert_eq!(demand.memory_bytes, 768 * 1024 * 1024);
        assert_eq!(demand.cpu_millicores, 0);
    }

    #[test]
    fn test_pod_demand_without_requests() {
        let mut pod = create_test_pod(&[]);
        pod.spec.as_mut().unwrap().containers.push(Container::default());
        assert_eq!(pod_demand(&pod).unwrap(), ResourceQuantities::default());
    }

    #[test]
    fn test_awaiting_provisioning() {
        let mut pod = create_test_pod(&["1Mi"]);
        assert!(is_awaiting_provisioning(&pod));

        pod.spec.as_mut().unwrap().node_name = Some("node-a".to_string());
        assert!(!is_awaiting_provisioning(&pod));
        assert_eq!(pod_node_name(&pod), Some("node-a"));

        let mut finished = create_test_pod(&["1Mi"]);
        finished.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!is_awaiting_provisioning(&finished));
    }
}
