use super::{Resource, ResourceError, BERTH_API_VERSION};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};

/// Cluster-wide identity record. There is exactly one per store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Address range pod IPs are drawn from
    #[serde(default)]
    pub pod_cidr: String,
}

impl Cluster {
    /// Build a fresh cluster record stamped with a uid and creation time
    pub fn new(name: impl Into<String>, pod_cidr: impl Into<String>) -> Self {
        let mut cluster = Cluster::default();
        cluster.metadata.name = Some(name.into());
        cluster.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        cluster.metadata.creation_timestamp = Some(Time(Utc::now()));
        cluster.spec.pod_cidr = pod_cidr.into();
        cluster
    }
}

impl Resource for Cluster {
    const API_VERSION: &'static str = BERTH_API_VERSION;
    const KIND: &'static str = "Cluster";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        super::validate_base(&self.metadata)?;
        if self.spec.pod_cidr.is_empty() {
            return Err(ResourceError::MissingField("spec.podCidr".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cluster_is_stamped() {
        let cluster = Cluster::new("berth", "10.88.0.0/16");
        assert!(cluster.metadata.uid.is_some());
        assert!(cluster.metadata.creation_timestamp.is_some());
        assert!(cluster.validate().is_ok());
    }

    #[test]
    fn test_cluster_requires_cidr() {
        let cluster = Cluster::new("berth", "");
        assert!(matches!(
            cluster.validate(),
            Err(ResourceError::MissingField(_))
        ));
    }
}
