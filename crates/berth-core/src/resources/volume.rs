use super::{ResourceQuantities, Resource, Selector, BERTH_API_VERSION};
use crate::Result;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// A storage volume placed on a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VolumeSpec,
    #[serde(default)]
    pub status: VolumeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub capacity: VolumeCapacity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapacity {
    /// Requested size as a quantity ("10Gi")
    #[serde(default)]
    pub storage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Node the volume has been placed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default)]
    pub phase: VolumePhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumePhase {
    #[default]
    Pending,
    Bound,
    Released,
}

impl Volume {
    pub fn new(namespace: &str, name: &str, storage: &str) -> Self {
        let mut volume = Volume::default();
        volume.metadata.name = Some(name.to_string());
        volume.metadata.namespace = Some(namespace.to_string());
        volume.spec.capacity.storage = storage.to_string();
        volume
    }

    /// Requested capacity in bytes. An empty capacity requests nothing.
    pub fn storage_bytes(&self) -> Result<i64> {
        if self.spec.capacity.storage.is_empty() {
            return Ok(0);
        }
        ResourceQuantities::parse_bytes(&self.spec.capacity.storage)
    }
}

impl Resource for Volume {
    const API_VERSION: &'static str = BERTH_API_VERSION;
    const KIND: &'static str = "Volume";
    const NAMESPACED: bool = true;

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
    fn test_storage_bytes() {
        let volume = Volume::new("default", "data", "10Gi");
        assert_eq!(volume.storage_bytes().unwrap(), 10 * 1024 * 1024 * 1024);

        let empty = Volume::new("default", "scratch", "");
        assert_eq!(empty.storage_bytes().unwrap(), 0);

        let bad = Volume::new("default", "bad", "ten gigs");
        assert!(bad.storage_bytes().is_err());
    }

    #[test]
    fn test_volume_key_is_namespaced() {
        let volume = Volume::new("team-a", "data", "1Gi");
        let key = volume.resource_key().unwrap();
        assert_eq!(key.storage_key(), "berth.io/v1/Volume/team-a/data");
    }
}
