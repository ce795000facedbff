pub mod cluster;
pub mod ingress;
pub mod node;
pub mod pod;
pub mod quantities;
pub mod selector;
pub mod volume;

pub use cluster::{Cluster, ClusterSpec};
pub use ingress::{Ingress, IngressSpec, IngressStatus};
pub use node::{Node, NodePhase, NodeResources, NodeSpec, NodeStatus};
pub use quantities::ResourceQuantities;
pub use selector::Selector;
pub use volume::{Volume, VolumeCapacity, VolumePhase, VolumeSpec, VolumeStatus};

use crate::{GroupVersionKind, ResourceKey};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// API version shared by the Berth-native kinds
pub const BERTH_API_VERSION: &str = "berth.io/v1";

/// Namespace assumed for namespaced objects that do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    match &metadata.name {
        None => Err(ResourceError::MissingField("metadata.name".to_string())),
        Some(name) if !is_valid_name(name) => Err(ResourceError::InvalidName(name.clone())),
        Some(_) => Ok(()),
    }
}

/// A stored, watchable object.
///
/// `metadata.resource_version` holds the store revision at which the object
/// was last written; objects built in memory carry none.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const API_VERSION: &'static str;
    const KIND: &'static str;
    const NAMESPACED: bool;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    /// Object name, or "<unknown>" for unnamed objects (logging only)
    fn display_name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or("<unknown>")
    }

    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let name = self
            .metadata()
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;

        if Self::NAMESPACED {
            let namespace = self
                .metadata()
                .namespace
                .as_deref()
                .unwrap_or(DEFAULT_NAMESPACE);
            Ok(ResourceKey::new(Self::gvk(), namespace, name))
        } else {
            Ok(ResourceKey::cluster_scoped(Self::gvk(), name))
        }
    }

    /// Store revision this object was read at
    fn revision(&self) -> Option<u64> {
        self.metadata()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
    }

    fn set_revision(&mut self, revision: u64) {
        self.metadata_mut().resource_version = Some(revision.to_string());
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    let first = name.chars().next().is_some_and(alnum);
    let last = name.chars().last().is_some_and(alnum);

    first && last && name.chars().all(|c| alnum(c) || c == '-' || c == '.')
}

impl Resource for Pod {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Pod";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(&self.metadata)?;

        match &self.spec {
            Some(spec) if spec.containers.is_empty() => Err(ResourceError::ValidationFailed(
                "Pod must have at least one container".to_string(),
            )),
            Some(_) => Ok(()),
            None => Err(ResourceError::MissingField("spec".to_string())),
        }
    }
}

impl Resource for Namespace {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Namespace";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
