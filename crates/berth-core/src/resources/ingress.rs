use super::{Resource, BERTH_API_VERSION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// An ingress server fronting cluster traffic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingress {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IngressSpec,
    #[serde(default)]
    pub status: IngressStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressSpec {
    /// Public address the ingress answers on
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressStatus {
    #[serde(default)]
    pub ready: bool,
}

impl Ingress {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        let mut ingress = Ingress::default();
        ingress.metadata.name = Some(name.into());
        ingress.spec.host = host.into();
        ingress
    }
}

impl Resource for Ingress {
    const API_VERSION: &'static str = BERTH_API_VERSION;
    const KIND: &'static str = "Ingress";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
