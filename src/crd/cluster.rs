//! Cluster Custom Resource Definition
//!
//! The Cluster is shared context for all of its Machines. The actuator only
//! reads it: the provider config names the GCE project and the status lists
//! the API endpoints worker nodes join through.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ProviderConfig;
use crate::error::MachineStatusError;

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Opaque provider-specific configuration
    #[serde(default)]
    pub provider_config: ProviderConfig,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Externally reachable API server endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<ApiEndpoint>,

    /// Reason for the last terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineStatusError>,

    /// Message for the last terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An API server endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Hostname or IP
    pub host: String,
    /// Port
    pub port: u16,
}

impl Cluster {
    /// The first reachable API endpoint as `host:port`
    pub fn first_api_endpoint(&self) -> Option<String> {
        self.status
            .as_ref()
            .and_then(|s| s.api_endpoints.first())
            .map(|ep| format!("{}:{}", ep.host, ep.port))
    }
}
