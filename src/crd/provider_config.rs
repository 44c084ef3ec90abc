//! GCE provider configuration and its codec
//!
//! Machines and Clusters carry provider configs as opaque versioned blobs.
//! [`GceProviderConfigCodec`] checks the blob's `apiVersion`/`kind` and
//! decodes it into the strongly typed GCE config. Decode failures are
//! permanent configuration errors: retrying won't fix a malformed spec.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// API version of the GCE provider config blobs
pub const GCE_PROVIDER_CONFIG_API_VERSION: &str = "gceproviderconfig/v1alpha1";

/// Opaque provider config attached to Machines and Clusters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderConfig {
    /// Inline provider config object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl ProviderConfig {
    /// Wrap an already-encoded provider config object
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

/// GCE configuration of a single machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceMachineProviderConfig {
    /// Zone the instance lives in (e.g. "us-central1-f")
    #[serde(default)]
    pub zone: String,
    /// Machine type name (e.g. "n1-standard-1")
    #[serde(default)]
    pub machine_type: String,
    /// OS selector for the setup catalog
    #[serde(default)]
    pub os: String,
    /// Attached disks; the first one is the boot disk
    #[serde(default)]
    pub disks: Vec<Disk>,
}

/// A disk attached to an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Creation parameters
    #[serde(default)]
    pub initialize_params: DiskInitializeParams,
}

/// Disk creation parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskInitializeParams {
    /// Size in GiB
    #[serde(default)]
    pub disk_size_gb: i64,
    /// Disk type name (e.g. "pd-standard")
    #[serde(default)]
    pub disk_type: String,
}

/// GCE configuration shared by the whole cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GceClusterProviderConfig {
    /// GCE project id
    #[serde(default)]
    pub project: String,
}

/// Decoder for GCE provider config blobs
#[derive(Clone, Debug, Default)]
pub struct GceProviderConfigCodec;

impl GceProviderConfigCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }

    /// Decode a Machine's provider config
    pub fn decode_machine(&self, config: &ProviderConfig) -> Result<GceMachineProviderConfig> {
        self.decode(config, "GCEMachineProviderConfig")
    }

    /// Decode a Cluster's provider config
    pub fn decode_cluster(&self, config: &ProviderConfig) -> Result<GceClusterProviderConfig> {
        self.decode(config, "GCEClusterProviderConfig")
    }

    /// Encode a Machine provider config into a blob
    pub fn encode_machine(&self, config: &GceMachineProviderConfig) -> Result<ProviderConfig> {
        self.encode(config, "GCEMachineProviderConfig")
    }

    /// Encode a Cluster provider config into a blob
    pub fn encode_cluster(&self, config: &GceClusterProviderConfig) -> Result<ProviderConfig> {
        self.encode(config, "GCEClusterProviderConfig")
    }

    fn decode<T: DeserializeOwned>(&self, config: &ProviderConfig, kind: &str) -> Result<T> {
        let value = config
            .value
            .as_ref()
            .ok_or_else(|| Error::provider_config("providerConfig.value is not set"))?;

        let found_version = value.get("apiVersion").and_then(|v| v.as_str());
        if found_version != Some(GCE_PROVIDER_CONFIG_API_VERSION) {
            return Err(Error::provider_config(format!(
                "unsupported apiVersion {:?}, expected {:?}",
                found_version.unwrap_or_default(),
                GCE_PROVIDER_CONFIG_API_VERSION
            )));
        }

        let found_kind = value.get("kind").and_then(|v| v.as_str());
        if found_kind != Some(kind) {
            return Err(Error::provider_config(format!(
                "unexpected kind {:?}, expected {:?}",
                found_kind.unwrap_or_default(),
                kind
            )));
        }

        serde_json::from_value(value.clone())
            .map_err(|e| Error::provider_config(format!("cannot decode {}: {}", kind, e)))
    }

    fn encode<T: Serialize>(&self, config: &T, kind: &str) -> Result<ProviderConfig> {
        let mut value =
            serde_json::to_value(config).map_err(|e| Error::serialization(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "apiVersion".to_string(),
                GCE_PROVIDER_CONFIG_API_VERSION.into(),
            );
            obj.insert("kind".to_string(), kind.into());
        }
        Ok(ProviderConfig::from_value(value))
    }
}
