//! Compute Engine resource types and the provider API seam
//!
//! The types mirror the subset of the Compute Engine v1 JSON resources the
//! actuator reads and writes. [`ComputeService`] is the only way the rest of
//! the crate talks to the provider, so tests swap it for a mock.
//!
//! # Supported Implementations
//!
//! - [`GceComputeClient`] - REST client for `compute.googleapis.com`

mod rest;

pub use rest::GceComputeClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::Result;

/// OAuth scope granting full cloud-platform access
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Operation status reported once an operation has finished
pub const OPERATION_STATUS_DONE: &str = "DONE";

/// Name GCE gives to an instance's primary network interface
pub const PRIMARY_INTERFACE_NAME: &str = "nic0";

/// Trait abstracting the Compute Engine API calls the actuator needs
///
/// Implementations must report absent resources as
/// [`Error::NotFound`](crate::Error::NotFound) so callers can tell "gone"
/// apart from "broken".
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Get an image by name
    async fn images_get(&self, project: &str, image: &str) -> Result<Image>;

    /// Get the latest image of an image family
    async fn images_get_from_family(&self, project: &str, family: &str) -> Result<Image>;

    /// Get an instance
    async fn instances_get(&self, project: &str, zone: &str, instance: &str) -> Result<Instance>;

    /// Start creating an instance
    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation>;

    /// Start deleting an instance
    async fn instances_delete(&self, project: &str, zone: &str, instance: &str)
        -> Result<Operation>;

    /// Get the current state of a zonal operation
    async fn zone_operations_get(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> Result<Operation>;
}

/// A VM instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance name
    #[serde(default)]
    pub name: String,
    /// Zone URL or name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    /// Partial URL of the machine type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_type: String,
    /// Allow the instance to forward packets it didn't originate
    #[serde(default)]
    pub can_ip_forward: bool,
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Attached disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<AttachedDisk>,
    /// Instance metadata (startup scripts etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Network tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Service accounts the instance runs as
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
    /// Lifecycle status (PROVISIONING, RUNNING, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl Instance {
    /// External address of the primary interface, if one is assigned
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .filter(|nic| nic.name == PRIMARY_INTERFACE_NAME)
            .flat_map(|nic| nic.access_configs.iter())
            .filter_map(|ac| ac.nat_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .last()
    }
}

/// A network interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Interface name (nic0, nic1, ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Network URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// Internal IP
    #[serde(default, rename = "networkIP", skip_serializing_if = "Option::is_none")]
    pub network_ip: Option<String>,
    /// External access configurations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_configs: Vec<AccessConfig>,
}

/// External access configuration for an interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Access type, always ONE_TO_ONE_NAT
    #[serde(rename = "type")]
    pub type_: String,
    /// Config name
    #[serde(default)]
    pub name: String,
    /// Assigned external IP
    #[serde(default, rename = "natIP", skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

/// A disk attached to an instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Delete the disk together with the instance
    #[serde(default)]
    pub auto_delete: bool,
    /// Boot disk flag
    #[serde(default)]
    pub boot: bool,
    /// Parameters for creating the disk alongside the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<AttachedDiskInitializeParams>,
}

/// Creation parameters of an attached disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskInitializeParams {
    /// Size in GiB
    #[serde(default, with = "int64_string")]
    pub disk_size_gb: i64,
    /// Partial URL of the disk type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_type: String,
    /// Image to initialise the disk from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

/// Instance metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Metadata {
    /// Key/value items
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

impl Metadata {
    /// Build metadata from a key/value map, in key order
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self {
            items: map
                .into_iter()
                .map(|(key, value)| MetadataItem {
                    key,
                    value: Some(value),
                })
                .collect(),
        }
    }

    /// Look up a metadata value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .and_then(|item| item.value.as_deref())
    }
}

/// A single metadata entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MetadataItem {
    /// Key
    pub key: String,
    /// Value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Network tags
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Tags {
    /// Tag values
    #[serde(default)]
    pub items: Vec<String>,
}

/// Service account binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceAccount {
    /// Service account email
    pub email: String,
    /// OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A disk image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image name
    #[serde(default)]
    pub name: String,
    /// Image family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    /// Full URL of the image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,
}

/// A long-running provider operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name
    #[serde(default)]
    pub name: String,
    /// Operation type (insert, delete, ...)
    #[serde(default)]
    pub operation_type: String,
    /// Zone URL
    #[serde(default)]
    pub zone: String,
    /// PENDING, RUNNING or DONE
    #[serde(default)]
    pub status: String,
    /// Optional progress description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// Progress percentage
    #[serde(default)]
    pub progress: i32,
    /// Errors, present only once the operation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl Operation {
    /// Returns true once the provider considers the operation finished
    pub fn is_done(&self) -> bool {
        self.status == OPERATION_STATUS_DONE
    }

    /// All error messages joined into one, or `None` if there are none
    pub fn error_message(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|e| format!("{}\n", e.message))
                .collect(),
        )
    }

    /// Bare zone name, as the zone field is usually a full URL
    pub fn zone_name(&self) -> &str {
        self.zone.rsplit('/').next().unwrap_or(&self.zone)
    }
}

/// Errors reported by an operation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperationError {
    /// Individual errors
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// A single operation error
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OperationErrorItem {
    /// Error code
    #[serde(default)]
    pub code: String,
    /// Error message
    #[serde(default)]
    pub message: String,
}

/// Compute Engine encodes int64 fields as JSON strings
mod int64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(i64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}
