//! Machine setup catalog
//!
//! The catalog maps an (OS, roles, versions) selector to the image an
//! instance boots from and the metadata (startup script) it is created with.
//! It is published as YAML so the in-cluster machine controller can use the
//! same catalog the installer used.
//!
//! ```yaml
//! items:
//! - machineParams:
//!   - os: ubuntu-1710
//!     roles: [Master]
//!     versions:
//!       kubelet: 1.9.4
//!       controlPlane: 1.9.4
//!   image: projects/ubuntu-os-cloud/global/images/family/ubuntu-1710
//!   metadata:
//!     startupScript: |
//!       #!/bin/bash
//! ```

use std::collections::BTreeMap;
use std::path::Path;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::crd::{MachineRole, MachineVersionInfo};
use crate::{Error, Result};

/// Metadata key the startup script is published under
pub const STARTUP_SCRIPT_METADATA_KEY: &str = "startup-script";

/// Selector used to look up a catalog entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParams {
    /// OS name from the machine provider config
    #[serde(default)]
    pub os: String,
    /// Machine roles
    #[serde(default)]
    pub roles: Vec<MachineRole>,
    /// Machine software versions
    #[serde(default)]
    pub versions: MachineVersionInfo,
}

impl ConfigParams {
    /// Selectors match regardless of role order
    fn matches(&self, other: &ConfigParams) -> bool {
        let mut ours = self.roles.clone();
        let mut theirs = other.roles.clone();
        ours.sort();
        ours.dedup();
        theirs.sort();
        theirs.dedup();
        self.os == other.os && ours == theirs && self.versions == other.versions
    }
}

/// Source of images and startup metadata for machines
#[cfg_attr(test, automock)]
pub trait MachineSetup: Send + Sync {
    /// Image reference for the selector
    fn image(&self, params: &ConfigParams) -> Result<String>;

    /// Metadata bundle for the selector
    fn metadata(&self, params: &ConfigParams) -> Result<BTreeMap<String, String>>;

    /// The whole catalog serialized for publishing
    fn to_yaml(&self) -> Result<String>;
}

/// YAML-backed machine setup catalog
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MachineSetupCatalog {
    /// Catalog entries
    #[serde(default)]
    pub items: Vec<MachineSetupItem>,
}

/// One catalog entry, shared by every selector it lists
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetupItem {
    /// Selectors served by this entry
    #[serde(default)]
    pub machine_params: Vec<ConfigParams>,
    /// Image reference
    pub image: String,
    /// Startup metadata
    #[serde(default)]
    pub metadata: SetupMetadata,
}

/// Startup metadata of a catalog entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetupMetadata {
    /// Script run on first boot
    #[serde(default)]
    pub startup_script: String,
}

impl MachineSetupCatalog {
    /// Parse a catalog from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::setup(format!("invalid machine setup catalog: {}", e)))
    }

    /// Read a catalog from a YAML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::setup(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    fn find(&self, params: &ConfigParams) -> Result<&MachineSetupItem> {
        self.items
            .iter()
            .find(|item| item.machine_params.iter().any(|p| p.matches(params)))
            .ok_or_else(|| {
                Error::setup(format!(
                    "no machine setup entry for os {:?}, roles {:?}, versions {:?}",
                    params.os, params.roles, params.versions
                ))
            })
    }
}

impl MachineSetup for MachineSetupCatalog {
    fn image(&self, params: &ConfigParams) -> Result<String> {
        Ok(self.find(params)?.image.clone())
    }

    fn metadata(&self, params: &ConfigParams) -> Result<BTreeMap<String, String>> {
        let item = self.find(params)?;
        let mut metadata = BTreeMap::new();
        if !item.metadata.startup_script.is_empty() {
            metadata.insert(
                STARTUP_SCRIPT_METADATA_KEY.to_string(),
                item.metadata.startup_script.clone(),
            );
        }
        Ok(metadata)
    }

    fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}
