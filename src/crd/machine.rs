//! Machine Custom Resource Definition
//!
//! A Machine is the desired state of a single cluster node. The actuator reads
//! its spec, records the last provisioned spec in its status and stores the
//! instance identity in its annotations.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ProviderConfig;
use crate::error::MachineStatusError;
use crate::{NAME_ANNOTATION_KEY, PROJECT_ANNOTATION_KEY, ZONE_ANNOTATION_KEY};

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Kubelet","type":"string","jsonPath":".spec.versions.kubelet"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.errorReason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Metadata to apply to the Node backed by this machine
    #[serde(default)]
    pub metadata: NodeMetadata,

    /// Opaque provider-specific configuration
    #[serde(default)]
    pub provider_config: ProviderConfig,

    /// Roles this machine plays in the cluster
    #[serde(default)]
    pub roles: Vec<MachineRole>,

    /// Software versions installed on the machine
    #[serde(default)]
    pub versions: MachineVersionInfo,
}

/// Labels and annotations propagated to the Node object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Node labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Node annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Role a machine plays in the cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineRole {
    /// Control-plane node
    Master,
    /// Worker node
    Node,
}

/// Versions of the node software
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Kubelet version (e.g. "1.9.4")
    #[serde(default)]
    pub kubelet: String,
    /// Control plane version, only meaningful for masters
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane: String,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// The machine as it was last provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<AppliedMachine>,

    /// Reason for the last terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<MachineStatusError>,

    /// Message for the last terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Last time the status was written (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Snapshot of the name and spec that were last provisioned
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMachine {
    /// Machine name at provisioning time
    pub name: String,
    /// Machine spec at provisioning time
    pub spec: MachineSpec,
}

impl AppliedMachine {
    /// Snapshot a machine. Status is never part of the snapshot.
    pub fn from_machine(machine: &Machine) -> Self {
        Self {
            name: machine.name_any(),
            spec: machine.spec.clone(),
        }
    }

    /// Returns true if the applied snapshot is for a control-plane node
    pub fn is_master(&self) -> bool {
        self.spec.is_master()
    }
}

/// The fields needed to locate a machine's instance
#[derive(Clone, Debug, PartialEq)]
pub struct MachineIdentity {
    /// Instance name
    pub name: String,
    /// Provider config giving the instance's zone
    pub provider_config: ProviderConfig,
}

impl MachineIdentity {
    /// Identity derived from the machine's current spec
    pub fn from_machine(machine: &Machine) -> Self {
        Self {
            name: machine.name_any(),
            provider_config: machine.spec.provider_config.clone(),
        }
    }
}

/// Extract the lookup identity from a previously recorded status
///
/// Returns `None` when nothing has been provisioned yet.
pub fn derive_identity_machine(status: &MachineStatus) -> Option<MachineIdentity> {
    status.last_applied.as_ref().map(|applied| MachineIdentity {
        name: applied.name.clone(),
        provider_config: applied.spec.provider_config.clone(),
    })
}

impl MachineSpec {
    /// Returns true if this machine is a control-plane node
    pub fn is_master(&self) -> bool {
        self.roles.contains(&MachineRole::Master)
    }
}

impl Machine {
    /// Returns true if this machine is a control-plane node
    pub fn is_master(&self) -> bool {
        self.spec.is_master()
    }

    /// The `(project, zone, name)` identity annotations, if all three are set
    pub fn identity_annotations(&self) -> Option<(String, String, String)> {
        let annotations = self.metadata.annotations.as_ref()?;
        let get = |key: &str| {
            annotations
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
        };
        Some((
            get(PROJECT_ANNOTATION_KEY)?,
            get(ZONE_ANNOTATION_KEY)?,
            get(NAME_ANNOTATION_KEY)?,
        ))
    }

    /// Record where the instance lives
    pub fn set_identity_annotations(&mut self, project: &str, zone: &str, name: &str) {
        let annotations = self.annotations_mut();
        annotations.insert(PROJECT_ANNOTATION_KEY.to_string(), project.to_string());
        annotations.insert(ZONE_ANNOTATION_KEY.to_string(), zone.to_string());
        annotations.insert(NAME_ANNOTATION_KEY.to_string(), name.to_string());
    }

    /// Drop a finalizer token, leaving the others in order
    pub fn remove_finalizer(&mut self, finalizer: &str) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
    }
}
