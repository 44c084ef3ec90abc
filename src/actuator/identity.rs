//! Locating the instance behind a Machine

use kube::ResourceExt;
use tracing::debug;

use super::GceActuator;
use crate::compute::Instance;
use crate::crd::{
    derive_identity_machine, Cluster, GceClusterProviderConfig, GceMachineProviderConfig, Machine,
    MachineIdentity, MachineStatus,
};
use crate::Result;

/// Where an instance lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceLocation {
    /// GCE project
    pub project: String,
    /// Zone
    pub zone: String,
    /// Instance name
    pub name: String,
}

impl InstanceLocation {
    /// Location of an already created instance
    ///
    /// The identity annotations win when all three are present. Otherwise the
    /// location is derived from the current configs.
    pub fn resolve(
        machine: &Machine,
        cluster_config: &GceClusterProviderConfig,
        machine_config: &GceMachineProviderConfig,
    ) -> Self {
        Self::from_annotations(machine)
            .unwrap_or_else(|| Self::from_configs(machine, cluster_config, machine_config))
    }

    /// Location recorded in the identity annotations, if complete
    pub fn from_annotations(machine: &Machine) -> Option<Self> {
        machine
            .identity_annotations()
            .map(|(project, zone, name)| Self {
                project,
                zone,
                name,
            })
    }

    /// Location derived from the current configs
    pub fn from_configs(
        machine: &Machine,
        cluster_config: &GceClusterProviderConfig,
        machine_config: &GceMachineProviderConfig,
    ) -> Self {
        Self {
            project: cluster_config.project.clone(),
            zone: machine_config.zone.clone(),
            name: machine.name_any(),
        }
    }
}

impl GceActuator {
    /// The last recorded status of `machine`
    ///
    /// Prefers the status carried by the object itself and falls back to the
    /// stored record. Always `None` in bootstrap mode for fresh objects.
    pub(crate) async fn observed_status(&self, machine: &Machine) -> Result<Option<MachineStatus>> {
        if let Some(status) = machine
            .status
            .as_ref()
            .filter(|s| s.last_applied.is_some())
        {
            return Ok(Some(status.clone()));
        }
        let Some(client) = &self.machine_client else {
            return Ok(None);
        };
        Ok(client
            .get(&machine.name_any())
            .await?
            .and_then(|latest| latest.status))
    }

    /// Where the instance backing `machine` is expected to live
    ///
    /// Checked in order: the identity in the applied-state snapshot, the
    /// identity annotations, then the current configs.
    pub(crate) async fn locate_instance(
        &self,
        cluster: &Cluster,
        machine: &Machine,
    ) -> Result<InstanceLocation> {
        let recorded = self
            .observed_status(machine)
            .await?
            .as_ref()
            .and_then(derive_identity_machine);

        let identity = match recorded {
            Some(identity) => identity,
            None => match InstanceLocation::from_annotations(machine) {
                Some(location) => return Ok(location),
                None => MachineIdentity::from_machine(machine),
            },
        };

        let machine_config = self.codec.decode_machine(&identity.provider_config)?;
        let cluster_config = self.codec.decode_cluster(&cluster.spec.provider_config)?;
        Ok(InstanceLocation {
            project: cluster_config.project,
            zone: machine_config.zone,
            name: identity.name,
        })
    }

    /// Look up the instance backing `machine`, `None` if there is none
    pub(crate) async fn instance_if_exists(
        &self,
        cluster: &Cluster,
        machine: &Machine,
    ) -> Result<Option<Instance>> {
        let location = self.locate_instance(cluster, machine).await?;

        match self
            .compute
            .instances_get(&location.project, &location.zone, &location.name)
            .await
        {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => {
                debug!(
                    machine = %location.name,
                    project = %location.project,
                    zone = %location.zone,
                    "No instance found"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
