//! Machine reconciliation against Compute Engine
//!
//! [`GceActuator`] implements the five [`MachineActuator`] operations an
//! external controller loop drives. Every operation is idempotent: it first
//! resolves whether the backing instance exists and only then calls the
//! provider.
//!
//! Two modes are supported:
//!
//! - **managed**: a [`MachineClient`] is configured. Identity annotations,
//!   finalizer changes, error reasons and the applied-state snapshot are
//!   written back to the Machine record.
//! - **bootstrap**: no client. Nothing is persisted and new instances carry
//!   the bootstrap label so a later managed pass can adopt them.

mod identity;
mod instance;
mod update;

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use crate::client::MachineClient;
use crate::compute::ComputeService;
use crate::config::ActuatorConfig;
use crate::crd::{
    AppliedMachine, Cluster, GceClusterProviderConfig, GceMachineProviderConfig,
    GceProviderConfigCodec, Machine,
};
use crate::image::resolve_image_path;
use crate::operation::{Clock, OperationPoller, TokioClock};
use crate::remote::{GcloudSsh, RemoteCommand, RemoteTarget};
use crate::setup::{ConfigParams, MachineSetup};
use crate::{Error, MachineError, Result, BOOTSTRAP_LABEL_KEY, MACHINE_FINALIZER};

pub use identity::InstanceLocation;
pub use instance::{
    build_instance, build_metadata, new_disks, service_account_email, InstanceInputs,
    MetadataInputs, MASTER_SERVICE_ACCOUNT_ANNOTATION_KEY, WORKER_SERVICE_ACCOUNT_ANNOTATION_KEY,
};
pub use update::{requires_update, update_master_inplace, ADMIN_KUBECONFIG_PATH};

/// Trait implemented by machine actuators
///
/// Operations that mutate the Machine take it by `&mut` so the caller sees
/// the annotations, finalizers and status the actuator wrote.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineActuator: Send + Sync {
    /// Ensure an instance exists for `machine`
    async fn create(&self, cluster: &Cluster, machine: &mut Machine) -> Result<()>;

    /// Ensure the instance backing `machine` is gone
    async fn delete(&self, cluster: &Cluster, machine: &mut Machine) -> Result<()>;

    /// Converge the instance towards `goal`
    async fn update(&self, cluster: &Cluster, goal: &mut Machine) -> Result<()>;

    /// Returns true if an instance backs `machine`
    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool>;

    /// External IP of the instance backing `machine`, empty if none is assigned
    async fn get_ip(&self, cluster: &Cluster, machine: &Machine) -> Result<String>;
}

/// CA material handed to masters through instance metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateAuthority {
    /// PEM encoded certificate
    pub certificate: Vec<u8>,
    /// PEM encoded private key
    pub private_key: Vec<u8>,
}

/// Compute Engine machine actuator
///
/// Use [`GceActuatorBuilder`] to construct instances:
///
/// ```ignore
/// let actuator = GceActuator::builder(compute)
///     .machine_client(client)
///     .machine_setup(catalog)
///     .build();
/// ```
pub struct GceActuator {
    compute: Arc<dyn ComputeService>,
    codec: GceProviderConfigCodec,
    machine_setup: Option<Arc<dyn MachineSetup>>,
    machine_client: Option<Arc<dyn MachineClient>>,
    remote: Arc<dyn RemoteCommand>,
    poller: OperationPoller,
    config: ActuatorConfig,
    kubeadm_token: Option<String>,
    certificate_authority: Option<CertificateAuthority>,
}

impl GceActuator {
    /// Create a builder around the provider API client
    pub fn builder(compute: Arc<dyn ComputeService>) -> GceActuatorBuilder {
        GceActuatorBuilder::new(compute)
    }

    /// Injected configuration
    pub fn config(&self) -> &ActuatorConfig {
        &self.config
    }

    /// Returns true when nothing is persisted back to Machine records
    pub fn is_bootstrap(&self) -> bool {
        self.machine_client.is_none()
    }

    /// Admin kubeconfig of a running master
    pub async fn get_kubeconfig(&self, cluster: &Cluster, master: &Machine) -> Result<String> {
        let (cluster_config, machine_config) = self.decode_configs(cluster, master)?;
        let location = InstanceLocation::from_configs(master, &cluster_config, &machine_config);
        let kubeconfig = self
            .remote
            .run(
                &remote_target(location),
                &format!("sudo cat {}", ADMIN_KUBECONFIG_PATH),
            )
            .await?;
        Ok(kubeconfig.trim().to_string())
    }

    // =========================================================================
    // Config decoding and validation
    // =========================================================================

    fn decode_configs(
        &self,
        cluster: &Cluster,
        machine: &Machine,
    ) -> Result<(GceClusterProviderConfig, GceMachineProviderConfig)> {
        Ok((
            self.codec.decode_cluster(&cluster.spec.provider_config)?,
            self.codec.decode_machine(&machine.spec.provider_config)?,
        ))
    }

    /// Decode both configs, recording failures as invalid configuration
    async fn decode_configs_or_record(
        &self,
        cluster: &Cluster,
        machine: &mut Machine,
    ) -> Result<(GceClusterProviderConfig, GceMachineProviderConfig)> {
        let machine_config = match self.codec.decode_machine(&machine.spec.provider_config) {
            Ok(config) => config,
            Err(e) => {
                let err = MachineError::invalid_configuration(format!(
                    "Cannot unmarshal machine's providerConfig field: {}",
                    e
                ));
                return Err(self.handle_machine_error(machine, err).await);
            }
        };
        let cluster_config = match self.codec.decode_cluster(&cluster.spec.provider_config) {
            Ok(config) => config,
            Err(e) => {
                let err = MachineError::invalid_configuration(format!(
                    "Cannot unmarshal cluster's providerConfig field: {}",
                    e
                ));
                return Err(self.handle_machine_error(machine, err).await);
            }
        };
        Ok((cluster_config, machine_config))
    }

    async fn validate_machine(&self, machine: &mut Machine) -> Result<()> {
        if machine.spec.versions.kubelet.is_empty() {
            let err = MachineError::invalid_configuration("spec.versions.kubelet can't be empty");
            return Err(self.handle_machine_error(machine, err).await);
        }
        Ok(())
    }

    // =========================================================================
    // Machine record persistence
    // =========================================================================

    /// Report a machine error
    ///
    /// In managed mode the reason and message are written to the status
    /// first. A failed status write is logged and otherwise ignored.
    async fn handle_machine_error(&self, machine: &mut Machine, err: MachineError) -> Error {
        let name = machine.name_any();
        if let Some(client) = &self.machine_client {
            let status = machine.status.get_or_insert_with(Default::default);
            status.error_reason = Some(err.reason);
            status.error_message = Some(err.message.clone());
            status.last_updated = Some(chrono::Utc::now().to_rfc3339());
            if let Err(e) = client.update_status(machine).await {
                warn!(machine = %name, error = %e, "Failed to record machine error");
            }
        }
        error!(machine = %name, reason = %err.reason, message = %err.message, "Machine error");
        Error::Machine(err)
    }

    /// Record where the instance lives, then snapshot the applied state
    async fn update_annotations(&self, cluster: &Cluster, machine: &mut Machine) -> Result<()> {
        let (cluster_config, machine_config) =
            self.decode_configs_or_record(cluster, machine).await?;
        let name = machine.name_any();
        machine.set_identity_annotations(&cluster_config.project, &machine_config.zone, &name);

        let Some(client) = &self.machine_client else {
            return Ok(());
        };
        let updated = client.update(machine).await?;
        *machine = updated;
        self.update_instance_status(machine).await
    }

    /// Store the name and spec of `machine` as the last applied state
    async fn update_instance_status(&self, machine: &mut Machine) -> Result<()> {
        let Some(client) = &self.machine_client else {
            return Ok(());
        };
        let name = machine.name_any();
        let mut latest = client.get(&name).await?.ok_or_else(|| {
            Error::not_found(format!(
                "Machine has already been deleted. Cannot update current instance status for machine {}",
                name
            ))
        })?;

        let status = latest.status.get_or_insert_with(Default::default);
        status.last_applied = Some(AppliedMachine::from_machine(machine));
        status.last_updated = Some(chrono::Utc::now().to_rfc3339());

        let updated = client.update_status(&latest).await?;
        debug!(machine = %name, "Recorded applied machine state");
        machine.status = updated.status;
        Ok(())
    }

    // =========================================================================
    // Provider calls
    // =========================================================================

    /// Delete the instance backing `machine` and wait for it to be gone
    ///
    /// Returns false if there was no instance to delete.
    async fn delete_instance(&self, cluster: &Cluster, machine: &mut Machine) -> Result<bool> {
        let name = machine.name_any();
        if self.instance_if_exists(cluster, machine).await?.is_none() {
            info!(machine = %name, "Skipped deleting a VM that is already deleted");
            return Ok(false);
        }

        let (cluster_config, machine_config) =
            self.decode_configs_or_record(cluster, machine).await?;
        self.validate_machine(machine).await?;

        let location = InstanceLocation::resolve(machine, &cluster_config, &machine_config);
        info!(
            machine = %name,
            project = %location.project,
            zone = %location.zone,
            instance = %location.name,
            "Deleting instance"
        );

        let result = match self
            .compute
            .instances_delete(&location.project, &location.zone, &location.name)
            .await
        {
            Ok(op) => self.poller.wait_for_operation(&location.project, op).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let err = MachineError::delete_machine(format!("error deleting GCE instance: {}", e));
            return Err(self.handle_machine_error(machine, err).await);
        }

        info!(machine = %name, "Instance deleted");
        Ok(true)
    }

    /// Replace a worker: delete the current instance, then create the goal
    async fn replace(
        &self,
        cluster: &Cluster,
        current: &AppliedMachine,
        goal: &mut Machine,
    ) -> Result<()> {
        let mut old = goal.clone();
        old.metadata.name = Some(current.name.clone());
        old.spec = current.spec.clone();

        if let Err(e) = self.delete_instance(cluster, &mut old).await {
            error!(machine = %current.name, error = %e, "Delete machine for update failed");
            return Err(e);
        }
        if let Err(e) = self.create(cluster, goal).await {
            error!(machine = %goal.name_any(), error = %e, "Create machine for update failed");
            return Err(e);
        }
        Ok(())
    }

    /// Record a failed update unless it was already recorded
    async fn record_update_failure(&self, goal: &mut Machine, err: Error) -> Error {
        match err {
            Error::Machine(_) => err,
            other => {
                let err = MachineError::update_machine(format!("error updating machine: {}", other));
                self.handle_machine_error(goal, err).await
            }
        }
    }
}

fn remote_target(location: InstanceLocation) -> RemoteTarget {
    RemoteTarget {
        project: location.project,
        zone: location.zone,
        name: location.name,
    }
}

#[async_trait]
impl MachineActuator for GceActuator {
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    async fn create(&self, cluster: &Cluster, machine: &mut Machine) -> Result<()> {
        let name = machine.name_any();
        let setup = self
            .machine_setup
            .clone()
            .ok_or_else(|| Error::setup("a valid machine setup catalog is required"))?;

        let (cluster_config, machine_config) =
            self.decode_configs_or_record(cluster, machine).await?;
        self.validate_machine(machine).await?;
        if machine.is_master() && machine.spec.versions.control_plane.is_empty() {
            let err = MachineError::invalid_configuration(
                "invalid master configuration: missing spec.versions.controlPlane",
            );
            return Err(self.handle_machine_error(machine, err).await);
        }

        let params = ConfigParams {
            os: machine_config.os.clone(),
            roles: machine.spec.roles.clone(),
            versions: machine.spec.versions.clone(),
        };
        let image = setup.image(&params)?;
        let image_path =
            resolve_image_path(self.compute.as_ref(), &image, &self.config.default_image).await;
        let metadata = build_metadata(MetadataInputs {
            cluster,
            machine: &*machine,
            project: &cluster_config.project,
            setup_metadata: setup.metadata(&params)?,
            kubeadm_token: self.kubeadm_token.as_deref(),
            certificate_authority: self.certificate_authority.as_ref(),
        })?;

        if self.instance_if_exists(cluster, machine).await?.is_some() {
            info!(machine = %name, "Skipped creating a VM that already exists");
            return Ok(());
        }

        let instance = build_instance(InstanceInputs {
            cluster,
            machine: &*machine,
            machine_config: &machine_config,
            project: &cluster_config.project,
            image_path: &image_path,
            metadata,
            min_boot_disk_size_gb: self.config.min_boot_disk_size_gb,
            bootstrap: self.is_bootstrap(),
        });

        let project = &cluster_config.project;
        let zone = &machine_config.zone;
        info!(machine = %name, project = %project, zone = %zone, image = %image_path, "Creating instance");

        let result = match self.compute.instances_insert(project, zone, &instance).await {
            Ok(op) => self.poller.wait_for_operation(project, op).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let err = MachineError::create_machine(format!("error creating GCE instance: {}", e));
            return Err(self.handle_machine_error(machine, err).await);
        }
        info!(machine = %name, "Instance created");

        if self.machine_client.is_some() {
            self.update_annotations(cluster, machine).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    async fn delete(&self, cluster: &Cluster, machine: &mut Machine) -> Result<()> {
        if !self.delete_instance(cluster, machine).await? {
            return Ok(());
        }

        if let Some(client) = &self.machine_client {
            machine.remove_finalizer(MACHINE_FINALIZER);
            let updated = client.update(machine).await?;
            *machine = updated;
        }
        Ok(())
    }

    #[instrument(skip(self, cluster, goal), fields(machine = %goal.name_any()))]
    async fn update(&self, cluster: &Cluster, goal: &mut Machine) -> Result<()> {
        let name = goal.name_any();
        let (cluster_config, machine_config) = self.decode_configs_or_record(cluster, goal).await?;
        self.validate_machine(goal).await?;

        let current = self
            .observed_status(goal)
            .await?
            .and_then(|status| status.last_applied);
        let Some(current) = current else {
            let bootstrapped = self
                .instance_if_exists(cluster, goal)
                .await?
                .is_some_and(|instance| {
                    instance
                        .labels
                        .get(BOOTSTRAP_LABEL_KEY)
                        .is_some_and(|v| !v.is_empty())
                });
            if bootstrapped {
                info!(machine = %name, "Populating current state for bootstrap machine");
                return self.update_annotations(cluster, goal).await;
            }
            let err = MachineError::update_machine(format!(
                "Cannot retrieve current state to update machine {}",
                name
            ));
            return Err(self.handle_machine_error(goal, err).await);
        };

        if !requires_update(&current, goal) {
            debug!(machine = %name, "Machine is up to date");
            return Ok(());
        }

        let result = if current.is_master() {
            info!(machine = %name, "Doing an in-place upgrade for master");
            let location = InstanceLocation::resolve(goal, &cluster_config, &machine_config);
            update_master_inplace(
                self.remote.as_ref(),
                &remote_target(location),
                &current,
                goal,
            )
            .await
        } else {
            info!(machine = %name, "Re-creating machine for update");
            self.replace(cluster, &current, goal).await
        };

        match result {
            Ok(()) => self.update_instance_status(goal).await,
            Err(e) => {
                error!(machine = %name, error = %e, "Machine update failed");
                Err(self.record_update_failure(goal, e).await)
            }
        }
    }

    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        Ok(self.instance_if_exists(cluster, machine).await?.is_some())
    }

    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    async fn get_ip(&self, cluster: &Cluster, machine: &Machine) -> Result<String> {
        let (cluster_config, machine_config) = self.decode_configs(cluster, machine)?;
        let name = machine.name_any();
        let instance = self
            .compute
            .instances_get(&cluster_config.project, &machine_config.zone, &name)
            .await?;
        match instance.external_ip() {
            Some(ip) => Ok(ip.to_string()),
            None => {
                debug!(machine = %name, "Instance has no external IP assigned");
                Ok(String::new())
            }
        }
    }
}

/// Builder for [`GceActuator`]
///
/// Without a machine client the actuator runs in bootstrap mode. Remote
/// commands default to `gcloud compute ssh` and time to the tokio clock.
pub struct GceActuatorBuilder {
    compute: Arc<dyn ComputeService>,
    machine_setup: Option<Arc<dyn MachineSetup>>,
    machine_client: Option<Arc<dyn MachineClient>>,
    remote: Option<Arc<dyn RemoteCommand>>,
    clock: Option<Arc<dyn Clock>>,
    config: ActuatorConfig,
    kubeadm_token: Option<String>,
    certificate_authority: Option<CertificateAuthority>,
}

impl GceActuatorBuilder {
    fn new(compute: Arc<dyn ComputeService>) -> Self {
        Self {
            compute,
            machine_setup: None,
            machine_client: None,
            remote: None,
            clock: None,
            config: ActuatorConfig::default(),
            kubeadm_token: None,
            certificate_authority: None,
        }
    }

    /// Set the machine setup catalog (required for create)
    pub fn machine_setup(mut self, setup: Arc<dyn MachineSetup>) -> Self {
        self.machine_setup = Some(setup);
        self
    }

    /// Persist changes through `client`
    pub fn machine_client(mut self, client: Arc<dyn MachineClient>) -> Self {
        self.machine_client = Some(client);
        self
    }

    /// Override remote command execution
    pub fn remote(mut self, remote: Arc<dyn RemoteCommand>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override the clock used while polling operations
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the actuator configuration
    pub fn config(mut self, config: ActuatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Token new nodes join with
    pub fn kubeadm_token(mut self, token: impl Into<String>) -> Self {
        self.kubeadm_token = Some(token.into());
        self
    }

    /// CA handed to new masters
    pub fn certificate_authority(mut self, ca: CertificateAuthority) -> Self {
        self.certificate_authority = Some(ca);
        self
    }

    /// Build the actuator
    pub fn build(self) -> GceActuator {
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let poller = OperationPoller::new(
            self.compute.clone(),
            clock,
            self.config.operation_timeout,
            self.config.poll_interval,
        );
        GceActuator {
            compute: self.compute,
            codec: GceProviderConfigCodec::new(),
            machine_setup: self.machine_setup,
            machine_client: self.machine_client,
            remote: self
                .remote
                .unwrap_or_else(|| Arc::new(GcloudSsh::new())),
            poller,
            config: self.config,
            kubeadm_token: self.kubeadm_token,
            certificate_authority: self.certificate_authority,
        }
    }
}

#[cfg(test)]
mod tests;
