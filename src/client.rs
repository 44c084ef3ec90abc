//! Persistence of Machine records
//!
//! The actuator writes identity annotations, finalizer changes and status
//! back onto the Machine through [`MachineClient`]. When no client is
//! configured the actuator runs in bootstrap mode and persists nothing.

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::config::ActuatorConfig;
use crate::crd::Machine;
use crate::{Error, Result};

/// Trait abstracting Machine record persistence
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Fetch the latest Machine by name, `None` if it no longer exists
    async fn get(&self, name: &str) -> Result<Option<Machine>>;

    /// Replace the Machine (metadata and spec)
    async fn update(&self, machine: &Machine) -> Result<Machine>;

    /// Replace the Machine status
    async fn update_status(&self, machine: &Machine) -> Result<Machine>;
}

/// Real Kubernetes client implementation
pub struct KubeMachineClient {
    api: Api<Machine>,
}

impl KubeMachineClient {
    /// Create a client for Machines in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Create a client for the namespace named in `config`
    pub fn from_config(client: Client, config: &ActuatorConfig) -> Self {
        Self::new(client, &config.machine_namespace)
    }
}

#[async_trait]
impl MachineClient for KubeMachineClient {
    async fn get(&self, name: &str) -> Result<Option<Machine>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn update(&self, machine: &Machine) -> Result<Machine> {
        let name = machine.name_any();
        debug!(machine = %name, "Updating machine");
        Ok(self
            .api
            .replace(&name, &PostParams::default(), machine)
            .await?)
    }

    async fn update_status(&self, machine: &Machine) -> Result<Machine> {
        let name = machine.name_any();
        debug!(machine = %name, "Updating machine status");
        let body = serde_json::to_vec(machine).map_err(|e| Error::serialization(e.to_string()))?;
        Ok(self
            .api
            .replace_status(&name, &PostParams::default(), body)
            .await?)
    }
}
