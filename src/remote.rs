//! Remote command execution on cluster nodes
//!
//! In-place master upgrades and kubeconfig retrieval run shell commands on
//! the node itself. [`RemoteCommand`] hides the transport; [`GcloudSsh`] uses
//! `gcloud compute ssh`.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Where a remote command runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    /// GCE project
    pub project: String,
    /// Zone of the instance
    pub zone: String,
    /// Instance name
    pub name: String,
}

/// Trait abstracting command execution on a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteCommand: Send + Sync {
    /// Run `command` on `target` and return its stdout
    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<String>;
}

/// Runs commands through `gcloud compute ssh`
#[derive(Clone, Debug)]
pub struct GcloudSsh {
    gcloud: String,
}

impl GcloudSsh {
    /// Use the `gcloud` binary from `PATH`
    pub fn new() -> Self {
        Self {
            gcloud: "gcloud".to_string(),
        }
    }

    /// Use a specific `gcloud` binary
    pub fn with_binary(gcloud: impl Into<String>) -> Self {
        Self {
            gcloud: gcloud.into(),
        }
    }

    fn args(target: &RemoteTarget, command: &str) -> Vec<String> {
        [
            "compute",
            "ssh",
            "--project",
            target.project.as_str(),
            "--zone",
            target.zone.as_str(),
            target.name.as_str(),
            "--command",
            command,
            "--",
            "-q",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Default for GcloudSsh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCommand for GcloudSsh {
    async fn run(&self, target: &RemoteTarget, command: &str) -> Result<String> {
        debug!(node = %target.name, zone = %target.zone, command = %command, "Running remote command");

        let output = Command::new(&self.gcloud)
            .args(Self::args(target, command))
            .output()
            .await
            .map_err(|e| Error::remote(format!("failed to run {}: {}", self.gcloud, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::remote(format!(
                "command on {} failed ({}): {}",
                target.name,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
