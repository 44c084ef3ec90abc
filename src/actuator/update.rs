//! Change detection and in-place master upgrades

use tracing::{info, warn};

use crate::crd::{AppliedMachine, Machine};
use crate::remote::{RemoteCommand, RemoteTarget};
use crate::Result;

/// Kubeconfig present on every master
pub const ADMIN_KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

/// Returns true if anything that shapes the instance changed
///
/// Compares node metadata, provider config, roles, versions and name.
pub fn requires_update(current: &AppliedMachine, goal: &Machine) -> bool {
    let goal_name = goal.metadata.name.as_deref().unwrap_or_default();
    current.name != goal_name
        || current.spec.metadata != goal.spec.metadata
        || current.spec.provider_config != goal.spec.provider_config
        || current.spec.roles != goal.spec.roles
        || current.spec.versions != goal.spec.versions
}

/// Command replacing the kubeadm binary with `version`
pub fn install_kubeadm_command(version: &str) -> String {
    format!(
        "curl -sSL https://dl.k8s.io/release/v{version}/bin/linux/amd64/kubeadm | sudo tee /usr/bin/kubeadm > /dev/null; sudo chmod a+rx /usr/bin/kubeadm"
    )
}

/// Command upgrading the control plane to `version`
pub fn upgrade_control_plane_command(version: &str) -> String {
    format!("sudo kubeadm upgrade apply v{version} -y")
}

/// Command draining `node`
pub fn drain_command(node: &str) -> String {
    format!(
        "sudo kubectl drain {node} --kubeconfig {ADMIN_KUBECONFIG_PATH} --ignore-daemonsets"
    )
}

/// Command installing kubelet `version`
pub fn install_kubelet_command(version: &str) -> String {
    format!("sudo apt-get install kubelet={version}-00")
}

/// Command uncordoning `node`
pub fn uncordon_command(node: &str) -> String {
    format!("sudo kubectl uncordon {node} --kubeconfig {ADMIN_KUBECONFIG_PATH}")
}

/// Upgrade a master in place
///
/// Control plane first, then kubelet. A failed drain is tolerated; any
/// other failed step aborts the upgrade.
pub async fn update_master_inplace(
    remote: &dyn RemoteCommand,
    target: &RemoteTarget,
    current: &AppliedMachine,
    goal: &Machine,
) -> Result<()> {
    let from = &current.spec.versions;
    let to = &goal.spec.versions;

    if from.control_plane != to.control_plane {
        info!(
            node = %target.name,
            from = %from.control_plane,
            to = %to.control_plane,
            "Upgrading control plane"
        );
        remote
            .run(target, &install_kubeadm_command(&to.control_plane))
            .await?;
        remote
            .run(target, &upgrade_control_plane_command(&to.control_plane))
            .await?;
    }

    if from.kubelet != to.kubelet {
        info!(
            node = %target.name,
            from = %from.kubelet,
            to = %to.kubelet,
            "Upgrading kubelet"
        );
        // Draining the only master fails on single-node clusters
        if let Err(e) = remote.run(target, &drain_command(&target.name)).await {
            warn!(node = %target.name, error = %e, "Drain failed, continuing");
        }
        remote
            .run(target, &install_kubelet_command(&to.kubelet))
            .await?;
        remote.run(target, &uncordon_command(&target.name)).await?;
    }

    Ok(())
}
