//! Construction of the instance insert request

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::ResourceExt;
use tracing::info;

use super::CertificateAuthority;
use crate::compute::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, Instance, Metadata,
    NetworkInterface, ServiceAccount, Tags, CLOUD_PLATFORM_SCOPE,
};
use crate::crd::{Cluster, GceMachineProviderConfig, Machine};
use crate::{Error, Result, BOOTSTRAP_LABEL_KEY};

/// Cluster annotation naming the service account masters run as
pub const MASTER_SERVICE_ACCOUNT_ANNOTATION_KEY: &str =
    "gce.clusterapi.k8s.io/service-account-k8s-master";

/// Cluster annotation naming the service account workers run as
pub const WORKER_SERVICE_ACCOUNT_ANNOTATION_KEY: &str =
    "gce.clusterapi.k8s.io/service-account-k8s-worker";

/// Network every instance is attached to
const DEFAULT_NETWORK: &str = "global/networks/default";

/// Build the attached disks for an instance
///
/// The first configured disk becomes the boot disk: it carries the image and
/// is grown to `min_boot_disk_size_gb` if configured smaller.
pub fn new_disks(
    config: &GceMachineProviderConfig,
    zone: &str,
    image_path: &str,
    min_boot_disk_size_gb: i64,
) -> Vec<AttachedDisk> {
    config
        .disks
        .iter()
        .enumerate()
        .map(|(idx, disk)| {
            let mut params = AttachedDiskInitializeParams {
                disk_size_gb: disk.initialize_params.disk_size_gb,
                disk_type: format!(
                    "zones/{}/diskTypes/{}",
                    zone, disk.initialize_params.disk_type
                ),
                source_image: None,
            };
            let boot = idx == 0;
            if boot {
                params.source_image = Some(image_path.to_string());
                if params.disk_size_gb < min_boot_disk_size_gb {
                    info!(
                        requested_gb = params.disk_size_gb,
                        minimum_gb = min_boot_disk_size_gb,
                        "Boot disk below minimum size, increasing"
                    );
                    params.disk_size_gb = min_boot_disk_size_gb;
                }
            }
            AttachedDisk {
                auto_delete: true,
                boot,
                initialize_params: Some(params),
            }
        })
        .collect()
}

/// Service account an instance runs as
///
/// Uses the account recorded on the Cluster if there is one, otherwise the
/// conventional `k8s-{master,worker}-<cluster>` account of the project.
pub fn service_account_email(cluster: &Cluster, machine: &Machine, project: &str) -> String {
    let (annotation, prefix) = if machine.is_master() {
        (MASTER_SERVICE_ACCOUNT_ANNOTATION_KEY, "k8s-master")
    } else {
        (WORKER_SERVICE_ACCOUNT_ANNOTATION_KEY, "k8s-worker")
    };
    cluster
        .annotations()
        .get(annotation)
        .filter(|email| !email.is_empty())
        .cloned()
        .unwrap_or_else(|| {
            format!(
                "{}-{}@{}.iam.gserviceaccount.com",
                prefix,
                cluster.name_any(),
                project
            )
        })
}

/// Inputs for the instance metadata
pub struct MetadataInputs<'a> {
    /// Cluster the machine joins
    pub cluster: &'a Cluster,
    /// Machine being created
    pub machine: &'a Machine,
    /// GCE project
    pub project: &'a str,
    /// Metadata bundle from the setup catalog
    pub setup_metadata: BTreeMap<String, String>,
    /// Token nodes join with
    pub kubeadm_token: Option<&'a str>,
    /// CA handed to masters
    pub certificate_authority: Option<&'a CertificateAuthority>,
}

/// Build the instance metadata
///
/// Workers need the cluster to already expose an API endpoint.
pub fn build_metadata(inputs: MetadataInputs<'_>) -> Result<Metadata> {
    let mut items = inputs.setup_metadata;
    items.insert("cluster-name".to_string(), inputs.cluster.name_any());
    items.insert("project".to_string(), inputs.project.to_string());
    if let Some(token) = inputs.kubeadm_token {
        items.insert("kubeadm-token".to_string(), token.to_string());
    }

    let versions = &inputs.machine.spec.versions;
    items.insert("kubelet-version".to_string(), versions.kubelet.clone());

    if inputs.machine.is_master() {
        items.insert(
            "control-plane-version".to_string(),
            versions.control_plane.clone(),
        );
        if let Some(ca) = inputs.certificate_authority {
            items.insert("ca-cert".to_string(), STANDARD.encode(&ca.certificate));
            items.insert("ca-key".to_string(), STANDARD.encode(&ca.private_key));
        }
    } else {
        let endpoint = inputs.cluster.first_api_endpoint().ok_or_else(|| {
            Error::validation(
                "invalid cluster state: cannot create a Kubernetes node without an API endpoint",
            )
        })?;
        items.insert("master-endpoint".to_string(), endpoint);
    }

    Ok(Metadata::from_map(items))
}

/// Everything needed to describe a new instance
pub struct InstanceInputs<'a> {
    /// Cluster the machine joins
    pub cluster: &'a Cluster,
    /// Machine being created
    pub machine: &'a Machine,
    /// Decoded machine provider config
    pub machine_config: &'a GceMachineProviderConfig,
    /// GCE project
    pub project: &'a str,
    /// Resolved boot image
    pub image_path: &'a str,
    /// Instance metadata
    pub metadata: Metadata,
    /// Minimum boot disk size in GiB
    pub min_boot_disk_size_gb: i64,
    /// Mark the instance as created before any controller existed
    pub bootstrap: bool,
}

/// Build the body of the instance insert request
pub fn build_instance(inputs: InstanceInputs<'_>) -> Instance {
    let zone = &inputs.machine_config.zone;

    let mut labels = BTreeMap::new();
    if inputs.bootstrap {
        labels.insert(BOOTSTRAP_LABEL_KEY.to_string(), "true".to_string());
    }

    Instance {
        name: inputs.machine.name_any(),
        machine_type: format!(
            "zones/{}/machineTypes/{}",
            zone, inputs.machine_config.machine_type
        ),
        can_ip_forward: true,
        network_interfaces: vec![NetworkInterface {
            network: DEFAULT_NETWORK.to_string(),
            access_configs: vec![AccessConfig {
                type_: "ONE_TO_ONE_NAT".to_string(),
                name: "External NAT".to_string(),
                nat_ip: None,
            }],
            ..Default::default()
        }],
        disks: new_disks(
            inputs.machine_config,
            zone,
            inputs.image_path,
            inputs.min_boot_disk_size_gb,
        ),
        metadata: Some(inputs.metadata),
        tags: Some(Tags {
            items: vec![
                "https-server".to_string(),
                format!("{}-worker", inputs.cluster.name_any()),
            ],
        }),
        labels,
        service_accounts: vec![ServiceAccount {
            email: service_account_email(inputs.cluster, inputs.machine, inputs.project),
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
        }],
        ..Default::default()
    }
}
