use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rstest::rstest;
use serde_json::json;

use super::*;
use crate::client::MockMachineClient;
use crate::compute::{
    AccessConfig, Image, Instance, MockComputeService, NetworkInterface, Operation,
    OperationError, OperationErrorItem, OPERATION_STATUS_DONE,
};
use crate::crd::provider_config::GCE_PROVIDER_CONFIG_API_VERSION;
use crate::crd::{
    ApiEndpoint, ClusterSpec, ClusterStatus, MachineRole, MachineSpec, MachineStatus,
    MachineVersionInfo, ProviderConfig,
};
use crate::operation::ManualClock;
use crate::remote::MockRemoteCommand;
use crate::setup::MockMachineSetup;
use crate::MachineStatusError;

const PROJECT: &str = "proj";
const ZONE: &str = "us-central1-f";
const CATALOG_IMAGE: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-1710";

// =============================================================================
// Fixtures
// =============================================================================

fn cluster_provider_config() -> ProviderConfig {
    ProviderConfig::from_value(json!({
        "apiVersion": GCE_PROVIDER_CONFIG_API_VERSION,
        "kind": "GCEClusterProviderConfig",
        "project": PROJECT,
    }))
}

fn machine_provider_config(zone: &str, disk_size_gb: i64) -> ProviderConfig {
    ProviderConfig::from_value(json!({
        "apiVersion": GCE_PROVIDER_CONFIG_API_VERSION,
        "kind": "GCEMachineProviderConfig",
        "zone": zone,
        "machineType": "n1-standard-1",
        "os": "ubuntu-1710",
        "disks": [{"initializeParams": {"diskSizeGb": disk_size_gb, "diskType": "pd-standard"}}],
    }))
}

fn cluster() -> Cluster {
    let mut cluster = Cluster::new(
        "demo",
        ClusterSpec {
            provider_config: cluster_provider_config(),
        },
    );
    cluster.status = Some(ClusterStatus {
        api_endpoints: vec![ApiEndpoint {
            host: "35.0.0.1".to_string(),
            port: 443,
        }],
        ..Default::default()
    });
    cluster
}

fn machine(name: &str, role: MachineRole, kubelet: &str, control_plane: &str) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            provider_config: machine_provider_config(ZONE, 10),
            roles: vec![role],
            versions: MachineVersionInfo {
                kubelet: kubelet.to_string(),
                control_plane: control_plane.to_string(),
            },
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some("default".to_string());
    machine
}

fn worker(name: &str) -> Machine {
    machine(name, MachineRole::Node, "1.9.4", "")
}

fn master(name: &str) -> Machine {
    machine(name, MachineRole::Master, "1.9.4", "1.9.4")
}

/// `goal` with a status recording `applied` as the last provisioned state
fn provisioned_as(mut goal: Machine, applied: &Machine) -> Machine {
    goal.status = Some(MachineStatus {
        last_applied: Some(AppliedMachine::from_machine(applied)),
        ..Default::default()
    });
    goal
}

fn operation(kind: &str, status: &str) -> Operation {
    Operation {
        name: format!("operation-{}", kind),
        operation_type: kind.to_string(),
        zone: format!("https://www.googleapis.com/compute/v1/projects/{}/zones/{}", PROJECT, ZONE),
        status: status.to_string(),
        ..Default::default()
    }
}

fn done_operation(kind: &str) -> Operation {
    operation(kind, OPERATION_STATUS_DONE)
}

fn setup() -> MockMachineSetup {
    let mut setup = MockMachineSetup::new();
    setup
        .expect_image()
        .returning(|_| Ok(CATALOG_IMAGE.to_string()));
    setup.expect_metadata().returning(|_| {
        Ok(BTreeMap::from([(
            "startup-script".to_string(),
            "#!/bin/bash\necho hello".to_string(),
        )]))
    });
    setup
}

fn actuator(
    compute: MockComputeService,
    client: Option<MockMachineClient>,
    remote: MockRemoteCommand,
) -> GceActuator {
    let mut builder = GceActuator::builder(Arc::new(compute))
        .machine_setup(Arc::new(setup()))
        .remote(Arc::new(remote))
        .clock(Arc::new(ManualClock::new()));
    if let Some(client) = client {
        builder = builder.machine_client(Arc::new(client));
    }
    builder.build()
}

/// Captures every write made through the machine client
#[derive(Clone, Default)]
struct MachineWrites {
    updates: Arc<Mutex<Vec<Machine>>>,
    statuses: Arc<Mutex<Vec<Machine>>>,
}

impl MachineWrites {
    fn updates(&self) -> Vec<Machine> {
        self.updates.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<Machine> {
        self.statuses.lock().unwrap().clone()
    }

    fn last_status(&self) -> MachineStatus {
        self.statuses()
            .last()
            .and_then(|m| m.status.clone())
            .expect("a status write")
    }
}

/// Machine client serving `stored` and recording writes
fn recording_client(stored: Machine) -> (MockMachineClient, MachineWrites) {
    let writes = MachineWrites::default();
    let mut client = MockMachineClient::new();

    client
        .expect_get()
        .returning(move |_| Ok(Some(stored.clone())));

    let updates = writes.updates.clone();
    client.expect_update().returning(move |m| {
        updates.lock().unwrap().push(m.clone());
        Ok(m.clone())
    });

    let statuses = writes.statuses.clone();
    client.expect_update_status().returning(move |m| {
        statuses.lock().unwrap().push(m.clone());
        Ok(m.clone())
    });

    (client, writes)
}

/// Remote executor recording `(target, command)` pairs
fn recording_remote(
    fail: bool,
) -> (MockRemoteCommand, Arc<Mutex<Vec<(RemoteTarget, String)>>>) {
    let commands = Arc::new(Mutex::new(Vec::new()));
    let captured = commands.clone();
    let mut remote = MockRemoteCommand::new();
    remote.expect_run().returning(move |target, cmd| {
        captured
            .lock()
            .unwrap()
            .push((target.clone(), cmd.to_string()));
        if fail {
            Err(Error::remote("ssh: connection refused"))
        } else {
            Ok(String::new())
        }
    });
    (remote, commands)
}

fn instance_missing(compute: &mut MockComputeService) {
    compute
        .expect_instances_get()
        .returning(|_, _, name| Err(Error::not_found(format!("instance {}", name))));
}

fn images_exist(compute: &mut MockComputeService) {
    compute
        .expect_images_get_from_family()
        .returning(|_, _| Ok(Image::default()));
}

fn machine_error_reason(err: &Error) -> Option<MachineStatusError> {
    match err {
        Error::Machine(e) => Some(e.reason),
        _ => None,
    }
}

type Inserted = Arc<Mutex<Vec<(String, String, Instance)>>>;

fn recording_insert(compute: &mut MockComputeService) -> Inserted {
    let inserted: Inserted = Arc::new(Mutex::new(Vec::new()));
    let captured = inserted.clone();
    compute
        .expect_instances_insert()
        .times(1)
        .returning(move |project, zone, instance| {
            captured
                .lock()
                .unwrap()
                .push((project.to_string(), zone.to_string(), instance.clone()));
            Ok(done_operation("insert"))
        });
    inserted
}

// =============================================================================
// Create
// =============================================================================

/// Story: creating a machine inserts the instance, then records where it lives
///
/// The annotations written afterwards must name exactly the project, zone and
/// instance that were inserted, and the status must snapshot the spec. Masters
/// and workers differ only in the join metadata they carry.
#[rstest]
#[case::worker(worker("worker-0"))]
#[case::master(master("master-0"))]
#[tokio::test]
async fn story_create_provisions_instance_and_records_identity(#[case] mut machine: Machine) {
    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    instance_missing(&mut compute);
    let inserted = recording_insert(&mut compute);

    let name = machine.name_any();
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    actuator
        .create(&cluster(), &mut machine)
        .await
        .expect("create should succeed");

    let inserted = inserted.lock().unwrap();
    let (project, zone, instance) = &inserted[0];
    assert_eq!(project, PROJECT);
    assert_eq!(zone, ZONE);
    assert_eq!(instance.name, name);
    assert!(instance.labels.is_empty());
    let boot = instance.disks[0].initialize_params.as_ref().unwrap();
    assert_eq!(boot.disk_size_gb, 30);
    assert_eq!(boot.source_image.as_deref(), Some(CATALOG_IMAGE));
    let metadata = instance.metadata.as_ref().unwrap();
    assert!(metadata.get("startup-script").is_some());
    if machine.is_master() {
        assert_eq!(metadata.get("control-plane-version"), Some("1.9.4"));
        assert_eq!(metadata.get("master-endpoint"), None);
    } else {
        assert_eq!(metadata.get("master-endpoint"), Some("35.0.0.1:443"));
    }

    let updates = writes.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].identity_annotations(),
        Some((project.clone(), zone.clone(), instance.name.clone()))
    );

    let applied = writes.last_status().last_applied.expect("snapshot");
    assert_eq!(applied.name, name);
    assert_eq!(applied.spec, machine.spec);
    assert!(machine.status.and_then(|s| s.last_applied).is_some());
}

/// Story: create is a no-op when the instance already exists
#[tokio::test]
async fn story_create_skips_existing_instance() {
    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    compute.expect_instances_get().returning(|_, _, name| {
        Ok(Instance {
            name: name.to_string(),
            ..Default::default()
        })
    });
    compute.expect_instances_insert().never();

    let mut machine = worker("worker-0");
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    actuator
        .create(&cluster(), &mut machine)
        .await
        .expect("existing instance is fine");
    assert!(writes.updates().is_empty());
}

/// Story: without a machine client the instance is labelled for later adoption
#[tokio::test]
async fn story_bootstrap_create_labels_instance() {
    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    instance_missing(&mut compute);
    let inserted = recording_insert(&mut compute);

    let actuator = actuator(compute, None, MockRemoteCommand::new());
    let mut machine = master("master-0");

    actuator
        .create(&cluster(), &mut machine)
        .await
        .expect("bootstrap create should succeed");

    let inserted = inserted.lock().unwrap();
    let instance = &inserted[0].2;
    assert_eq!(
        instance.labels.get(crate::BOOTSTRAP_LABEL_KEY).map(String::as_str),
        Some("true")
    );
    assert_eq!(machine.identity_annotations(), None);
}

/// Story: a malformed provider config is recorded on the Machine
#[tokio::test]
async fn story_invalid_provider_config_is_recorded() {
    let mut machine = worker("worker-0");
    machine.spec.provider_config = ProviderConfig::from_value(json!({
        "apiVersion": "someprovider/v1",
        "kind": "GCEMachineProviderConfig",
    }));
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(MockComputeService::new(), Some(client), MockRemoteCommand::new());

    let err = actuator.create(&cluster(), &mut machine).await.unwrap_err();

    assert_eq!(
        machine_error_reason(&err),
        Some(MachineStatusError::InvalidConfiguration)
    );
    let status = writes.last_status();
    assert_eq!(
        status.error_reason,
        Some(MachineStatusError::InvalidConfiguration)
    );
    assert!(status
        .error_message
        .unwrap()
        .starts_with("Cannot unmarshal machine's providerConfig field"));
}

#[rstest]
#[case::missing_kubelet(machine("worker-0", MachineRole::Node, "", ""))]
#[case::master_without_control_plane(machine("master-0", MachineRole::Master, "1.9.4", ""))]
#[tokio::test]
async fn test_create_rejects_invalid_versions(#[case] mut machine: Machine) {
    let actuator = actuator(MockComputeService::new(), None, MockRemoteCommand::new());
    let err = actuator.create(&cluster(), &mut machine).await.unwrap_err();
    assert_eq!(
        machine_error_reason(&err),
        Some(MachineStatusError::InvalidConfiguration)
    );
}

#[tokio::test]
async fn test_create_requires_setup_catalog() {
    let actuator = GceActuator::builder(Arc::new(MockComputeService::new()))
        .remote(Arc::new(MockRemoteCommand::new()))
        .build();
    let err = actuator
        .create(&cluster(), &mut worker("worker-0"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Setup(_)));
}

/// Story: workers can't be created before the cluster has an API endpoint
#[tokio::test]
async fn story_worker_needs_api_endpoint() {
    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    compute.expect_instances_insert().never();
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    let mut cluster = cluster();
    cluster.status = None;
    let err = actuator
        .create(&cluster, &mut worker("worker-0"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("without an API endpoint"));
}

/// Story: a failed insert is recorded as a create error
#[tokio::test]
async fn story_insert_failure_is_recorded() {
    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    instance_missing(&mut compute);
    compute
        .expect_instances_insert()
        .returning(|_, _, _| Err(Error::compute("QUOTA_EXCEEDED")));

    let mut machine = worker("worker-0");
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    let err = actuator.create(&cluster(), &mut machine).await.unwrap_err();

    assert_eq!(machine_error_reason(&err), Some(MachineStatusError::CreateError));
    assert!(err.to_string().contains("error creating GCE instance: "));
    assert!(err.to_string().contains("QUOTA_EXCEEDED"));
    assert_eq!(
        writes.last_status().error_reason,
        Some(MachineStatusError::CreateError)
    );
    assert!(writes.updates().is_empty());
}

/// Story: an insert that never finishes surfaces as a timed out create
#[tokio::test]
async fn story_insert_timeout_is_a_create_error() {
    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    instance_missing(&mut compute);
    compute
        .expect_instances_insert()
        .returning(|_, _, _| Ok(operation("insert", "RUNNING")));
    compute
        .expect_zone_operations_get()
        .returning(|_, _, _| Ok(operation("insert", "RUNNING")));

    let actuator = actuator(compute, None, MockRemoteCommand::new());
    let err = actuator
        .create(&cluster(), &mut worker("worker-0"))
        .await
        .unwrap_err();

    assert_eq!(machine_error_reason(&err), Some(MachineStatusError::CreateError));
    assert!(err.to_string().contains("timed out"));
}

/// Story: an unknown image degrades to the configured default
#[tokio::test]
async fn story_unknown_image_uses_default() {
    let mut compute = MockComputeService::new();
    compute
        .expect_images_get_from_family()
        .returning(|_, family| Err(Error::not_found(format!("family {}", family))));
    instance_missing(&mut compute);
    let inserted = recording_insert(&mut compute);

    let actuator = GceActuator::builder(Arc::new(compute))
        .machine_setup(Arc::new(setup()))
        .remote(Arc::new(MockRemoteCommand::new()))
        .clock(Arc::new(ManualClock::new()))
        .config(ActuatorConfig::default().with_default_image("projects/p/global/images/fallback"))
        .build();

    actuator
        .create(&cluster(), &mut worker("worker-0"))
        .await
        .expect("create falls back to the default image");

    let inserted = inserted.lock().unwrap();
    let boot = inserted[0].2.disks[0].initialize_params.as_ref().unwrap();
    assert_eq!(
        boot.source_image.as_deref(),
        Some("projects/p/global/images/fallback")
    );
}

// =============================================================================
// Delete
// =============================================================================

/// Story: deleting a machine without an instance touches nothing
#[tokio::test]
async fn story_delete_missing_instance_is_noop() {
    let mut compute = MockComputeService::new();
    instance_missing(&mut compute);
    compute.expect_instances_delete().never();

    let mut machine = worker("worker-0");
    machine.metadata.finalizers = Some(vec![crate::MACHINE_FINALIZER.to_string()]);
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    actuator
        .delete(&cluster(), &mut machine)
        .await
        .expect("nothing to delete");
    assert!(writes.updates().is_empty());
    assert!(writes.statuses().is_empty());
}

/// Story: delete targets the annotated location and drops the finalizer
#[tokio::test]
async fn story_delete_uses_annotated_location() {
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let captured = deleted.clone();

    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .returning(|_, _, _| Ok(Instance::default()));
    compute
        .expect_instances_delete()
        .times(1)
        .returning(move |project, zone, name| {
            captured
                .lock()
                .unwrap()
                .push((project.to_string(), zone.to_string(), name.to_string()));
            Ok(done_operation("delete"))
        });

    let mut machine = worker("worker-0");
    machine.set_identity_annotations("annotated-proj", "europe-west1-b", "worker-0-legacy");
    machine.metadata.finalizers = Some(vec![
        crate::MACHINE_FINALIZER.to_string(),
        "example.com/other".to_string(),
    ]);
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    actuator
        .delete(&cluster(), &mut machine)
        .await
        .expect("delete should succeed");

    assert_eq!(
        *deleted.lock().unwrap(),
        vec![(
            "annotated-proj".to_string(),
            "europe-west1-b".to_string(),
            "worker-0-legacy".to_string()
        )]
    );
    let updates = writes.updates();
    assert_eq!(
        updates[0].metadata.finalizers,
        Some(vec!["example.com/other".to_string()])
    );
    assert_eq!(
        machine.metadata.finalizers,
        Some(vec!["example.com/other".to_string()])
    );
}

/// Story: a failed delete operation is recorded as a delete error
#[tokio::test]
async fn story_delete_failure_is_recorded() {
    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .returning(|_, _, _| Ok(Instance::default()));
    compute.expect_instances_delete().returning(|_, _, _| {
        Ok(Operation {
            error: Some(OperationError {
                errors: vec![OperationErrorItem {
                    code: "RESOURCE_IN_USE_BY_ANOTHER_RESOURCE".to_string(),
                    message: "disk in use".to_string(),
                }],
            }),
            ..done_operation("delete")
        })
    });

    let mut machine = worker("worker-0");
    machine.metadata.finalizers = Some(vec![crate::MACHINE_FINALIZER.to_string()]);
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    let err = actuator.delete(&cluster(), &mut machine).await.unwrap_err();

    assert_eq!(machine_error_reason(&err), Some(MachineStatusError::DeleteError));
    assert!(err.to_string().contains("error deleting GCE instance: "));
    assert!(err.to_string().contains("disk in use"));
    assert_eq!(
        writes.last_status().error_reason,
        Some(MachineStatusError::DeleteError)
    );
    assert!(writes.updates().is_empty());
}

// =============================================================================
// Update
// =============================================================================

/// Story: an unchanged machine is left alone
#[tokio::test]
async fn story_unchanged_machine_is_not_touched() {
    let machine = worker("worker-0");
    let mut goal = provisioned_as(machine.clone(), &machine);
    let actuator = actuator(MockComputeService::new(), None, MockRemoteCommand::new());

    actuator
        .update(&cluster(), &mut goal)
        .await
        .expect("nothing to update");
}

/// Story: a changed worker is deleted and created again
#[tokio::test]
async fn story_worker_update_replaces_instance() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let deleted = Arc::new(AtomicBool::new(false));

    let mut compute = MockComputeService::new();
    images_exist(&mut compute);
    let gone = deleted.clone();
    compute.expect_instances_get().returning(move |_, _, name| {
        if gone.load(Ordering::SeqCst) {
            Err(Error::not_found(format!("instance {}", name)))
        } else {
            Ok(Instance::default())
        }
    });
    let (gone, log) = (deleted.clone(), events.clone());
    compute
        .expect_instances_delete()
        .times(1)
        .returning(move |_, _, _| {
            gone.store(true, Ordering::SeqCst);
            log.lock().unwrap().push("delete");
            Ok(done_operation("delete"))
        });
    let log = events.clone();
    compute
        .expect_instances_insert()
        .times(1)
        .returning(move |_, _, _| {
            log.lock().unwrap().push("insert");
            Ok(done_operation("insert"))
        });

    let old = worker("worker-0");
    let goal = machine("worker-0", MachineRole::Node, "1.9.5", "");
    let mut goal = provisioned_as(goal, &old);
    goal.metadata.finalizers = Some(vec![crate::MACHINE_FINALIZER.to_string()]);
    let (client, writes) = recording_client(goal.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    actuator
        .update(&cluster(), &mut goal)
        .await
        .expect("worker replacement should succeed");

    assert_eq!(*events.lock().unwrap(), vec!["delete", "insert"]);
    let applied = writes.last_status().last_applied.expect("snapshot");
    assert_eq!(applied.spec.versions.kubelet, "1.9.5");
    // finalizers survive a replacement
    let updates = writes.updates();
    assert!(!updates.is_empty());
    assert!(updates.iter().all(|m| {
        m.metadata.finalizers == Some(vec![crate::MACHINE_FINALIZER.to_string()])
    }));
}

/// Story: a master is upgraded in place over remote commands
#[tokio::test]
async fn story_master_update_runs_in_place() {
    let mut compute = MockComputeService::new();
    compute.expect_instances_insert().never();
    compute.expect_instances_delete().never();
    let (remote, commands) = recording_remote(false);

    let old = master("master-0");
    let goal = machine("master-0", MachineRole::Master, "1.9.4", "1.9.5");
    let mut goal = provisioned_as(goal, &old);
    let (client, writes) = recording_client(goal.clone());
    let actuator = actuator(compute, Some(client), remote);

    actuator
        .update(&cluster(), &mut goal)
        .await
        .expect("in-place upgrade should succeed");

    let commands = commands.lock().unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[0].0,
        RemoteTarget {
            project: PROJECT.to_string(),
            zone: ZONE.to_string(),
            name: "master-0".to_string(),
        }
    );
    assert_eq!(commands[1].1, "sudo kubeadm upgrade apply v1.9.5 -y");

    let applied = writes.last_status().last_applied.expect("snapshot");
    assert_eq!(applied.spec.versions.control_plane, "1.9.5");
}

/// Story: a failed master upgrade is recorded and the snapshot is kept
#[tokio::test]
async fn story_master_upgrade_failure_is_recorded() {
    let (remote, _) = recording_remote(true);
    let old = master("master-0");
    let goal = machine("master-0", MachineRole::Master, "1.9.4", "1.9.5");
    let mut goal = provisioned_as(goal, &old);
    let (client, writes) = recording_client(goal.clone());
    let actuator = actuator(MockComputeService::new(), Some(client), remote);

    let err = actuator.update(&cluster(), &mut goal).await.unwrap_err();

    assert_eq!(machine_error_reason(&err), Some(MachineStatusError::UpdateError));
    let status = writes.last_status();
    assert_eq!(status.error_reason, Some(MachineStatusError::UpdateError));
    assert_eq!(
        status.last_applied.map(|a| a.spec.versions.control_plane),
        Some("1.9.4".to_string())
    );
}

/// Story: a bootstrap-created machine is adopted on its first managed update
#[tokio::test]
async fn story_bootstrap_machine_is_adopted() {
    let mut compute = MockComputeService::new();
    compute.expect_instances_get().returning(|_, _, _| {
        Ok(Instance {
            labels: BTreeMap::from([(crate::BOOTSTRAP_LABEL_KEY.to_string(), "true".to_string())]),
            ..Default::default()
        })
    });

    let mut goal = master("master-0");
    let (client, writes) = recording_client(goal.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    actuator
        .update(&cluster(), &mut goal)
        .await
        .expect("bootstrap machine is adopted");

    assert_eq!(
        writes.updates()[0].identity_annotations(),
        Some((PROJECT.to_string(), ZONE.to_string(), "master-0".to_string()))
    );
    assert!(writes.last_status().last_applied.is_some());
}

/// Story: without recorded state or bootstrap label the update gives up
#[tokio::test]
async fn story_update_without_state_fails() {
    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .returning(|_, _, _| Ok(Instance::default()));

    let mut goal = worker("worker-0");
    let (client, writes) = recording_client(goal.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    let err = actuator.update(&cluster(), &mut goal).await.unwrap_err();
    assert_eq!(machine_error_reason(&err), Some(MachineStatusError::UpdateError));
    assert!(err
        .to_string()
        .contains("Cannot retrieve current state to update machine worker-0"));
    assert!(writes.updates().is_empty());

    let status = writes.last_status();
    assert_eq!(status.error_reason, Some(MachineStatusError::UpdateError));
    assert!(status
        .error_message
        .is_some_and(|m| m.contains("Cannot retrieve current state")));
    assert!(status.last_applied.is_none());
}

// =============================================================================
// Exists / GetIP / kubeconfig
// =============================================================================

#[rstest]
#[case::present(true)]
#[case::absent(false)]
#[tokio::test]
async fn test_exists(#[case] present: bool) {
    let mut compute = MockComputeService::new();
    compute.expect_instances_get().returning(move |_, _, name| {
        if present {
            Ok(Instance::default())
        } else {
            Err(Error::not_found(format!("instance {}", name)))
        }
    });
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    let exists = actuator
        .exists(&cluster(), &worker("worker-0"))
        .await
        .expect("lookup succeeds");
    assert_eq!(exists, present);
}

#[tokio::test]
async fn test_exists_propagates_provider_errors() {
    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .returning(|_, _, _| Err(Error::compute("503 backend unavailable")));
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    assert!(actuator.exists(&cluster(), &worker("worker-0")).await.is_err());
}

/// Story: the recorded identity wins over a spec that moved zones
#[tokio::test]
async fn story_recorded_identity_drives_lookup() {
    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .withf(|project, zone, name| project == PROJECT && zone == ZONE && name == "worker-0")
        .times(1)
        .returning(|_, _, _| Ok(Instance::default()));

    let old = worker("worker-0");
    let mut moved = worker("worker-0");
    moved.spec.provider_config = machine_provider_config("europe-west1-b", 10);
    let moved = provisioned_as(moved, &old);
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    assert!(actuator.exists(&cluster(), &moved).await.expect("lookup succeeds"));
}

/// Story: annotations locate an instance whose spec drifted and whose
/// snapshot never got written
///
/// The instance only answers in the annotated zone. Exists must find it and
/// Delete must remove it there instead of treating it as already gone.
#[tokio::test]
async fn story_annotations_locate_drifted_instance_without_snapshot() {
    const ANNOTATED_ZONE: &str = "europe-west1-b";

    let lookups = Arc::new(Mutex::new(Vec::new()));
    let deleted = Arc::new(Mutex::new(Vec::new()));

    let mut compute = MockComputeService::new();
    let captured = lookups.clone();
    compute.expect_instances_get().returning(move |project, zone, name| {
        captured.lock().unwrap().push(zone.to_string());
        if project == PROJECT && zone == ANNOTATED_ZONE && name == "worker-0" {
            Ok(Instance::default())
        } else {
            Err(Error::not_found(format!("instance {}", name)))
        }
    });
    let captured = deleted.clone();
    compute
        .expect_instances_delete()
        .times(1)
        .returning(move |project, zone, name| {
            captured
                .lock()
                .unwrap()
                .push((project.to_string(), zone.to_string(), name.to_string()));
            Ok(done_operation("delete"))
        });

    let mut machine = worker("worker-0");
    machine.set_identity_annotations(PROJECT, ANNOTATED_ZONE, "worker-0");
    machine.metadata.finalizers = Some(vec![crate::MACHINE_FINALIZER.to_string()]);
    let (client, writes) = recording_client(machine.clone());
    let actuator = actuator(compute, Some(client), MockRemoteCommand::new());

    assert!(actuator
        .exists(&cluster(), &machine)
        .await
        .expect("lookup succeeds"));
    actuator
        .delete(&cluster(), &mut machine)
        .await
        .expect("delete should succeed");

    assert!(lookups.lock().unwrap().iter().all(|zone| zone == ANNOTATED_ZONE));
    assert_eq!(
        *deleted.lock().unwrap(),
        vec![(
            PROJECT.to_string(),
            ANNOTATED_ZONE.to_string(),
            "worker-0".to_string()
        )]
    );
    assert_eq!(writes.updates()[0].metadata.finalizers, Some(vec![]));
}

/// Story: a recorded snapshot outranks the annotations
#[tokio::test]
async fn story_recorded_identity_outranks_annotations() {
    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .withf(|project, zone, name| project == PROJECT && zone == ZONE && name == "worker-0")
        .times(1)
        .returning(|_, _, _| Ok(Instance::default()));

    let mut machine = provisioned_as(worker("worker-0"), &worker("worker-0"));
    machine.set_identity_annotations("stale-proj", "asia-east1-a", "worker-0");
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    assert!(actuator.exists(&cluster(), &machine).await.expect("lookup succeeds"));
}

#[tokio::test]
async fn test_get_ip_reads_nat_address() {
    let mut compute = MockComputeService::new();
    compute.expect_instances_get().returning(|_, _, _| {
        Ok(Instance {
            network_interfaces: vec![NetworkInterface {
                name: "nic0".to_string(),
                access_configs: vec![AccessConfig {
                    type_: "ONE_TO_ONE_NAT".to_string(),
                    name: "External NAT".to_string(),
                    nat_ip: Some("35.1.2.3".to_string()),
                }],
                ..Default::default()
            }],
            ..Default::default()
        })
    });
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    let ip = actuator
        .get_ip(&cluster(), &master("master-0"))
        .await
        .expect("ip available");
    assert_eq!(ip, "35.1.2.3");
}

#[tokio::test]
async fn test_get_ip_without_external_address_is_empty() {
    let mut compute = MockComputeService::new();
    compute
        .expect_instances_get()
        .returning(|_, _, _| Ok(Instance::default()));
    let actuator = actuator(compute, None, MockRemoteCommand::new());

    let ip = actuator
        .get_ip(&cluster(), &master("master-0"))
        .await
        .expect("lookup succeeds");
    assert_eq!(ip, "");
}

#[tokio::test]
async fn test_get_kubeconfig_trims_output() {
    let mut remote = MockRemoteCommand::new();
    remote
        .expect_run()
        .withf(|target, cmd| target.name == "master-0" && cmd == "sudo cat /etc/kubernetes/admin.conf")
        .returning(|_, _| Ok("apiVersion: v1\nkind: Config\n\n".to_string()));
    let actuator = actuator(MockComputeService::new(), None, remote);

    let kubeconfig = actuator
        .get_kubeconfig(&cluster(), &master("master-0"))
        .await
        .expect("kubeconfig read");
    assert_eq!(kubeconfig, "apiVersion: v1\nkind: Config");
}
