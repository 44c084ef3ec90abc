//! Custom Resource Definitions consumed by the actuator
//!
//! `Machine` and `Cluster` follow the Cluster API `cluster.k8s.io/v1alpha1`
//! shapes. Both carry an opaque [`ProviderConfig`] blob that is decoded into
//! the GCE-specific configs in [`provider_config`].

mod cluster;
mod machine;
pub mod provider_config;

pub use cluster::{ApiEndpoint, Cluster, ClusterSpec, ClusterStatus};
pub use machine::{
    derive_identity_machine, AppliedMachine, Machine, MachineIdentity, MachineRole, MachineSpec,
    MachineStatus, MachineVersionInfo, NodeMetadata,
};
pub use provider_config::{
    Disk, DiskInitializeParams, GceClusterProviderConfig, GceMachineProviderConfig,
    GceProviderConfigCodec, ProviderConfig,
};
