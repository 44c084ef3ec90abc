//! GCE machine actuator - reconciles Cluster API Machines against Compute Engine
//!
//! The actuator owns the lifecycle of the single VM instance that backs each
//! `Machine` record. It is driven by an external controller loop and must stay
//! idempotent under repeated invocation: every operation first resolves whether
//! the instance already exists and only then talks to the provider.
//!
//! # Modules
//!
//! - [`crd`] - `Machine` and `Cluster` resources plus the GCE provider configs
//! - [`compute`] - Compute Engine resource types and the provider API seam
//! - [`operation`] - Poller that waits for zone operations to finish
//! - [`image`] - Image reference resolution with a default fallback
//! - [`setup`] - Machine setup catalog (images and startup metadata)
//! - [`remote`] - Remote command execution on cluster nodes
//! - [`client`] - Persistence of Machine records
//! - [`actuator`] - The reconciliation engine (Create/Delete/Update/Exists/GetIP)
//! - [`config`] - Injected actuator constants
//! - [`error`] - Error types for the actuator

#![deny(missing_docs)]

pub mod actuator;
pub mod client;
pub mod compute;
pub mod config;
pub mod crd;
pub mod error;
pub mod image;
pub mod operation;
pub mod remote;
pub mod setup;

pub use actuator::{CertificateAuthority, GceActuator, GceActuatorBuilder, MachineActuator};
pub use config::ActuatorConfig;
pub use error::{Error, MachineError, MachineStatusError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known keys
// =============================================================================
// These keys are read back by anything that locates an instance from a
// Machine record, so they must never change.

/// Machine annotation holding the project the instance was created in
pub const PROJECT_ANNOTATION_KEY: &str = "gcp-project";

/// Machine annotation holding the zone the instance was created in
pub const ZONE_ANNOTATION_KEY: &str = "gcp-zone";

/// Machine annotation holding the instance name
pub const NAME_ANNOTATION_KEY: &str = "gcp-name";

/// Instance label marking machines created before any controller existed
///
/// The spelling matches the label already present on running instances.
pub const BOOTSTRAP_LABEL_KEY: &str = "boostrap";

/// Finalizer placed on Machines so the record outlives its instance
pub const MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";
