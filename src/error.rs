//! Error types for the GCE machine actuator

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for actuator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Error that is also reported on the Machine status
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// Provider resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider API error other than absence
    #[error("compute error: {0}")]
    Compute(String),

    /// A provider operation finished with errors
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A provider operation did not finish in time
    #[error("gce operation {operation_type} {name:?} timed out after {elapsed:?}")]
    OperationTimeout {
        /// Operation type (e.g. "insert")
        operation_type: String,
        /// Operation name
        name: String,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// Provider config blob could not be decoded
    #[error("provider config error: {0}")]
    ProviderConfig(String),

    /// Validation error for Machine or Cluster specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Machine setup catalog error
    #[error("machine setup error: {0}")]
    Setup(String),

    /// Remote command execution error
    #[error("remote command error: {0}")]
    Remote(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a compute error with the given message
    pub fn compute(msg: impl Into<String>) -> Self {
        Self::Compute(msg.into())
    }

    /// Create a provider config error with the given message
    pub fn provider_config(msg: impl Into<String>) -> Self {
        Self::ProviderConfig(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a machine setup error with the given message
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a remote command error with the given message
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true if the provider reported the resource as absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

/// Reason codes written to `Machine.status.errorReason`
///
/// The string forms match the Cluster API machine status errors so other
/// controllers can interpret them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub enum MachineStatusError {
    /// The Machine spec or its provider config is malformed
    InvalidConfiguration,
    /// The requested change can't be applied in place
    UnsupportedChange,
    /// The provider lacks capacity or quota
    InsufficientResources,
    /// Creating the instance failed
    CreateError,
    /// Updating the instance failed
    UpdateError,
    /// Deleting the instance failed
    DeleteError,
}

impl MachineStatusError {
    /// String form stored on the Machine status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "InvalidConfiguration",
            Self::UnsupportedChange => "UnsupportedChange",
            Self::InsufficientResources => "InsufficientResources",
            Self::CreateError => "CreateError",
            Self::UpdateError => "UpdateError",
            Self::DeleteError => "DeleteError",
        }
    }
}

impl fmt::Display for MachineStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error directed at the Machine owner
///
/// Carries a reason code plus message. The actuator returns it to the caller
/// and, when a machine client is configured, mirrors it into the status.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct MachineError {
    /// Reason code
    pub reason: MachineStatusError,
    /// Human readable message
    pub message: String,
}

impl MachineError {
    /// Create a machine error with an explicit reason
    pub fn new(reason: MachineStatusError, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// The Machine spec or provider config is malformed
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(MachineStatusError::InvalidConfiguration, message)
    }

    /// Instance creation failed
    pub fn create_machine(message: impl Into<String>) -> Self {
        Self::new(MachineStatusError::CreateError, message)
    }

    /// Instance deletion failed
    pub fn delete_machine(message: impl Into<String>) -> Self {
        Self::new(MachineStatusError::DeleteError, message)
    }

    /// Instance update failed
    pub fn update_machine(message: impl Into<String>) -> Self {
        Self::new(MachineStatusError::UpdateError, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_error_display_includes_reason() {
        let err = MachineError::create_machine("error creating GCE instance: quota exceeded");
        assert_eq!(
            err.to_string(),
            "CreateError: error creating GCE instance: quota exceeded"
        );
    }

    #[test]
    fn test_machine_error_converts_transparently() {
        let err: Error = MachineError::invalid_configuration("bad zone").into();
        assert_eq!(err.to_string(), "InvalidConfiguration: bad zone");
        assert!(matches!(
            err,
            Error::Machine(MachineError {
                reason: MachineStatusError::InvalidConfiguration,
                ..
            })
        ));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::not_found("instance vm-1").is_not_found());
        assert!(!Error::compute("Error 500").is_not_found());
        assert!(!Error::validation("empty kubelet").is_not_found());
    }

    #[test]
    fn test_kube_404_is_not_found() {
        let err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "machines \"m\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_timeout_message_names_operation() {
        let err = Error::OperationTimeout {
            operation_type: "insert".to_string(),
            name: "op-123".to_string(),
            elapsed: Duration::from_secs(600),
        };
        let msg = err.to_string();
        assert!(msg.contains("insert"));
        assert!(msg.contains("op-123"));
        assert!(msg.contains("600s"));
    }

    #[test]
    fn test_status_error_strings() {
        assert_eq!(MachineStatusError::DeleteError.as_str(), "DeleteError");
        assert_eq!(
            serde_json::to_string(&MachineStatusError::InvalidConfiguration).unwrap(),
            "\"InvalidConfiguration\""
        );
    }
}
