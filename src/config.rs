//! Actuator configuration
//!
//! Everything that used to be a process-wide default lives here and is handed
//! to the actuator at construction, so tests can shrink timeouts or swap the
//! fallback image without touching global state.

use std::time::Duration;

/// Image used when a requested image can't be resolved
pub const DEFAULT_IMAGE_PATH: &str = "projects/ubuntu-os-cloud/global/images/family/ubuntu-1710";

/// Upper bound on waiting for a single provider operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Delay between two polls of a provider operation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Smallest boot disk the actuator will create, in GiB
pub const DEFAULT_MIN_BOOT_DISK_SIZE_GB: i64 = 30;

/// Namespace Machine records are read from and written to
pub const DEFAULT_MACHINE_NAMESPACE: &str = "default";

/// Tunables injected into [`GceActuator`](crate::GceActuator)
#[derive(Clone, Debug, PartialEq)]
pub struct ActuatorConfig {
    /// Fallback image path
    pub default_image: String,
    /// Upper bound on waiting for a provider operation
    pub operation_timeout: Duration,
    /// Delay between operation polls
    pub poll_interval: Duration,
    /// Minimum boot disk size in GiB
    pub min_boot_disk_size_gb: i64,
    /// Namespace of Machine records
    pub machine_namespace: String,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_IMAGE_PATH.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_boot_disk_size_gb: DEFAULT_MIN_BOOT_DISK_SIZE_GB,
            machine_namespace: DEFAULT_MACHINE_NAMESPACE.to_string(),
        }
    }
}

impl ActuatorConfig {
    /// Override the operation timeout and poll interval
    pub fn with_polling(mut self, timeout: Duration, interval: Duration) -> Self {
        self.operation_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    /// Override the fallback image
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    /// Override the namespace Machine records live in
    pub fn with_machine_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.machine_namespace = namespace.into();
        self
    }
}
