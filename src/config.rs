//! Driver configuration
//!
//! [`DriverConfig`] is built through [`DriverConfigBuilder`], which fills in
//! defaults for anything left unset and rejects values the driver cannot work
//! with.

use crate::bulk::PRIORITY_8;
use crate::error::{MsdError, MsdResult};
use std::time::Duration;

/// Default number of device slots
pub const DEFAULT_MAX_DEVICES: usize = 8;
/// Default scratch buffer size per device
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
/// Default wait for the GET MAX LUN reply
pub const DEFAULT_LUN_PROBE_TIMEOUT: Duration = Duration::from_millis(50);
/// Default wait for each bulk transfer during enumeration
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for each bulk transfer of a read or write request
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
/// Default READ FORMAT CAPACITIES attempts
pub const DEFAULT_FORMAT_CAPACITIES_RETRIES: u32 = 5;

/// Which source decides a volume's size and block geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPolicy {
    /// First READ FORMAT CAPACITIES descriptor
    #[default]
    FirstDescriptor,
    /// Descriptor with the largest byte capacity
    LargestDescriptor,
    /// READ CAPACITY reply (last LBA + 1 blocks)
    ReadCapacity,
}

impl CapacityPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "first" | "first-descriptor" => Some(CapacityPolicy::FirstDescriptor),
            "largest" | "largest-descriptor" => Some(CapacityPolicy::LargestDescriptor),
            "read-capacity" => Some(CapacityPolicy::ReadCapacity),
            _ => None,
        }
    }
}

/// Mass-storage driver settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub max_devices: usize,
    pub buffer_size: usize,
    pub lun_probe_timeout: Duration,
    pub transfer_timeout: Duration,
    pub io_timeout: Duration,
    pub format_capacities_retries: u32,
    pub capacity_policy: CapacityPolicy,
    pub priority: u8,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            max_devices: DEFAULT_MAX_DEVICES,
            buffer_size: DEFAULT_BUFFER_SIZE,
            lun_probe_timeout: DEFAULT_LUN_PROBE_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            format_capacities_retries: DEFAULT_FORMAT_CAPACITIES_RETRIES,
            capacity_policy: CapacityPolicy::default(),
            priority: PRIORITY_8,
        }
    }
}

impl DriverConfig {
    /// Create a new builder for configuring the driver
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    /// Check the limits every driver relies on
    pub fn validate(&self) -> MsdResult<()> {
        if self.max_devices == 0 || self.max_devices > 256 {
            return Err(MsdError::Config(format!(
                "max_devices must be in 1..=256, got {}",
                self.max_devices
            )));
        }
        // Must hold the largest enumeration reply
        if self.buffer_size < crate::scsi::FORMAT_CAPACITIES_LEN {
            return Err(MsdError::Config(format!(
                "buffer_size must be at least {} bytes, got {}",
                crate::scsi::FORMAT_CAPACITIES_LEN,
                self.buffer_size
            )));
        }
        if self.buffer_size > u32::MAX as usize {
            return Err(MsdError::Config("buffer_size exceeds 4 GiB".to_string()));
        }
        for (name, timeout) in [
            ("lun_probe_timeout", self.lun_probe_timeout),
            ("transfer_timeout", self.transfer_timeout),
            ("io_timeout", self.io_timeout),
        ] {
            if timeout.is_zero() {
                return Err(MsdError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.format_capacities_retries == 0 {
            return Err(MsdError::Config(
                "format_capacities_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`DriverConfig`]
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    max_devices: Option<usize>,
    buffer_size: Option<usize>,
    lun_probe_timeout: Option<Duration>,
    transfer_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
    format_capacities_retries: Option<u32>,
    capacity_policy: Option<CapacityPolicy>,
    priority: Option<u8>,
}

impl DriverConfigBuilder {
    /// Number of device slots (default: 8)
    pub fn max_devices(mut self, max: usize) -> Self {
        self.max_devices = Some(max);
        self
    }

    /// Per-device scratch buffer size in bytes (default: 32 KiB)
    ///
    /// This bounds the largest single data phase.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// GET MAX LUN wait (default: 50 ms)
    pub fn lun_probe_timeout(mut self, timeout: Duration) -> Self {
        self.lun_probe_timeout = Some(timeout);
        self
    }

    /// Per-transfer wait during enumeration (default: 5 s)
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    /// Per-transfer wait for read/write requests (default: 10 s)
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// READ FORMAT CAPACITIES attempts (default: 5)
    pub fn format_capacities_retries(mut self, retries: u32) -> Self {
        self.format_capacities_retries = Some(retries);
        self
    }

    pub fn capacity_policy(mut self, policy: CapacityPolicy) -> Self {
        self.capacity_policy = Some(policy);
        self
    }

    /// Host controller transfer priority (default: 8)
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn build(self) -> MsdResult<DriverConfig> {
        let defaults = DriverConfig::default();
        let config = DriverConfig {
            max_devices: self.max_devices.unwrap_or(defaults.max_devices),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            lun_probe_timeout: self.lun_probe_timeout.unwrap_or(defaults.lun_probe_timeout),
            transfer_timeout: self.transfer_timeout.unwrap_or(defaults.transfer_timeout),
            io_timeout: self.io_timeout.unwrap_or(defaults.io_timeout),
            format_capacities_retries: self
                .format_capacities_retries
                .unwrap_or(defaults.format_capacities_retries),
            capacity_policy: self.capacity_policy.unwrap_or(defaults.capacity_policy),
            priority: self.priority.unwrap_or(defaults.priority),
        };

        config.validate()?;
        Ok(config)
    }
}
