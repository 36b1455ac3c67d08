//! A pure Rust USB Mass Storage (Bulk-Only Transport) host driver
//!
//! This library drives SCSI block devices over the USB Bulk-Only Transport:
//! it wraps each command in a Command Block Wrapper, moves the data phase and
//! validates the Command Status Wrapper, fetching sense data on failure.
//! Users implement the `UsbHost` trait to provide the host controller's bulk
//! transfer primitive.
//!
//! # Example
//!
//! ```no_run
//! use usb_msd::sim::{SimulatedLun, SimulatedMassStorage, SIM_BULK_IN, SIM_BULK_OUT};
//! use usb_msd::{DriverConfig, InterfaceInfo, MassStorageDriver, MsdData};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 4096)]));
//! let driver = MassStorageDriver::new("msd", DriverConfig::default())?;
//!
//! let minor = driver.probe(host, InterfaceInfo::bulk_only(0, SIM_BULK_IN, SIM_BULK_OUT))?;
//! driver.configure_device(minor)?;
//!
//! let mut block = vec![0u8; 512];
//! driver.read_msd(minor, &mut block, 0, MsdData::new(0, 1))?;
//! println!("{} bytes on volume 0", driver.get_drive_size(minor, 0)?);
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod config;
pub mod device;
pub mod driver;
pub mod enumerate;
pub mod error;
pub mod executor;
pub mod io;
pub mod scsi;
pub mod sense;
pub mod sim;
pub mod volume;
pub mod wrapper;

pub use bulk::{Pipe, TransferCompletion, UsbHost};
pub use config::{CapacityPolicy, DriverConfig};
pub use device::{ConfigState, InterfaceInfo};
pub use driver::{ControlRequest, MassStorageDriver};
pub use error::{MsdError, MsdResult};
pub use io::{MsdCallback, MsdCompletion, MsdData};
pub use sense::SenseStatus;
pub use volume::{CapacityField, FieldValue, InquiryField, ReadCapacityField};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
