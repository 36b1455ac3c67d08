//! Physical device model
//!
//! Probing picks the bulk endpoint pair out of a mass-storage interface.
//! [`MassStorageDev`] then owns everything needed to talk to that device: the
//! command executor (scratch buffer, tag counter) and, once enumeration
//! succeeds, its volumes.

use crate::bulk::{BulkGateway, UsbHost, DIRECTION_MASK, ENDPOINT_MASK};
use crate::config::DriverConfig;
use crate::error::{MsdError, MsdResult};
use crate::executor::CommandExecutor;
use crate::volume::MassStorageVolume;
use std::sync::Arc;

/// USB interface class code for mass storage
pub const MASS_STORAGE_CLASS: u8 = 0x08;
/// SCSI transparent command set
pub const SUBCLASS_SCSI: u8 = 0x06;
/// Bulk-Only Transport
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

/// bmAttributes transfer type bits
pub const TRANSFER_TYPE_MASK: u8 = 0x03;
pub const TRANSFER_TYPE_BULK: u8 = 0x02;

/// The endpoint descriptor fields probing looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn bulk_in(endpoint: u8, max_packet_size: u16) -> Self {
        EndpointDescriptor {
            endpoint_address: DIRECTION_MASK | (endpoint & ENDPOINT_MASK),
            attributes: TRANSFER_TYPE_BULK,
            max_packet_size,
        }
    }

    pub fn bulk_out(endpoint: u8, max_packet_size: u16) -> Self {
        EndpointDescriptor {
            endpoint_address: endpoint & ENDPOINT_MASK,
            attributes: TRANSFER_TYPE_BULK,
            max_packet_size,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.attributes & TRANSFER_TYPE_MASK == TRANSFER_TYPE_BULK
    }

    pub fn is_in(&self) -> bool {
        self.endpoint_address & DIRECTION_MASK != 0
    }

    pub fn number(&self) -> u8 {
        self.endpoint_address & ENDPOINT_MASK
    }
}

/// Active alternate setting of an interface offered to the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub interface_number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceInfo {
    /// A SCSI/Bulk-Only mass-storage interface with one bulk pair
    pub fn bulk_only(interface_number: u8, bulk_in: u8, bulk_out: u8) -> Self {
        InterfaceInfo {
            interface_number,
            class: MASS_STORAGE_CLASS,
            subclass: SUBCLASS_SCSI,
            protocol: PROTOCOL_BULK_ONLY,
            endpoints: vec![
                EndpointDescriptor::bulk_in(bulk_in, 512),
                EndpointDescriptor::bulk_out(bulk_out, 512),
            ],
        }
    }
}

/// Bulk endpoint numbers found by [`probe_interface`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkEndpoints {
    pub bulk_in: Option<u8>,
    pub bulk_out: Option<u8>,
}

/// Accept a mass-storage interface with at least one bulk endpoint
///
/// The first bulk endpoint of each direction wins. A missing direction is
/// only detected when the device is configured.
pub fn probe_interface(interface: &InterfaceInfo) -> MsdResult<BulkEndpoints> {
    if interface.class != MASS_STORAGE_CLASS {
        return Err(MsdError::Device(format!(
            "interface {} has class 0x{:02x}, not mass storage",
            interface.interface_number, interface.class
        )));
    }

    let mut found = BulkEndpoints::default();
    for endpoint in interface.endpoints.iter().filter(|e| e.is_bulk()) {
        if endpoint.is_in() {
            found.bulk_in.get_or_insert(endpoint.number());
        } else {
            found.bulk_out.get_or_insert(endpoint.number());
        }
    }

    if found.bulk_in.is_none() && found.bulk_out.is_none() {
        return Err(MsdError::Device(format!(
            "interface {} has no bulk endpoints",
            interface.interface_number
        )));
    }
    Ok(found)
}

/// Where enumeration stands for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    /// Probed, enumeration not started
    Attached,
    ProbingLuns,
    Inquiry(u8),
    Capacity10(u8),
    Capacity16(u8),
    #[cfg(feature = "self-test")]
    SelfTest(u8),
    Configured,
    Failed,
}

/// One attached mass-storage device
pub struct MassStorageDev {
    pub interface: InterfaceInfo,
    pub endpoints: BulkEndpoints,
    pub state: ConfigState,
    host: Arc<dyn UsbHost>,
    executor: Option<CommandExecutor>,
    volumes: Vec<MassStorageVolume>,
}

impl MassStorageDev {
    pub fn new(host: Arc<dyn UsbHost>, interface: InterfaceInfo, endpoints: BulkEndpoints) -> Self {
        MassStorageDev {
            interface,
            endpoints,
            state: ConfigState::Attached,
            host,
            executor: None,
            volumes: Vec::new(),
        }
    }

    /// Build the executor; fails unless both bulk directions were found
    pub fn open(&mut self, config: &DriverConfig) -> MsdResult<&mut CommandExecutor> {
        let (bulk_in, bulk_out) = match (self.endpoints.bulk_in, self.endpoints.bulk_out) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                return Err(MsdError::Device(format!(
                    "interface {} lacks a bulk-IN/bulk-OUT pair",
                    self.interface.interface_number
                )))
            }
        };
        let gateway = BulkGateway::new(
            self.host.clone(),
            self.interface.interface_number,
            config.priority,
        );
        Ok(self.executor.insert(CommandExecutor::new(
            gateway,
            bulk_in,
            bulk_out,
            config.buffer_size,
        )))
    }

    pub fn executor(&mut self) -> MsdResult<&mut CommandExecutor> {
        self.executor
            .as_mut()
            .ok_or_else(|| MsdError::Device("device is not open".to_string()))
    }

    pub fn is_configured(&self) -> bool {
        self.state == ConfigState::Configured
    }

    /// Published volumes; empty until configuration succeeds
    pub fn volumes(&self) -> &[MassStorageVolume] {
        &self.volumes
    }

    /// Make enumerated volumes visible
    pub fn publish(&mut self, volumes: Vec<MassStorageVolume>) {
        self.volumes = volumes;
        self.state = ConfigState::Configured;
    }

    pub fn fail(&mut self) {
        self.volumes.clear();
        self.state = ConfigState::Failed;
    }

    pub fn is_valid_volume(&self, volume: u8) -> bool {
        (volume as usize) < self.volumes.len()
    }

    pub fn volume(&self, volume: u8) -> MsdResult<&MassStorageVolume> {
        self.volumes
            .get(volume as usize)
            .ok_or(MsdError::InvalidVolume {
                volume,
                volumes: self.volumes.len(),
            })
    }

    /// Volume plus the executor, for issuing I/O against it
    pub fn io_parts(
        &mut self,
        volume: u8,
    ) -> MsdResult<(&MassStorageVolume, &mut CommandExecutor)> {
        let volumes = self.volumes.len();
        let vol = self
            .volumes
            .get(volume as usize)
            .ok_or(MsdError::InvalidVolume { volume, volumes })?;
        let executor = self
            .executor
            .as_mut()
            .ok_or_else(|| MsdError::Device("device is not open".to_string()))?;
        Ok((vol, executor))
    }
}
