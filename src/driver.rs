//! Mass-storage driver front-end
//!
//! [`MassStorageDriver`] owns the slot table of attached devices, keyed by
//! minor number, plus the completion callbacks registered by the node layer.
//! Each device sits behind its own mutex, so commands to one device are
//! serialized while different devices proceed in parallel.

use crate::config::DriverConfig;
use crate::device::{probe_interface, InterfaceInfo, MassStorageDev};
use crate::enumerate;
use crate::error::{MsdError, MsdResult};
use crate::io::{self, MsdCallback, MsdCompletion, MsdData};
use crate::bulk::UsbHost;
use crate::volume::{
    CapacityField, FieldValue, InquiryField, MassStorageVolume, ReadCapacityField,
};
use crate::wrapper::Direction;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Numeric control request codes
pub mod request {
    pub const GET_SIZE: u32 = 0;
    pub const GET_BLOCK_LEN: u32 = 1;
    pub const GET_BLOCK_NUM: u32 = 2;
    pub const GET_VOLUMES: u32 = 3;
    pub const GET_CAPACITIES_FOUND: u32 = 4;
    pub const GET_INQUIRY: u32 = 5;
    pub const GET_CAPACITY: u32 = 6;
    pub const GET_SENSE: u32 = 7;
    pub const GET_READ_CAPACITY: u32 = 8;
}

/// A decoded control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    GetSize { volume: u8 },
    GetBlockLen { volume: u8 },
    GetBlockNum { volume: u8 },
    GetVolumes,
    GetCapacitiesFound { volume: u8 },
    GetInquiry { volume: u8, field: InquiryField },
    GetCapacity { volume: u8, index: usize, field: CapacityField },
    GetReadCapacity { volume: u8, field: ReadCapacityField },
}

impl ControlRequest {
    /// Decode a request code and its parameter list
    pub fn decode(code: u32, params: &[u32]) -> MsdResult<Self> {
        let expect = |n: usize, names: &str| -> MsdResult<()> {
            if params.len() == n {
                Ok(())
            } else {
                Err(MsdError::InvalidArgument(format!(
                    "request {} expects [{}], got {} parameter(s)",
                    code,
                    names,
                    params.len()
                )))
            }
        };

        let request = match code {
            request::GET_SIZE => {
                expect(1, "volume")?;
                ControlRequest::GetSize { volume: volume_param(params[0])? }
            }
            request::GET_BLOCK_LEN => {
                expect(1, "volume")?;
                ControlRequest::GetBlockLen { volume: volume_param(params[0])? }
            }
            request::GET_BLOCK_NUM => {
                expect(1, "volume")?;
                ControlRequest::GetBlockNum { volume: volume_param(params[0])? }
            }
            request::GET_VOLUMES => {
                expect(0, "")?;
                ControlRequest::GetVolumes
            }
            request::GET_CAPACITIES_FOUND => {
                expect(1, "volume")?;
                ControlRequest::GetCapacitiesFound { volume: volume_param(params[0])? }
            }
            request::GET_INQUIRY => {
                expect(2, "volume, field")?;
                ControlRequest::GetInquiry {
                    volume: volume_param(params[0])?,
                    field: InquiryField::from_u32(params[1])
                        .ok_or_else(|| bad_field("INQUIRY", params[1]))?,
                }
            }
            request::GET_CAPACITY => {
                expect(3, "volume, capacity, field")?;
                ControlRequest::GetCapacity {
                    volume: volume_param(params[0])?,
                    index: params[1] as usize,
                    field: CapacityField::from_u32(params[2])
                        .ok_or_else(|| bad_field("capacity descriptor", params[2]))?,
                }
            }
            request::GET_READ_CAPACITY => {
                expect(2, "volume, field")?;
                ControlRequest::GetReadCapacity {
                    volume: volume_param(params[0])?,
                    field: ReadCapacityField::from_u32(params[1])
                        .ok_or_else(|| bad_field("READ CAPACITY", params[1]))?,
                }
            }
            request::GET_SENSE => {
                return Err(MsdError::InvalidArgument(
                    "sense data is reported with the failing request".to_string(),
                ))
            }
            other => {
                return Err(MsdError::InvalidArgument(format!(
                    "unknown control request {}",
                    other
                )))
            }
        };
        Ok(request)
    }
}

fn volume_param(val: u32) -> MsdResult<u8> {
    u8::try_from(val)
        .map_err(|_| MsdError::InvalidArgument(format!("passed invalid volume {}", val)))
}

fn bad_field(what: &str, val: u32) -> MsdError {
    MsdError::InvalidArgument(format!("unknown {} field {}", what, val))
}

/// Split a packed callback parameter (magic in bits 15:0, tag in 23:16)
pub fn callback_key(param: u32) -> (u16, u8) {
    ((param & 0xFFFF) as u16, ((param >> 16) & 0xFF) as u8)
}

type DeviceSlot = Arc<Mutex<MassStorageDev>>;

fn lock_device(slot: &DeviceSlot) -> MsdResult<MutexGuard<'_, MassStorageDev>> {
    slot.lock()
        .map_err(|_| MsdError::Device("device lock poisoned".to_string()))
}

/// USB mass-storage class driver
pub struct MassStorageDriver {
    name: String,
    config: DriverConfig,
    slots: RwLock<BTreeMap<u8, DeviceSlot>>,
    callbacks: Mutex<HashMap<(u16, u8), MsdCallback>>,
}

impl MassStorageDriver {
    /// Create a driver; fails if `config` is out of range
    pub fn new(name: &str, config: DriverConfig) -> MsdResult<Self> {
        config.validate()?;
        Ok(MassStorageDriver {
            name: name.to_string(),
            config,
            slots: RwLock::new(BTreeMap::new()),
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Claim a mass-storage interface and return its minor number
    pub fn probe(&self, host: Arc<dyn UsbHost>, interface: InterfaceInfo) -> MsdResult<u8> {
        let endpoints = probe_interface(&interface)?;

        let mut slots = self
            .slots
            .write()
            .map_err(|_| MsdError::Device("slot table poisoned".to_string()))?;
        let minor = (0..self.config.max_devices)
            .map(|m| m as u8)
            .find(|m| !slots.contains_key(m))
            .ok_or_else(|| {
                MsdError::Device(format!(
                    "{}: all {} device slots in use",
                    self.name, self.config.max_devices
                ))
            })?;

        log::info!(
            "{}: interface {} attached as minor {} (bulk-in {:?}, bulk-out {:?})",
            self.name,
            interface.interface_number,
            minor,
            endpoints.bulk_in,
            endpoints.bulk_out
        );
        slots.insert(
            minor,
            Arc::new(Mutex::new(MassStorageDev::new(host, interface, endpoints))),
        );
        Ok(minor)
    }

    /// Release a device's slot
    pub fn disconnect(&self, minor: u8) -> MsdResult<()> {
        let mut slots = self
            .slots
            .write()
            .map_err(|_| MsdError::Device("slot table poisoned".to_string()))?;
        slots
            .remove(&minor)
            .map(|_| log::info!("{}: minor {} disconnected", self.name, minor))
            .ok_or_else(|| unknown_minor(minor))
    }

    /// Enumerate one device; failure leaves other devices untouched
    pub fn configure_device(&self, minor: u8) -> MsdResult<()> {
        let slot = self.device(minor)?;
        let mut dev = lock_device(&slot)?;
        enumerate::configure(&mut *dev, &self.config)
    }

    /// Enumerate every attached device that is not configured yet
    ///
    /// Returns the number of devices configured by this call.
    pub fn configure_all(&self) -> usize {
        self.minors()
            .into_iter()
            .filter(|&minor| {
                let pending = self
                    .with_device(minor, |dev| Ok(!dev.is_configured()))
                    .unwrap_or(false);
                pending && self.configure_device(minor).is_ok()
            })
            .count()
    }

    /// Attached minors in increasing order
    pub fn minors(&self) -> Vec<u8> {
        self.slots
            .read()
            .map(|slots| slots.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Node names for attached devices: `msd0`, `msd1`, ... in minor order
    pub fn nodes(&self) -> Vec<(String, u8)> {
        self.minors()
            .into_iter()
            .enumerate()
            .map(|(n, minor)| (format!("msd{}", n), minor))
            .collect()
    }

    fn device(&self, minor: u8) -> MsdResult<DeviceSlot> {
        self.slots
            .read()
            .map_err(|_| MsdError::Device("slot table poisoned".to_string()))?
            .get(&minor)
            .cloned()
            .ok_or_else(|| unknown_minor(minor))
    }

    fn with_device<T>(
        &self,
        minor: u8,
        f: impl FnOnce(&mut MassStorageDev) -> MsdResult<T>,
    ) -> MsdResult<T> {
        let slot = self.device(minor)?;
        let mut dev = lock_device(&slot)?;
        f(&mut *dev)
    }

    fn with_volume<T>(
        &self,
        minor: u8,
        volume: u8,
        f: impl FnOnce(&MassStorageVolume) -> MsdResult<T>,
    ) -> MsdResult<T> {
        self.with_device(minor, |dev| {
            ensure_configured(minor, dev)?;
            f(dev.volume(volume)?)
        })
    }

    pub fn is_valid_volume(&self, minor: u8, volume: u8) -> bool {
        self.with_device(minor, |dev| Ok(dev.is_valid_volume(volume)))
            .unwrap_or(false)
    }

    /// Volume size in bytes
    pub fn get_drive_size(&self, minor: u8, volume: u8) -> MsdResult<u64> {
        self.with_volume(minor, volume, |v| Ok(v.volume_size()))
    }

    pub fn get_block_size(&self, minor: u8, volume: u8) -> MsdResult<u32> {
        self.with_volume(minor, volume, |v| Ok(v.block_size()))
    }

    pub fn get_block_num(&self, minor: u8, volume: u8) -> MsdResult<u64> {
        self.with_volume(minor, volume, |v| Ok(v.block_num()))
    }

    /// Number of published volumes
    pub fn volumes(&self, minor: u8) -> MsdResult<usize> {
        self.with_device(minor, |dev| {
            ensure_configured(minor, dev)?;
            Ok(dev.volumes().len())
        })
    }

    pub fn capacity_count(&self, minor: u8, volume: u8) -> MsdResult<usize> {
        self.with_volume(minor, volume, |v| Ok(v.capacity_count()))
    }

    pub fn get_inquiry_data(
        &self,
        minor: u8,
        volume: u8,
        field: InquiryField,
    ) -> MsdResult<FieldValue> {
        self.with_volume(minor, volume, |v| Ok(v.inquiry_field(field)))
    }

    pub fn get_capacity_descriptor(
        &self,
        minor: u8,
        volume: u8,
        index: usize,
        field: CapacityField,
    ) -> MsdResult<FieldValue> {
        self.with_volume(minor, volume, |v| v.capacity_field(index, field))
    }

    pub fn get_capacity(
        &self,
        minor: u8,
        volume: u8,
        field: ReadCapacityField,
    ) -> MsdResult<FieldValue> {
        self.with_volume(minor, volume, |v| v.read_capacity_field(field))
    }

    /// Answer a control request from the node layer
    pub fn control(&self, minor: u8, request: ControlRequest) -> MsdResult<FieldValue> {
        self.with_device(minor, |dev| {
            ensure_configured(minor, dev)?;
            if let Some(volume) = request_volume(&request) {
                if !dev.is_valid_volume(volume) {
                    return Err(MsdError::InvalidArgument(format!(
                        "passed invalid volume {}",
                        volume
                    )));
                }
            }
            match request {
                ControlRequest::GetSize { volume } => {
                    Ok(FieldValue::U64(dev.volume(volume)?.volume_size()))
                }
                ControlRequest::GetBlockLen { volume } => {
                    Ok(FieldValue::U32(dev.volume(volume)?.block_size()))
                }
                ControlRequest::GetBlockNum { volume } => {
                    Ok(FieldValue::U64(dev.volume(volume)?.block_num()))
                }
                ControlRequest::GetVolumes => Ok(FieldValue::U32(dev.volumes().len() as u32)),
                ControlRequest::GetCapacitiesFound { volume } => {
                    Ok(FieldValue::U32(dev.volume(volume)?.capacity_count() as u32))
                }
                ControlRequest::GetInquiry { volume, field } => {
                    Ok(dev.volume(volume)?.inquiry_field(field))
                }
                ControlRequest::GetCapacity { volume, index, field } => {
                    dev.volume(volume)?.capacity_field(index, field)
                }
                ControlRequest::GetReadCapacity { volume, field } => {
                    dev.volume(volume)?.read_capacity_field(field)
                }
            }
        })
    }

    /// Register `callback` for requests tagged `(magic, tag)`
    pub fn set_callback(&self, magic: u16, tag: u8, callback: MsdCallback) -> MsdResult<()> {
        let mut callbacks = self.callbacks()?;
        if callbacks.contains_key(&(magic, tag)) {
            return Err(MsdError::InvalidArgument(format!(
                "callback 0x{:04x}/{} already registered",
                magic, tag
            )));
        }
        callbacks.insert((magic, tag), callback);
        Ok(())
    }

    pub fn unset_callback(&self, magic: u16, tag: u8) -> MsdResult<()> {
        self.callbacks()?
            .remove(&(magic, tag))
            .map(|_| ())
            .ok_or_else(|| {
                MsdError::InvalidArgument(format!(
                    "no callback registered for 0x{:04x}/{}",
                    magic, tag
                ))
            })
    }

    fn callbacks(&self) -> MsdResult<MutexGuard<'_, HashMap<(u16, u8), MsdCallback>>> {
        self.callbacks
            .lock()
            .map_err(|_| MsdError::Device("callback registry poisoned".to_string()))
    }

    /// Read `data.blocks` blocks starting at `start_lba` into `buffer`
    ///
    /// Returns the number of bytes read.
    pub fn read_msd(
        &self,
        minor: u8,
        buffer: &mut [u8],
        start_lba: u64,
        data: MsdData,
    ) -> MsdResult<u64> {
        let slot = self.device(minor)?;
        let result = {
            let mut dev = lock_device(&slot)?;
            ensure_configured(minor, &dev)?;
            let (volume, exec) = dev.io_parts(data.volume)?;
            let len = staging_len(volume, data.blocks, buffer.len());
            let mut staging = vec![0u8; len];
            let timeout = self.config.io_timeout;
            io::send_read(exec, volume, &mut staging, start_lba, data.blocks, timeout).map(|n| {
                buffer[..n].copy_from_slice(&staging[..n]);
                n as u64
            })
        };
        self.notify(minor, Direction::In, start_lba, data, &result);
        result
    }

    /// Write `data.blocks` blocks from `buffer` starting at `start_lba`
    ///
    /// Returns the number of bytes written.
    pub fn write_msd(
        &self,
        minor: u8,
        buffer: &[u8],
        start_lba: u64,
        data: MsdData,
    ) -> MsdResult<u64> {
        let slot = self.device(minor)?;
        let result = {
            let mut dev = lock_device(&slot)?;
            ensure_configured(minor, &dev)?;
            let (volume, exec) = dev.io_parts(data.volume)?;
            let len = staging_len(volume, data.blocks, buffer.len());
            let staging = buffer[..len].to_vec();
            io::send_write(exec, volume, &staging, start_lba, data.blocks, self.config.io_timeout)
                .map(|n| n as u64)
        };
        self.notify(minor, Direction::Out, start_lba, data, &result);
        result
    }

    fn notify(
        &self,
        minor: u8,
        direction: Direction,
        start_lba: u64,
        data: MsdData,
        result: &MsdResult<u64>,
    ) {
        let callback = match self.callbacks() {
            Ok(callbacks) => callbacks.get(&(data.magic, data.tag)).cloned(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(&MsdCompletion {
                minor,
                volume: data.volume,
                direction,
                start_lba,
                blocks: data.blocks,
                bytes: *result.as_ref().unwrap_or(&0),
                success: result.is_ok(),
                sense: result.as_ref().err().and_then(|e| e.sense_status()),
            });
        }
    }
}

/// Bytes to stage for a request, capped by the caller's buffer
fn staging_len(volume: &MassStorageVolume, blocks: u32, buffer_len: usize) -> usize {
    (volume.block_size() as u64 * blocks as u64).min(buffer_len as u64) as usize
}

fn request_volume(request: &ControlRequest) -> Option<u8> {
    match *request {
        ControlRequest::GetSize { volume }
        | ControlRequest::GetBlockLen { volume }
        | ControlRequest::GetBlockNum { volume }
        | ControlRequest::GetCapacitiesFound { volume }
        | ControlRequest::GetInquiry { volume, .. }
        | ControlRequest::GetCapacity { volume, .. }
        | ControlRequest::GetReadCapacity { volume, .. } => Some(volume),
        ControlRequest::GetVolumes => None,
    }
}

fn ensure_configured(minor: u8, dev: &MassStorageDev) -> MsdResult<()> {
    if dev.is_configured() {
        Ok(())
    } else {
        Err(MsdError::Device(format!(
            "minor {} is not configured ({:?})",
            minor, dev.state
        )))
    }
}

fn unknown_minor(minor: u8) -> MsdError {
    MsdError::Device(format!("no device at minor {}", minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_requests() {
        assert_eq!(
            ControlRequest::decode(request::GET_SIZE, &[1]).unwrap(),
            ControlRequest::GetSize { volume: 1 }
        );
        assert_eq!(
            ControlRequest::decode(request::GET_INQUIRY, &[0, 16]).unwrap(),
            ControlRequest::GetInquiry {
                volume: 0,
                field: InquiryField::VendorId
            }
        );
        assert_eq!(
            ControlRequest::decode(request::GET_CAPACITY, &[0, 2, 1]).unwrap(),
            ControlRequest::GetCapacity {
                volume: 0,
                index: 2,
                field: CapacityField::DescriptorCode
            }
        );
        assert_eq!(
            ControlRequest::decode(request::GET_VOLUMES, &[]).unwrap(),
            ControlRequest::GetVolumes
        );
    }

    #[test]
    fn test_decode_rejects_bad_requests() {
        assert!(ControlRequest::decode(request::GET_SIZE, &[]).is_err());
        assert!(ControlRequest::decode(request::GET_SIZE, &[256]).is_err());
        assert!(ControlRequest::decode(request::GET_INQUIRY, &[0, 99]).is_err());
        assert!(ControlRequest::decode(request::GET_SENSE, &[]).is_err());
        assert!(ControlRequest::decode(42, &[0]).is_err());
    }

    #[test]
    fn test_callback_key() {
        assert_eq!(callback_key(0x00AB_1234), (0x1234, 0xAB));
    }

    use crate::sim::{SimulatedLun, SimulatedMassStorage, SIM_BULK_IN, SIM_BULK_OUT};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn attach(
        driver: &MassStorageDriver,
        luns: Vec<SimulatedLun>,
    ) -> (Arc<SimulatedMassStorage>, u8) {
        let sim = Arc::new(SimulatedMassStorage::new(luns));
        let minor = driver
            .probe(sim.clone(), InterfaceInfo::bulk_only(0, SIM_BULK_IN, SIM_BULK_OUT))
            .unwrap();
        (sim, minor)
    }

    #[test]
    fn test_configure_and_query() {
        let driver = MassStorageDriver::new("msd", DriverConfig::default()).unwrap();
        let (_sim, minor) = attach(&driver, vec![SimulatedLun::new(512, 2048)]);

        assert!(driver.get_drive_size(minor, 0).is_err());
        driver.configure_device(minor).unwrap();

        assert_eq!(driver.volumes(minor).unwrap(), 1);
        assert_eq!(driver.get_block_size(minor, 0).unwrap(), 512);
        assert_eq!(driver.get_block_num(minor, 0).unwrap(), 2048);
        assert_eq!(driver.get_drive_size(minor, 0).unwrap(), 2048 * 512);
        assert!(driver.is_valid_volume(minor, 0));
        assert!(!driver.is_valid_volume(minor, 1));
        assert_eq!(
            driver.control(minor, ControlRequest::GetBlockLen { volume: 0 }).unwrap(),
            FieldValue::U32(512)
        );
        assert!(matches!(
            driver.control(minor, ControlRequest::GetSize { volume: 3 }),
            Err(MsdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lowest_free_minor() {
        let config = DriverConfig::builder().max_devices(2).build().unwrap();
        let driver = MassStorageDriver::new("msd", config).unwrap();
        let (_a, first) = attach(&driver, vec![SimulatedLun::new(512, 64)]);
        let (_b, second) = attach(&driver, vec![SimulatedLun::new(512, 64)]);
        assert_eq!((first, second), (0, 1));

        let extra = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 64)]));
        assert!(driver
            .probe(extra.clone(), InterfaceInfo::bulk_only(0, SIM_BULK_IN, SIM_BULK_OUT))
            .is_err());

        driver.disconnect(0).unwrap();
        assert_eq!(
            driver
                .probe(extra, InterfaceInfo::bulk_only(0, SIM_BULK_IN, SIM_BULK_OUT))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_write_read_notifies_callback() {
        let driver = MassStorageDriver::new("msd", DriverConfig::default()).unwrap();
        let (sim, minor) = attach(&driver, vec![SimulatedLun::new(512, 128)]);
        driver.configure_device(minor).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        driver
            .set_callback(
                0xBEEF,
                3,
                Arc::new(move |c: &MsdCompletion| {
                    assert!(c.success);
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let data = MsdData::new(0, 2).with_callback(0xBEEF, 3);
        let payload = vec![0x5Au8; 1024];
        assert_eq!(driver.write_msd(minor, &payload, 10, data).unwrap(), 1024);
        assert_eq!(sim.read_block(0, 11).unwrap(), vec![0x5Au8; 512]);

        let mut back = vec![0u8; 1024];
        assert_eq!(driver.read_msd(minor, &mut back, 10, data).unwrap(), 1024);
        assert_eq!(back, payload);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Not routed: different tag
        let untagged = MsdData::new(0, 1);
        driver.read_msd(minor, &mut back, 0, untagged).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        driver.unset_callback(0xBEEF, 3).unwrap();
        assert!(driver.unset_callback(0xBEEF, 3).is_err());
    }

    #[test]
    fn test_duplicate_callback_rejected() {
        let driver = MassStorageDriver::new("msd", DriverConfig::default()).unwrap();
        driver.set_callback(1, 1, Arc::new(|_: &MsdCompletion| {})).unwrap();
        assert!(driver.set_callback(1, 1, Arc::new(|_: &MsdCompletion| {})).is_err());
    }

    #[test]
    fn test_new_rejects_out_of_range_config() {
        let config = DriverConfig {
            buffer_size: 64,
            ..DriverConfig::default()
        };
        assert!(matches!(
            MassStorageDriver::new("msd", config),
            Err(MsdError::Config(_))
        ));
        let config = DriverConfig {
            max_devices: 0,
            ..DriverConfig::default()
        };
        assert!(MassStorageDriver::new("msd", config).is_err());
    }

    #[test]
    fn test_unknown_minor() {
        let driver = MassStorageDriver::new("msd", DriverConfig::default()).unwrap();
        assert!(driver.disconnect(0).is_err());
        assert!(!driver.is_valid_volume(0, 0));
        assert!(matches!(driver.get_drive_size(3, 0), Err(MsdError::Device(_))));
        assert!(driver.nodes().is_empty());
    }
}
