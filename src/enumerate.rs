//! Device enumeration
//!
//! Walks a freshly probed device through GET MAX LUN and, for every LUN,
//! INQUIRY, READ FORMAT CAPACITIES and READ CAPACITY (10, then 16 when the
//! 10-byte reply overflows). Volumes are only published once every LUN has
//! been enumerated; any failure leaves the device in [`ConfigState::Failed`].

use crate::config::DriverConfig;
use crate::device::{ConfigState, MassStorageDev};
use crate::error::{MsdError, MsdResult};
use crate::executor::{CommandExecutor, DataPhase};
use crate::scsi::{
    parse_capacity_list, CapacityDescriptor, Cdb, InquiryData, ReadCapacity10, ReadCapacity16,
    FORMAT_CAPACITIES_LEN, INQUIRY_LEN, READ_CAPACITY_10_LEN, READ_CAPACITY_16_LEN,
};
use crate::volume::{MassStorageVolume, ReadCapacity};
use crate::wrapper::MAX_LUN;
use std::time::Duration;

/// Enumerate `dev` and publish its volumes
pub fn configure(dev: &mut MassStorageDev, config: &DriverConfig) -> MsdResult<()> {
    match enumerate(dev, config) {
        Ok(volumes) => {
            for volume in &volumes {
                let (vendor, product, revision) = volume.inquiry.identification();
                log::info!(
                    "Volume {}: {} {} {} - {} blocks of {} bytes ({:?})",
                    volume.volume_number,
                    vendor,
                    product,
                    revision,
                    volume.block_num(),
                    volume.block_size(),
                    volume.version()
                );
            }
            dev.publish(volumes);
            Ok(())
        }
        Err(e) => {
            log::error!(
                "Configuring interface {} failed in {:?}: {}",
                dev.interface.interface_number,
                dev.state,
                e
            );
            dev.fail();
            Err(e)
        }
    }
}

fn enumerate(dev: &mut MassStorageDev, config: &DriverConfig) -> MsdResult<Vec<MassStorageVolume>> {
    dev.state = ConfigState::ProbingLuns;
    let max_lun = dev
        .open(config)?
        .gateway()
        .get_max_lun(config.lun_probe_timeout)?;
    if max_lun > MAX_LUN {
        return Err(MsdError::Config(format!(
            "device reports max LUN {}, limit is {}",
            max_lun, MAX_LUN
        )));
    }
    log::debug!("Device reports {} LUN(s)", max_lun as u16 + 1);

    let timeout = config.transfer_timeout;
    let mut volumes: Vec<MassStorageVolume> = (0..=max_lun).map(MassStorageVolume::new).collect();

    for volume in volumes.iter_mut() {
        let lun = volume.volume_number;

        dev.state = ConfigState::Inquiry(lun);
        volume.inquiry = inquiry(dev.executor()?, lun, timeout)?;
        volume.capacity_desc =
            format_capacities(dev.executor()?, lun, config.format_capacities_retries, timeout)?;

        dev.state = ConfigState::Capacity10(lun);
        let rc10 = read_capacity_10(dev.executor()?, lun, timeout)?;
        volume.read_capacity = if rc10.needs_16() {
            dev.state = ConfigState::Capacity16(lun);
            Some(ReadCapacity::Sixteen(read_capacity_16(dev.executor()?, lun, timeout)?))
        } else {
            Some(ReadCapacity::Ten(rc10))
        };
        volume.derive_geometry(config.capacity_policy);

        #[cfg(feature = "self-test")]
        {
            dev.state = ConfigState::SelfTest(lun);
            crate::io::run_self_test(dev.executor()?, volume, timeout)?;
        }
    }

    Ok(volumes)
}

fn inquiry(exec: &mut CommandExecutor, lun: u8, timeout: Duration) -> MsdResult<InquiryData> {
    let mut reply = [0u8; INQUIRY_LEN];
    exec.execute(lun, &Cdb::inquiry(INQUIRY_LEN as u8), DataPhase::In(&mut reply), timeout)?;
    InquiryData::from_bytes(&reply)
}

/// READ FORMAT CAPACITIES, retried only when the device rejects it
fn format_capacities(
    exec: &mut CommandExecutor,
    lun: u8,
    attempts: u32,
    timeout: Duration,
) -> MsdResult<Vec<CapacityDescriptor>> {
    let cdb = Cdb::read_format_capacities(FORMAT_CAPACITIES_LEN as u16);
    let mut reply = [0u8; FORMAT_CAPACITIES_LEN];
    let mut attempt = 1;
    loop {
        match exec.execute(lun, &cdb, DataPhase::In(&mut reply), timeout) {
            Ok(()) => return parse_capacity_list(&reply),
            Err(e @ MsdError::CommandFailed { .. }) if attempt < attempts => {
                log::debug!(
                    "READ FORMAT CAPACITIES attempt {}/{} on LUN {}: {}",
                    attempt,
                    attempts,
                    lun,
                    e
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn read_capacity_10(
    exec: &mut CommandExecutor,
    lun: u8,
    timeout: Duration,
) -> MsdResult<ReadCapacity10> {
    let mut reply = [0u8; READ_CAPACITY_10_LEN];
    exec.execute(lun, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), timeout)?;
    ReadCapacity10::from_bytes(&reply)
}

fn read_capacity_16(
    exec: &mut CommandExecutor,
    lun: u8,
    timeout: Duration,
) -> MsdResult<ReadCapacity16> {
    let mut reply = [0u8; READ_CAPACITY_16_LEN];
    exec.execute(
        lun,
        &Cdb::read_capacity_16(READ_CAPACITY_16_LEN as u32),
        DataPhase::In(&mut reply),
        timeout,
    )?;
    ReadCapacity16::from_bytes(&reply)
}
