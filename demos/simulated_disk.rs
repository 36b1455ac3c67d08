//! Drive a simulated Bulk-Only disk through the mass-storage driver
//!
//! This shows how to:
//! 1. Probe and configure a device
//! 2. Query volume geometry and INQUIRY identification
//! 3. Write and read back blocks with a completion callback
//!
//! Run with `RUST_LOG=debug` to see every CBW on the wire.

use std::sync::Arc;
use usb_msd::sim::{SimulatedLun, SimulatedMassStorage, SIM_BULK_IN, SIM_BULK_OUT};
use usb_msd::{
    DriverConfig, FieldValue, InquiryField, InterfaceInfo, MassStorageDriver, MsdCompletion,
    MsdData,
};

const MAGIC: u16 = 0x4D53;

fn text(value: FieldValue) -> String {
    match value {
        FieldValue::Bytes(bytes) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
        other => format!("{:?}", other),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let blocks = std::env::args()
        .nth(1)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(64 * 1024);

    let host = Arc::new(SimulatedMassStorage::new(vec![
        SimulatedLun::new(512, blocks).with_identity("RUSTSIM", "Demo Disk", "0.1"),
        SimulatedLun::new(2048, 4096).with_identity("RUSTSIM", "Demo Optical", "0.1"),
    ]));

    let config = DriverConfig::builder().buffer_size(64 * 1024).build()?;
    let driver = MassStorageDriver::new("msd", config)?;
    let minor = driver.probe(host, InterfaceInfo::bulk_only(0, SIM_BULK_IN, SIM_BULK_OUT))?;
    driver.configure_device(minor)?;

    for (node, minor) in driver.nodes() {
        println!("{} (minor {}):", node, minor);
        for volume in 0..driver.volumes(minor)? as u8 {
            println!(
                "  volume {}: {} {} - {} blocks x {} bytes = {} bytes",
                volume,
                text(driver.get_inquiry_data(minor, volume, InquiryField::VendorId)?),
                text(driver.get_inquiry_data(minor, volume, InquiryField::ProductId)?),
                driver.get_block_num(minor, volume)?,
                driver.get_block_size(minor, volume)?,
                driver.get_drive_size(minor, volume)?
            );
        }
    }

    driver.set_callback(
        MAGIC,
        1,
        Arc::new(|c: &MsdCompletion| {
            println!(
                "  completion: {:?} volume {} lba {} x{} -> {} ({} bytes)",
                c.direction,
                c.volume,
                c.start_lba,
                c.blocks,
                if c.success { "ok" } else { "failed" },
                c.bytes
            );
        }),
    )?;

    let request = MsdData::new(0, 8).with_callback(MAGIC, 1);
    let payload: Vec<u8> = (0..8 * 512).map(|i| (i % 251) as u8).collect();
    driver.write_msd(minor, &payload, 100, request)?;

    let mut back = vec![0u8; payload.len()];
    driver.read_msd(minor, &mut back, 100, request)?;
    println!("Read back {}", if back == payload { "matches" } else { "DIFFERS" });

    driver.unset_callback(MAGIC, 1)?;
    driver.disconnect(minor)?;
    Ok(())
}
