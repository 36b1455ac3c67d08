//! Block read/write path
//!
//! Volumes discovered through READ CAPACITY(10) are addressed with READ(10) /
//! WRITE(10); volumes that needed READ CAPACITY(16) use READ(16) / WRITE(16).
//! Requests arriving from the node layer carry an [`MsdData`] word naming the
//! volume, the block count and the completion callback to notify.

use crate::error::{MsdError, MsdResult};
use crate::executor::{CommandExecutor, DataPhase};
use crate::scsi::Cdb;
use crate::sense::SenseStatus;
use crate::volume::{CapacityVersion, MassStorageVolume};
use crate::wrapper::Direction;
use std::sync::Arc;
use std::time::Duration;

/// Request word passed by the node layer with every read or write
///
/// ```text
/// Bits  | Field
/// ------+-------------------------------
/// 63-32 | block count
/// 31-24 | callback tag
/// 23-8  | callback magic number
/// 7-0   | volume
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsdData {
    pub blocks: u32,
    pub tag: u8,
    pub magic: u16,
    pub volume: u8,
}

impl MsdData {
    pub fn new(volume: u8, blocks: u32) -> Self {
        MsdData {
            blocks,
            volume,
            ..Default::default()
        }
    }

    /// Route the completion to the callback registered under `(magic, tag)`
    pub fn with_callback(mut self, magic: u16, tag: u8) -> Self {
        self.magic = magic;
        self.tag = tag;
        self
    }

    pub fn pack(&self) -> u64 {
        (self.blocks as u64) << 32
            | (self.tag as u64) << 24
            | (self.magic as u64) << 8
            | self.volume as u64
    }

    pub fn unpack(word: u64) -> Self {
        MsdData {
            blocks: (word >> 32) as u32,
            tag: ((word >> 24) & 0xFF) as u8,
            magic: ((word >> 8) & 0xFFFF) as u16,
            volume: (word & 0xFF) as u8,
        }
    }
}

impl From<u64> for MsdData {
    fn from(word: u64) -> Self {
        MsdData::unpack(word)
    }
}

impl From<MsdData> for u64 {
    fn from(data: MsdData) -> Self {
        data.pack()
    }
}

/// Outcome of a read or write, handed to the registered callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsdCompletion {
    pub minor: u8,
    pub volume: u8,
    pub direction: Direction,
    pub start_lba: u64,
    pub blocks: u32,
    /// Bytes moved; 0 on failure
    pub bytes: u64,
    pub success: bool,
    /// Decoded sense when the device rejected the command
    pub sense: Option<SenseStatus>,
}

/// Completion callback registered per `(magic, tag)`
pub type MsdCallback = Arc<dyn Fn(&MsdCompletion) + Send + Sync>;

/// Transfer size in bytes for `blocks` blocks of this volume
fn transfer_len(volume: &MassStorageVolume, blocks: u32, buffer_len: usize) -> MsdResult<usize> {
    if volume.block_size() == 0 {
        return Err(MsdError::InvalidArgument(format!(
            "volume {} has no block size",
            volume.volume_number
        )));
    }
    let len = volume.block_size() as u64 * blocks as u64;
    if len > buffer_len as u64 {
        return Err(MsdError::InvalidArgument(format!(
            "{} blocks of {} bytes do not fit a {}-byte buffer",
            blocks,
            volume.block_size(),
            buffer_len
        )));
    }
    Ok(len as usize)
}

fn rw_cdb(
    volume: &MassStorageVolume,
    lba: u64,
    blocks: u32,
    direction: Direction,
) -> MsdResult<Cdb> {
    match volume.version() {
        CapacityVersion::ReadCapacity10 => {
            let lba = u32::try_from(lba).map_err(|_| {
                MsdError::InvalidArgument(format!("LBA {} needs a 16-byte command", lba))
            })?;
            let blocks = u16::try_from(blocks).map_err(|_| {
                MsdError::InvalidArgument(format!("{} blocks exceed a 10-byte command", blocks))
            })?;
            Ok(match direction {
                Direction::In => Cdb::read_10(lba, blocks),
                Direction::Out => Cdb::write_10(lba, blocks),
            })
        }
        CapacityVersion::ReadCapacity16 => Ok(match direction {
            Direction::In => Cdb::read_16(lba, blocks),
            Direction::Out => Cdb::write_16(lba, blocks),
        }),
    }
}

/// Read `blocks` blocks starting at `lba` into the front of `buffer`
///
/// Returns the number of bytes read.
pub fn send_read(
    executor: &mut CommandExecutor,
    volume: &MassStorageVolume,
    buffer: &mut [u8],
    lba: u64,
    blocks: u32,
    timeout: Duration,
) -> MsdResult<usize> {
    let cdb = rw_cdb(volume, lba, blocks, Direction::In)?;
    let len = transfer_len(volume, blocks, buffer.len())?;
    if len == 0 {
        return Ok(0);
    }
    executor.execute(
        volume.volume_number,
        &cdb,
        DataPhase::In(&mut buffer[..len]),
        timeout,
    )?;
    Ok(len)
}

/// Write `blocks` blocks from the front of `buffer` starting at `lba`
///
/// Returns the number of bytes written.
pub fn send_write(
    executor: &mut CommandExecutor,
    volume: &MassStorageVolume,
    buffer: &[u8],
    lba: u64,
    blocks: u32,
    timeout: Duration,
) -> MsdResult<usize> {
    let cdb = rw_cdb(volume, lba, blocks, Direction::Out)?;
    let len = transfer_len(volume, blocks, buffer.len())?;
    if len == 0 {
        return Ok(0);
    }
    executor.execute(
        volume.volume_number,
        &cdb,
        DataPhase::Out(&buffer[..len]),
        timeout,
    )?;
    Ok(len)
}

/// Write pattern used by [`run_self_test`]: (LBA, blocks, fill byte)
pub const SELF_TEST_PATTERN: [(u64, u32, u8); 4] =
    [(0, 1, b'A'), (1, 4, b'B'), (5, 1, b'C'), (6, 50, b'D')];
/// Blocks covered by the pattern
pub const SELF_TEST_BLOCKS: u32 = 56;

/// Destructive write/read-back check over the first 56 blocks of a volume
///
/// Writes and the read-back are split into commands that fit the executor's
/// transfer buffer.
pub fn run_self_test(
    executor: &mut CommandExecutor,
    volume: &MassStorageVolume,
    timeout: Duration,
) -> MsdResult<()> {
    if volume.block_num() < SELF_TEST_BLOCKS as u64 {
        return Err(MsdError::Device(format!(
            "volume {} has {} blocks, self-test needs {}",
            volume.volume_number,
            volume.block_num(),
            SELF_TEST_BLOCKS
        )));
    }
    let block_size = volume.block_size() as usize;
    let chunk = chunk_blocks(executor, volume)?;
    let mut expected = vec![0u8; SELF_TEST_BLOCKS as usize * block_size];

    for (lba, blocks, fill) in SELF_TEST_PATTERN {
        let start = lba as usize * block_size;
        let end = start + blocks as usize * block_size;
        expected[start..end].fill(fill);
        for (offset, count) in chunks(blocks, chunk) {
            let from = start + offset as usize * block_size;
            let to = from + count as usize * block_size;
            send_write(executor, volume, &expected[from..to], lba + offset as u64, count, timeout)?;
        }
    }

    let mut actual = vec![0u8; expected.len()];
    for (offset, count) in chunks(SELF_TEST_BLOCKS, chunk) {
        let from = offset as usize * block_size;
        let to = from + count as usize * block_size;
        send_read(executor, volume, &mut actual[from..to], offset as u64, count, timeout)?;
    }

    if let Some(pos) = expected.iter().zip(&actual).position(|(e, a)| e != a) {
        return Err(MsdError::Device(format!(
            "self-test miscompare on volume {} at byte {}: wrote 0x{:02x}, read 0x{:02x}",
            volume.volume_number, pos, expected[pos], actual[pos]
        )));
    }
    log::info!("Self-test passed on volume {}", volume.volume_number);
    Ok(())
}

/// Whole blocks per command that fit the transfer buffer
fn chunk_blocks(executor: &CommandExecutor, volume: &MassStorageVolume) -> MsdResult<u32> {
    let block_size = volume.block_size() as usize;
    if block_size == 0 || block_size > executor.buffer_size() {
        return Err(MsdError::InvalidArgument(format!(
            "{}-byte blocks do not fit a {}-byte transfer buffer",
            block_size,
            executor.buffer_size()
        )));
    }
    Ok((executor.buffer_size() / block_size).min(u32::MAX as usize) as u32)
}

/// (offset, count) pairs covering `blocks` in steps of at most `chunk`
fn chunks(blocks: u32, chunk: u32) -> impl Iterator<Item = (u32, u32)> {
    (0..blocks)
        .step_by(chunk as usize)
        .map(move |offset| (offset, chunk.min(blocks - offset)))
}
