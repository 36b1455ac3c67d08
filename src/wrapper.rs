//! Bulk-Only Transport wrappers
//!
//! Every SCSI command travels inside a 31-byte Command Block Wrapper (CBW) sent
//! on bulk-OUT and is answered by a 13-byte Command Status Wrapper (CSW) read
//! from bulk-IN, per the USB Mass Storage Class Bulk-Only Transport 1.0
//! specification: https://www.usb.org/sites/default/files/usbmassbulk_10.pdf
//!
//! Both wrappers are little-endian on the wire. The CDB embedded in the CBW
//! keeps its own big-endian SCSI layout.

use crate::error::{MsdError, MsdResult};
use crate::scsi::ScsiOpcode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// CBW signature ("USBC" little-endian)
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// CSW signature ("USBS" little-endian)
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// CBW size on the wire
pub const CBW_LEN: usize = 31;
/// CSW size on the wire
pub const CSW_LEN: usize = 13;
/// Size of the CDB field inside a CBW
pub const COMMAND_LEN: usize = 16;
/// Highest logical unit number addressable by a CBW
pub const MAX_LUN: u8 = 15;

/// CBW direction flags (bmCBWFlags)
pub mod flags {
    /// Data phase flows device-to-host
    pub const FLAGS_IN: u8 = 0x80;
    /// Data phase flows host-to-device (or there is none)
    pub const FLAGS_OUT: u8 = 0x00;
}

/// Data phase direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn flags(self) -> u8 {
        match self {
            Direction::In => flags::FLAGS_IN,
            Direction::Out => flags::FLAGS_OUT,
        }
    }
}

/// Command Block Wrapper - 31 bytes
///
/// ```text
/// Byte  | Field
/// ------+------------------------------------------
///  0-3  | dCBWSignature (0x43425355)
///  4-7  | dCBWTag
///  8-11 | dCBWDataTransferLength
///  12   | bmCBWFlags (bit 7: 1 = IN)
///  13   | bCBWLUN (bits 0-3)
///  14   | bCBWCBLength (bits 0-4)
/// 15-30 | CBWCB (16 bytes, zero padded)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    pub signature: u32,
    /// Correlation id echoed back in the CSW
    pub tag: u32,
    /// Expected data phase length in bytes
    pub transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    /// Significant bytes of `command`
    pub command_len: u8,
    pub command: [u8; COMMAND_LEN],
}

impl CommandBlockWrapper {
    /// Fill the header fields of a CBW; the CDB starts zeroed
    pub fn build(tag: u32, transfer_length: u32, flags: u8, lun: u8, command_len: u8) -> Self {
        CommandBlockWrapper {
            signature: CBW_SIGNATURE,
            tag,
            transfer_length,
            flags,
            lun,
            command_len,
            command: [0u8; COMMAND_LEN],
        }
    }

    /// Attach a packed CDB
    pub fn with_command(mut self, command: [u8; COMMAND_LEN]) -> Self {
        self.command = command;
        self
    }

    /// Opcode carried in the first CDB byte, if it is one the driver issues
    pub fn opcode(&self) -> Option<ScsiOpcode> {
        ScsiOpcode::from_u8(self.command[0])
    }

    pub fn direction(&self) -> Direction {
        if self.flags & flags::FLAGS_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Reject a CBW that must never reach the wire
    pub fn validate(&self) -> MsdResult<()> {
        if self.signature != CBW_SIGNATURE {
            return Err(MsdError::InvalidCommand(format!(
                "bad CBW signature 0x{:08x}",
                self.signature
            )));
        }
        if self.flags != flags::FLAGS_IN && self.flags != flags::FLAGS_OUT {
            return Err(MsdError::InvalidCommand(format!(
                "bad CBW flags 0x{:02x}",
                self.flags
            )));
        }
        if self.lun > MAX_LUN {
            return Err(MsdError::InvalidCommand(format!(
                "LUN {} exceeds {}",
                self.lun, MAX_LUN
            )));
        }
        if self.command_len == 0 || self.command_len as usize > COMMAND_LEN {
            return Err(MsdError::InvalidCommand(format!(
                "command length {} outside 1..={}",
                self.command_len, COMMAND_LEN
            )));
        }
        if self.opcode().is_none() {
            return Err(MsdError::InvalidCommand(format!(
                "unsupported opcode 0x{:02x}",
                self.command[0]
            )));
        }
        Ok(())
    }

    /// Serialize into exactly 31 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CBW_LEN);
        // Writing into a Vec cannot fail
        let _ = buf.write_u32::<LittleEndian>(self.signature);
        let _ = buf.write_u32::<LittleEndian>(self.tag);
        let _ = buf.write_u32::<LittleEndian>(self.transfer_length);
        buf.push(self.flags);
        buf.push(self.lun & 0x0F);
        buf.push(self.command_len & 0x1F);
        buf.extend_from_slice(&self.command);
        buf
    }

    /// Parse a CBW
    ///
    /// Only the length is checked here; use [`validate`](Self::validate) for
    /// field checks.
    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < CBW_LEN {
            return Err(MsdError::Protocol(format!(
                "CBW too short: {} bytes, need {}",
                buf.len(),
                CBW_LEN
            )));
        }

        let mut cursor = Cursor::new(buf);
        let signature = cursor.read_u32::<LittleEndian>().map_err(io_err)?;
        let tag = cursor.read_u32::<LittleEndian>().map_err(io_err)?;
        let transfer_length = cursor.read_u32::<LittleEndian>().map_err(io_err)?;

        let mut command = [0u8; COMMAND_LEN];
        command.copy_from_slice(&buf[15..CBW_LEN]);

        Ok(CommandBlockWrapper {
            signature,
            tag,
            transfer_length,
            flags: buf[12],
            lun: buf[13] & 0x0F,
            command_len: buf[14] & 0x1F,
            command,
        })
    }
}

/// CSW status byte values (bCSWStatus)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

impl CswStatus {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(CswStatus::Passed),
            0x01 => Some(CswStatus::Failed),
            0x02 => Some(CswStatus::PhaseError),
            _ => None,
        }
    }
}

/// Command Status Wrapper - 13 bytes
///
/// ```text
/// Byte  | Field
/// ------+------------------------------------------
///  0-3  | dCSWSignature (0x53425355)
///  4-7  | dCSWTag (same as the CBW)
///  8-11 | dCSWDataResidue
///  12   | bCSWStatus
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub signature: u32,
    pub tag: u32,
    /// Bytes of the data phase that were not transferred
    pub data_residue: u32,
    pub status: u8,
}

impl CommandStatusWrapper {
    pub fn new(tag: u32, data_residue: u32, status: CswStatus) -> Self {
        CommandStatusWrapper {
            signature: CSW_SIGNATURE,
            tag,
            data_residue,
            status: status as u8,
        }
    }

    /// Command completed with nothing left over
    pub fn is_success(&self) -> bool {
        self.status == CswStatus::Passed as u8 && self.data_residue == 0
    }

    /// Check this CSW answers the CBW carrying `expected_tag`
    ///
    /// Signature and tag problems are reported before status so that a stale
    /// or corrupt CSW is never mistaken for a device-side failure.
    pub fn check(&self, expected_tag: u32) -> MsdResult<()> {
        if self.signature != CSW_SIGNATURE {
            return Err(MsdError::Protocol(format!(
                "bad CSW signature 0x{:08x}",
                self.signature
            )));
        }
        if self.tag != expected_tag {
            return Err(MsdError::Protocol(format!(
                "CSW tag 0x{:08x} does not match CBW tag 0x{:08x}",
                self.tag, expected_tag
            )));
        }
        if !self.is_success() {
            let status = match CswStatus::from_u8(self.status) {
                Some(CswStatus::Failed) => "command failed".to_string(),
                Some(CswStatus::PhaseError) => "phase error".to_string(),
                Some(CswStatus::Passed) => "passed".to_string(),
                None => format!("reserved status 0x{:02x}", self.status),
            };
            return Err(MsdError::Protocol(format!(
                "CSW {} with residue {}",
                status, self.data_residue
            )));
        }
        Ok(())
    }

    /// Serialize into exactly 13 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CSW_LEN);
        let _ = buf.write_u32::<LittleEndian>(self.signature);
        let _ = buf.write_u32::<LittleEndian>(self.tag);
        let _ = buf.write_u32::<LittleEndian>(self.data_residue);
        buf.push(self.status);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < CSW_LEN {
            return Err(MsdError::Protocol(format!(
                "CSW too short: {} bytes, need {}",
                buf.len(),
                CSW_LEN
            )));
        }

        let mut cursor = Cursor::new(buf);
        let signature = cursor.read_u32::<LittleEndian>().map_err(io_err)?;
        let tag = cursor.read_u32::<LittleEndian>().map_err(io_err)?;
        let data_residue = cursor.read_u32::<LittleEndian>().map_err(io_err)?;
        let status = cursor.read_u8().map_err(io_err)?;

        Ok(CommandStatusWrapper {
            signature,
            tag,
            data_residue,
            status,
        })
    }
}

fn io_err(e: std::io::Error) -> MsdError {
    MsdError::Protocol(format!("truncated wrapper: {}", e))
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::command_helper;

    fn inquiry_cbw(tag: u32, lun: u8) -> CommandBlockWrapper {
        CommandBlockWrapper::build(tag, 36, flags::FLAGS_IN, lun, 6)
            .with_command(command_helper(ScsiOpcode::Inquiry, &[0, 0, 0, 0x24]))
    }

    #[test]
    fn test_cbw_layout() {
        let cbw = inquiry_cbw(0x1234_5678, 0);
        let bytes = cbw.to_bytes();
        assert_eq!(bytes.len(), CBW_LEN);
        assert_eq!(&bytes[0..4], b"USBC");
        assert_eq!(&bytes[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&bytes[8..12], &[36, 0, 0, 0]);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], 6);
        assert_eq!(bytes[15], 0x12);
        assert_eq!(bytes[19], 0x24);
    }

    #[test]
    fn test_cbw_round_trip() {
        for lun in [0u8, 3, 15] {
            let cbw = inquiry_cbw(0xDEAD_BEEF, lun);
            let parsed = CommandBlockWrapper::from_bytes(&cbw.to_bytes()).unwrap();
            assert_eq!(parsed, cbw);
            assert!(parsed.validate().is_ok());
        }
    }

    #[test]
    fn test_cbw_rejects_bad_lun() {
        let cbw = inquiry_cbw(1, 16);
        assert!(matches!(cbw.validate(), Err(MsdError::InvalidCommand(_))));
    }

    #[test]
    fn test_cbw_rejects_bad_command_len() {
        let mut cbw = inquiry_cbw(1, 0);
        cbw.command_len = 17;
        assert!(cbw.validate().is_err());
        cbw.command_len = 0;
        assert!(cbw.validate().is_err());
    }

    #[test]
    fn test_cbw_rejects_unsupported_opcode() {
        let mut cbw = inquiry_cbw(1, 0);
        cbw.command[0] = 0x1A; // MODE SENSE(6)
        assert!(cbw.validate().is_err());
    }

    #[test]
    fn test_cbw_rejects_bad_flags() {
        let mut cbw = inquiry_cbw(1, 0);
        cbw.flags = 0x40;
        assert!(cbw.validate().is_err());
    }

    #[test]
    fn test_cbw_too_short() {
        assert!(CommandBlockWrapper::from_bytes(&[0u8; 30]).is_err());
    }

    #[test]
    fn test_csw_layout() {
        let csw = CommandStatusWrapper::new(7, 0, CswStatus::Passed);
        let bytes = csw.to_bytes();
        assert_eq!(bytes.len(), CSW_LEN);
        assert_eq!(&bytes[0..4], b"USBS");
        assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
        assert_eq!(bytes[12], 0);
        assert_eq!(CommandStatusWrapper::from_bytes(&bytes).unwrap(), csw);
    }

    #[test]
    fn test_csw_classification() {
        assert!(CommandStatusWrapper::new(1, 0, CswStatus::Passed).is_success());
        assert!(!CommandStatusWrapper::new(1, 512, CswStatus::Passed).is_success());
        assert!(!CommandStatusWrapper::new(1, 0, CswStatus::Failed).is_success());
        assert!(!CommandStatusWrapper::new(1, 0, CswStatus::PhaseError).is_success());
    }

    #[test]
    fn test_csw_tag_mismatch_rejected_even_when_passed() {
        let csw = CommandStatusWrapper::new(41, 0, CswStatus::Passed);
        assert!(csw.check(41).is_ok());
        assert!(matches!(csw.check(42), Err(MsdError::Protocol(_))));
    }

    #[test]
    fn test_csw_bad_signature() {
        let mut csw = CommandStatusWrapper::new(5, 0, CswStatus::Passed);
        csw.signature = CBW_SIGNATURE;
        assert!(csw.check(5).is_err());
    }
}
