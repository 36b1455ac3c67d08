//! SCSI command encoding and reply decoding
//!
//! This module covers the subset of the SCSI Primary/Block Commands (SPC/SBC)
//! a Bulk-Only mass-storage host needs: building CDBs and decoding the fixed
//! reply layouts. All multi-byte CDB and reply fields are big-endian.

use crate::error::{MsdError, MsdResult};
use crate::wrapper::{Direction, COMMAND_LEN};
use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes issued by the driver
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScsiOpcode {
    RequestSense = 0x03,
    Inquiry = 0x12,
    ReadFormatCapacities = 0x23,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Read16 = 0x88,
    Write16 = 0x8A,
    ReadCapacity16 = 0x9E, // SERVICE ACTION IN(16), service action 0x10
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x03 => Some(ScsiOpcode::RequestSense),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x23 => Some(ScsiOpcode::ReadFormatCapacities),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x88 => Some(ScsiOpcode::Read16),
            0x8A => Some(ScsiOpcode::Write16),
            0x9E => Some(ScsiOpcode::ReadCapacity16),
            _ => None,
        }
    }

    /// Data phase direction for this command
    pub fn direction(self) -> Direction {
        match self {
            ScsiOpcode::Write10 | ScsiOpcode::Write16 => Direction::Out,
            _ => Direction::In,
        }
    }
}

/// SERVICE ACTION IN(16) service action selecting READ CAPACITY(16)
pub const READ_CAPACITY_16_SERVICE_ACTION: u8 = 0x10;

/// Expected reply sizes
pub const INQUIRY_LEN: usize = 36;
pub const REQUEST_SENSE_LEN: usize = 18;
pub const FORMAT_CAPACITIES_LEN: usize = 252;
pub const READ_CAPACITY_10_LEN: usize = 8;
pub const READ_CAPACITY_16_LEN: usize = 32;
pub const CAPACITY_LIST_HEADER_LEN: usize = 4;
pub const CAPACITY_DESCRIPTOR_LEN: usize = 8;
/// (252 - 4) / 8
pub const MAX_CAPACITY_DESCRIPTORS: usize = 31;

/// READ CAPACITY(10) reports this LBA when the capacity needs 64 bits
pub const READ_CAPACITY_10_SENTINEL: u32 = 0xFFFF_FFFF;

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const LOGICAL_UNIT_NOT_READY: u8 = 0x04;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const MEDIUM_CHANGED: u8 = 0x28;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Descriptor type codes in a READ FORMAT CAPACITIES descriptor (bits 1:0)
pub mod descriptor_type {
    pub const UNFORMATTED: u8 = 0x01;
    pub const FORMATTED: u8 = 0x02;
    pub const NO_MEDIA: u8 = 0x03;
}

/// Pack an opcode and up to 15 following CDB bytes into a zero-padded CDB
///
/// Fields beyond the 16th CDB byte are ignored.
pub fn command_helper(opcode: ScsiOpcode, fields: &[u8]) -> [u8; COMMAND_LEN] {
    let mut command = [0u8; COMMAND_LEN];
    command[0] = opcode as u8;
    let n = fields.len().min(COMMAND_LEN - 1);
    command[1..1 + n].copy_from_slice(&fields[..n]);
    command
}

/// A packed Command Descriptor Block plus its significant length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    pub opcode: ScsiOpcode,
    pub bytes: [u8; COMMAND_LEN],
    pub len: u8,
}

impl Cdb {
    fn new(opcode: ScsiOpcode, len: u8, fields: &[u8]) -> Self {
        Cdb {
            opcode,
            bytes: command_helper(opcode, fields),
            len,
        }
    }

    /// INQUIRY (6), standard page; allocation length in byte 4
    pub fn inquiry(alloc_len: u8) -> Self {
        Cdb::new(ScsiOpcode::Inquiry, 6, &[0, 0, 0, alloc_len])
    }

    /// REQUEST SENSE (6); allocation length in byte 4
    pub fn request_sense(alloc_len: u8) -> Self {
        Cdb::new(ScsiOpcode::RequestSense, 6, &[0, 0, 0, alloc_len])
    }

    /// READ FORMAT CAPACITIES (10); allocation length in bytes 7-8
    pub fn read_format_capacities(alloc_len: u16) -> Self {
        let mut fields = [0u8; 9];
        BigEndian::write_u16(&mut fields[6..8], alloc_len);
        Cdb::new(ScsiOpcode::ReadFormatCapacities, 10, &fields)
    }

    /// READ CAPACITY (10)
    pub fn read_capacity_10() -> Self {
        Cdb::new(ScsiOpcode::ReadCapacity10, 10, &[])
    }

    /// READ CAPACITY (16); allocation length in bytes 10-13
    pub fn read_capacity_16(alloc_len: u32) -> Self {
        let mut fields = [0u8; 15];
        fields[0] = READ_CAPACITY_16_SERVICE_ACTION;
        BigEndian::write_u32(&mut fields[9..13], alloc_len);
        Cdb::new(ScsiOpcode::ReadCapacity16, 16, &fields)
    }

    /// READ (10): LBA in bytes 2-5, block count in bytes 7-8
    pub fn read_10(lba: u32, blocks: u16) -> Self {
        Cdb::new(ScsiOpcode::Read10, 10, &rw10_fields(lba, blocks))
    }

    /// WRITE (10): same layout as READ (10)
    pub fn write_10(lba: u32, blocks: u16) -> Self {
        Cdb::new(ScsiOpcode::Write10, 10, &rw10_fields(lba, blocks))
    }

    /// READ (16): LBA in bytes 2-9, block count in bytes 10-13
    pub fn read_16(lba: u64, blocks: u32) -> Self {
        Cdb::new(ScsiOpcode::Read16, 16, &rw16_fields(lba, blocks))
    }

    /// WRITE (16): same layout as READ (16)
    pub fn write_16(lba: u64, blocks: u32) -> Self {
        Cdb::new(ScsiOpcode::Write16, 16, &rw16_fields(lba, blocks))
    }

    /// Significant CDB bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

fn rw10_fields(lba: u32, blocks: u16) -> [u8; 9] {
    let mut fields = [0u8; 9];
    BigEndian::write_u32(&mut fields[1..5], lba);
    BigEndian::write_u16(&mut fields[6..8], blocks);
    fields
}

fn rw16_fields(lba: u64, blocks: u32) -> [u8; 15] {
    let mut fields = [0u8; 15];
    BigEndian::write_u64(&mut fields[1..9], lba);
    BigEndian::write_u32(&mut fields[9..13], blocks);
    fields
}

/// Parse LBA and transfer length from a READ/WRITE 10 CDB
pub fn parse_rw10_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 10 {
        return None;
    }
    let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
    let length = BigEndian::read_u16(&cdb[7..9]) as u32;
    Some((lba, length))
}

/// Parse LBA and transfer length from a READ/WRITE 16 CDB
pub fn parse_rw16_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 16 {
        return None;
    }
    let lba = BigEndian::read_u64(&cdb[2..10]);
    let length = BigEndian::read_u32(&cdb[10..14]);
    Some((lba, length))
}

/// Standard INQUIRY reply (first 36 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryData {
    pub raw: [u8; INQUIRY_LEN],
}

impl Default for InquiryData {
    fn default() -> Self {
        InquiryData {
            raw: [0u8; INQUIRY_LEN],
        }
    }
}

impl InquiryData {
    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < INQUIRY_LEN {
            return Err(MsdError::Protocol(format!(
                "INQUIRY reply too short: {} bytes, need {}",
                buf.len(),
                INQUIRY_LEN
            )));
        }
        let mut raw = [0u8; INQUIRY_LEN];
        raw.copy_from_slice(&buf[..INQUIRY_LEN]);
        Ok(InquiryData { raw })
    }

    pub fn peripheral_qualifier(&self) -> u8 {
        self.raw[0] >> 5
    }

    pub fn peripheral_device_type(&self) -> u8 {
        self.raw[0] & 0x1F
    }

    /// RMB: removable medium
    pub fn removable(&self) -> bool {
        self.raw[1] & 0x80 != 0
    }

    pub fn version(&self) -> u8 {
        self.raw[2]
    }

    pub fn normaca(&self) -> bool {
        self.raw[3] & 0x20 != 0
    }

    pub fn hisup(&self) -> bool {
        self.raw[3] & 0x10 != 0
    }

    pub fn response_data_format(&self) -> u8 {
        self.raw[3] & 0x0F
    }

    pub fn additional_length(&self) -> u8 {
        self.raw[4]
    }

    pub fn sccs(&self) -> bool {
        self.raw[5] & 0x80 != 0
    }

    pub fn acc(&self) -> bool {
        self.raw[5] & 0x40 != 0
    }

    pub fn tpgs(&self) -> u8 {
        (self.raw[5] >> 4) & 0x03
    }

    pub fn third_party_copy(&self) -> bool {
        self.raw[5] & 0x08 != 0
    }

    pub fn protect(&self) -> bool {
        self.raw[5] & 0x01 != 0
    }

    pub fn encserv(&self) -> bool {
        self.raw[6] & 0x40 != 0
    }

    pub fn multip(&self) -> bool {
        self.raw[6] & 0x10 != 0
    }

    pub fn cmdque(&self) -> bool {
        self.raw[7] & 0x02 != 0
    }

    /// T10 vendor identification (8 bytes, space padded)
    pub fn vendor_id(&self) -> &[u8] {
        &self.raw[8..16]
    }

    /// Product identification (16 bytes, space padded)
    pub fn product_id(&self) -> &[u8] {
        &self.raw[16..32]
    }

    /// Product revision level (4 bytes, space padded)
    pub fn product_revision(&self) -> &[u8] {
        &self.raw[32..36]
    }

    /// Vendor, product and revision as trimmed strings
    pub fn identification(&self) -> (String, String, String) {
        let text = |b: &[u8]| String::from_utf8_lossy(b).trim_end().to_string();
        (
            text(self.vendor_id()),
            text(self.product_id()),
            text(self.product_revision()),
        )
    }
}

/// One entry of a READ FORMAT CAPACITIES capacity list
///
/// ```text
/// Byte | Field
/// -----+---------------------------------
/// 0-3  | Number of blocks (big-endian)
/// 4    | Descriptor type (bits 1:0)
/// 5-7  | Block length (big-endian, 24 bits)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityDescriptor {
    pub number_of_blocks: u32,
    pub descriptor_code: u8,
    pub block_length: u32,
}

impl CapacityDescriptor {
    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < CAPACITY_DESCRIPTOR_LEN {
            return Err(MsdError::Protocol(format!(
                "capacity descriptor too short: {} bytes",
                buf.len()
            )));
        }
        Ok(CapacityDescriptor {
            number_of_blocks: BigEndian::read_u32(&buf[0..4]),
            descriptor_code: buf[4] & 0x03,
            block_length: BigEndian::read_u24(&buf[5..8]),
        })
    }

    pub fn to_bytes(&self) -> [u8; CAPACITY_DESCRIPTOR_LEN] {
        let mut buf = [0u8; CAPACITY_DESCRIPTOR_LEN];
        BigEndian::write_u32(&mut buf[0..4], self.number_of_blocks);
        buf[4] = self.descriptor_code & 0x03;
        BigEndian::write_u24(&mut buf[5..8], self.block_length & 0x00FF_FFFF);
        buf
    }

    /// Capacity in bytes described by this entry
    pub fn size_bytes(&self) -> u64 {
        self.number_of_blocks as u64 * self.block_length as u64
    }
}

/// Parse a READ FORMAT CAPACITIES reply into its descriptor list
///
/// The descriptor count is `capacity list length / 8`, bounded by the bytes
/// actually present and by [`MAX_CAPACITY_DESCRIPTORS`].
pub fn parse_capacity_list(buf: &[u8]) -> MsdResult<Vec<CapacityDescriptor>> {
    if buf.len() < CAPACITY_LIST_HEADER_LEN {
        return Err(MsdError::Protocol(format!(
            "capacity list header too short: {} bytes",
            buf.len()
        )));
    }

    let capacity_len = buf[3] as usize;
    let available = (buf.len() - CAPACITY_LIST_HEADER_LEN) / CAPACITY_DESCRIPTOR_LEN;
    let count = (capacity_len / CAPACITY_DESCRIPTOR_LEN)
        .min(available)
        .min(MAX_CAPACITY_DESCRIPTORS);

    (0..count)
        .map(|i| {
            let start = CAPACITY_LIST_HEADER_LEN + i * CAPACITY_DESCRIPTOR_LEN;
            CapacityDescriptor::from_bytes(&buf[start..start + CAPACITY_DESCRIPTOR_LEN])
        })
        .collect()
}

/// READ CAPACITY (10) reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadCapacity10 {
    /// Last addressable LBA, or [`READ_CAPACITY_10_SENTINEL`]
    pub logical_block_address: u32,
    pub block_length: u32,
}

impl ReadCapacity10 {
    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < READ_CAPACITY_10_LEN {
            return Err(MsdError::Protocol(format!(
                "READ CAPACITY(10) reply too short: {} bytes",
                buf.len()
            )));
        }
        Ok(ReadCapacity10 {
            logical_block_address: BigEndian::read_u32(&buf[0..4]),
            block_length: BigEndian::read_u32(&buf[4..8]),
        })
    }

    /// Capacity does not fit the 10-byte command set
    pub fn needs_16(&self) -> bool {
        self.logical_block_address == READ_CAPACITY_10_SENTINEL
    }
}

/// READ CAPACITY (16) reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadCapacity16 {
    pub logical_block_address: u64,
    pub block_length: u32,
    pub p_type: u8,
    pub prot_en: bool,
    pub p_i_exponent: u8,
    /// Logical blocks per physical block exponent
    pub lbppbe: u8,
    pub lbpme: bool,
    pub lbprz: bool,
    pub lowest_aligned_lba: u16,
}

impl ReadCapacity16 {
    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < 16 {
            return Err(MsdError::Protocol(format!(
                "READ CAPACITY(16) reply too short: {} bytes",
                buf.len()
            )));
        }
        Ok(ReadCapacity16 {
            logical_block_address: BigEndian::read_u64(&buf[0..8]),
            block_length: BigEndian::read_u32(&buf[8..12]),
            p_type: (buf[12] >> 1) & 0x07,
            prot_en: buf[12] & 0x01 != 0,
            p_i_exponent: buf[13] >> 4,
            lbppbe: buf[13] & 0x0F,
            lbpme: buf[14] & 0x80 != 0,
            lbprz: buf[14] & 0x40 != 0,
            lowest_aligned_lba: BigEndian::read_u16(&buf[14..16]) & 0x3FFF,
        })
    }
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub response_code: u8,
    /// INFORMATION field is meaningful
    pub valid: bool,
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
    pub information: u32,
    pub fru_code: u8,
    pub sense_key_specific: [u8; 3],
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            response_code: 0x70,
            valid: false,
            sense_key,
            asc,
            ascq,
            information: 0,
            fru_code: 0,
            sense_key_specific: [0; 3],
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.valid = true;
        self.information = info;
        self
    }

    /// Decode a fixed format REQUEST SENSE reply
    pub fn from_bytes(buf: &[u8]) -> MsdResult<Self> {
        if buf.len() < 14 {
            return Err(MsdError::Protocol(format!(
                "sense data too short: {} bytes",
                buf.len()
            )));
        }
        let response_code = buf[0] & 0x7F;
        if response_code != 0x70 && response_code != 0x71 {
            return Err(MsdError::Protocol(format!(
                "unsupported sense response code 0x{:02x}",
                response_code
            )));
        }
        let mut sense_key_specific = [0u8; 3];
        let tail = buf.len().min(REQUEST_SENSE_LEN);
        if tail > 15 {
            sense_key_specific[..tail - 15].copy_from_slice(&buf[15..tail]);
        }
        Ok(SenseData {
            response_code,
            valid: buf[0] & 0x80 != 0,
            sense_key: buf[2] & 0x0F,
            asc: buf[12],
            ascq: buf[13],
            information: BigEndian::read_u32(&buf[3..7]),
            fru_code: buf.get(14).copied().unwrap_or(0),
            sense_key_specific,
        })
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; REQUEST_SENSE_LEN];

        data[0] = self.response_code | if self.valid { 0x80 } else { 0x00 };
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        // Remaining bytes after this field
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data[14] = self.fru_code;
        data[15..18].copy_from_slice(&self.sense_key_specific);

        data
    }

    /// (sense key, ASC, ASCQ)
    pub fn triple(&self) -> (u8, u8, u8) {
        (self.sense_key, self.asc, self.ascq)
    }

    /// Create sense data for invalid/unsupported command opcode
    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    /// Create sense data for LBA out of range
    pub fn lba_out_of_range(lba: u32) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0).with_info(lba)
    }

    /// Create sense data for medium error
    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0x00)
    }

    /// Create sense data for write protected
    pub fn write_protected() -> Self {
        SenseData::new(sense_key::DATA_PROTECT, asc::WRITE_PROTECTED, 0)
    }

    /// Create sense data for an empty drive
    pub fn medium_not_present() -> Self {
        SenseData::new(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT, 0)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inquiry_cdb() {
        let cdb = Cdb::inquiry(INQUIRY_LEN as u8);
        assert_eq!(cdb.len, 6);
        assert_eq!(cdb.as_slice(), &[0x12, 0, 0, 0, 0x24, 0]);
    }

    #[test]
    fn test_request_sense_cdb() {
        let cdb = Cdb::request_sense(REQUEST_SENSE_LEN as u8);
        assert_eq!(cdb.as_slice(), &[0x03, 0, 0, 0, 0x12, 0]);
    }

    #[test]
    fn test_read_format_capacities_cdb() {
        let cdb = Cdb::read_format_capacities(FORMAT_CAPACITIES_LEN as u16);
        assert_eq!(cdb.as_slice(), &[0x23, 0, 0, 0, 0, 0, 0, 0, 0xFC, 0]);
    }

    #[test]
    fn test_read_capacity_16_cdb() {
        let cdb = Cdb::read_capacity_16(32);
        assert_eq!(cdb.len, 16);
        assert_eq!(cdb.bytes[0], 0x9E);
        assert_eq!(cdb.bytes[1], 0x10);
        assert_eq!(BigEndian::read_u32(&cdb.bytes[10..14]), 32);
    }

    #[test]
    fn test_read_10_cdb() {
        let cdb = Cdb::read_10(5, 4);
        assert_eq!(cdb.as_slice(), &[0x28, 0, 0, 0, 0, 5, 0, 0, 4, 0]);
        assert_eq!(parse_rw10_cdb(cdb.as_slice()), Some((5, 4)));
    }

    #[test]
    fn test_write_16_cdb() {
        let lba = 0x0000_0001_2345_6789u64;
        let cdb = Cdb::write_16(lba, 0x10000);
        assert_eq!(cdb.bytes[0], 0x8A);
        assert_eq!(&cdb.bytes[2..10], &[0, 0, 0, 1, 0x23, 0x45, 0x67, 0x89]);
        assert_eq!(&cdb.bytes[10..14], &[0, 1, 0, 0]);
        assert_eq!(parse_rw16_cdb(cdb.as_slice()), Some((lba, 0x10000)));
    }

    #[test]
    fn test_command_helper_pads_and_truncates() {
        let cmd = command_helper(ScsiOpcode::Read16, &[1u8; 20]);
        assert_eq!(cmd[0], 0x88);
        assert!(cmd[1..].iter().all(|&b| b == 1));

        let cmd = command_helper(ScsiOpcode::ReadCapacity10, &[]);
        assert_eq!(cmd, {
            let mut c = [0u8; 16];
            c[0] = 0x25;
            c
        });
    }

    #[test]
    fn test_opcode_directions() {
        assert_eq!(ScsiOpcode::Write10.direction(), Direction::Out);
        assert_eq!(ScsiOpcode::Read16.direction(), Direction::In);
        assert_eq!(ScsiOpcode::from_u8(0x2F), None);
    }

    #[test]
    fn test_inquiry_fields() {
        let mut raw = [0u8; INQUIRY_LEN];
        raw[0] = 0x20 | 0x05; // qualifier 1, device type 5 (CD/DVD)
        raw[1] = 0x80;
        raw[2] = 0x06;
        raw[3] = 0x12;
        raw[4] = 31;
        raw[7] = 0x02;
        raw[8..16].copy_from_slice(b"SanDisk ");
        raw[16..32].copy_from_slice(b"Cruzer Blade    ");
        raw[32..36].copy_from_slice(b"1.00");

        let inquiry = InquiryData::from_bytes(&raw).unwrap();
        assert_eq!(inquiry.peripheral_qualifier(), 1);
        assert_eq!(inquiry.peripheral_device_type(), 5);
        assert!(inquiry.removable());
        assert_eq!(inquiry.version(), 6);
        assert!(inquiry.hisup());
        assert_eq!(inquiry.response_data_format(), 2);
        assert!(inquiry.cmdque());
        let (vendor, product, rev) = inquiry.identification();
        assert_eq!(vendor, "SanDisk");
        assert_eq!(product, "Cruzer Blade");
        assert_eq!(rev, "1.00");
    }

    #[test]
    fn test_capacity_list_parse() {
        let mut buf = vec![0u8; FORMAT_CAPACITIES_LEN];
        buf[3] = 16; // two descriptors
        let first = CapacityDescriptor {
            number_of_blocks: 0x0003_C000,
            descriptor_code: descriptor_type::FORMATTED,
            block_length: 512,
        };
        let second = CapacityDescriptor {
            number_of_blocks: 0x0007_8000,
            descriptor_code: 0,
            block_length: 512,
        };
        buf[4..12].copy_from_slice(&first.to_bytes());
        buf[12..20].copy_from_slice(&second.to_bytes());

        let list = parse_capacity_list(&buf).unwrap();
        assert_eq!(list, vec![first, second]);
        assert_eq!(&buf[9..12], &[0x00, 0x02, 0x00]); // 512, big-endian
    }

    #[test]
    fn test_capacity_list_bounded_by_buffer() {
        let mut buf = vec![0u8; 12];
        buf[3] = 0xF8; // claims 31 descriptors
        assert_eq!(parse_capacity_list(&buf).unwrap().len(), 1);
    }

    #[test]
    fn test_read_capacity_10_sentinel() {
        let rc = ReadCapacity10::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 2, 0]).unwrap();
        assert!(rc.needs_16());
        assert_eq!(rc.block_length, 512);

        let rc = ReadCapacity10::from_bytes(&[0, 0, 0x03, 0xE7, 0, 0, 2, 0]).unwrap();
        assert!(!rc.needs_16());
        assert_eq!(rc.logical_block_address, 999);
    }

    #[test]
    fn test_read_capacity_16_parse() {
        let mut buf = [0u8; READ_CAPACITY_16_LEN];
        BigEndian::write_u64(&mut buf[0..8], 0x1_0000_0000);
        BigEndian::write_u32(&mut buf[8..12], 4096);
        buf[12] = 0x03; // p_type 1, prot_en
        buf[13] = 0x03;
        buf[14] = 0x80;
        buf[15] = 0x08;
        let rc = ReadCapacity16::from_bytes(&buf).unwrap();
        assert_eq!(rc.logical_block_address, 0x1_0000_0000);
        assert_eq!(rc.block_length, 4096);
        assert!(rc.prot_en);
        assert_eq!(rc.p_type, 1);
        assert_eq!(rc.lbppbe, 3);
        assert!(rc.lbpme);
        assert!(!rc.lbprz);
        assert_eq!(rc.lowest_aligned_lba, 8);
    }

    #[test]
    fn test_sense_data_serialization() {
        let sense = SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0);
        let data = sense.to_bytes();
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0x70); // Current error, fixed format
        assert_eq!(data[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(data[12], asc::INVALID_FIELD_IN_CDB);
        assert_eq!(SenseData::from_bytes(&data).unwrap(), sense);
    }

    #[test]
    fn test_sense_data_valid_information() {
        let sense = SenseData::lba_out_of_range(0x1234);
        let data = sense.to_bytes();
        assert_eq!(data[0], 0xF0);
        assert_eq!(&data[3..7], &[0, 0, 0x12, 0x34]);

        let decoded = SenseData::from_bytes(&data).unwrap();
        assert!(decoded.valid);
        assert_eq!(decoded.response_code, 0x70);
        assert_eq!(decoded.information, 0x1234);
    }

    #[test]
    fn test_sense_data_rejects_descriptor_format() {
        let mut data = SenseData::medium_not_present().to_bytes();
        data[0] = 0x72;
        assert!(SenseData::from_bytes(&data).is_err());
    }
}
