//! Logical unit model
//!
//! A [`MassStorageVolume`] caches everything enumeration learned about one LUN:
//! the INQUIRY reply, the READ FORMAT CAPACITIES descriptor list and the READ
//! CAPACITY reply. Geometry (size, block size, block count) is derived once
//! from the descriptor chosen by the [`CapacityPolicy`].
//!
//! Field selectors ([`InquiryField`], [`CapacityField`], [`ReadCapacityField`])
//! read single values out of the cached replies as a [`FieldValue`].

use crate::config::CapacityPolicy;
use crate::error::{MsdError, MsdResult};
use crate::scsi::{CapacityDescriptor, InquiryData, ReadCapacity10, ReadCapacity16};

/// Which READ CAPACITY variant a volume is addressed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityVersion {
    ReadCapacity10,
    ReadCapacity16,
}

/// Cached READ CAPACITY reply; the variant selects 10- vs 16-byte I/O commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCapacity {
    Ten(ReadCapacity10),
    Sixteen(ReadCapacity16),
}

impl ReadCapacity {
    pub fn version(&self) -> CapacityVersion {
        match self {
            ReadCapacity::Ten(_) => CapacityVersion::ReadCapacity10,
            ReadCapacity::Sixteen(_) => CapacityVersion::ReadCapacity16,
        }
    }

    /// Last addressable LBA
    pub fn last_lba(&self) -> u64 {
        match self {
            ReadCapacity::Ten(rc) => rc.logical_block_address as u64,
            ReadCapacity::Sixteen(rc) => rc.logical_block_address,
        }
    }

    pub fn block_length(&self) -> u32 {
        match self {
            ReadCapacity::Ten(rc) => rc.block_length,
            ReadCapacity::Sixteen(rc) => rc.block_length,
        }
    }
}

/// A single accessor result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// Fixed-width byte string (INQUIRY identification fields)
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn len(&self) -> usize {
        match self {
            FieldValue::U8(_) => 1,
            FieldValue::U16(_) => 2,
            FieldValue::U32(_) => 4,
            FieldValue::U64(_) => 8,
            FieldValue::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the value into `out` (integers little-endian, native to the node
    /// layer) and return the number of bytes written
    pub fn write_to(&self, out: &mut [u8]) -> MsdResult<usize> {
        let len = self.len();
        if out.len() < len {
            return Err(MsdError::InvalidArgument(format!(
                "output buffer of {} bytes cannot hold a {}-byte field",
                out.len(),
                len
            )));
        }
        match self {
            FieldValue::U8(v) => out[0] = *v,
            FieldValue::U16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            FieldValue::U32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            FieldValue::U64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
            FieldValue::Bytes(b) => out[..len].copy_from_slice(b),
        }
        Ok(len)
    }

    /// Integer view; `None` for byte strings
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U8(v) => Some(*v as u64),
            FieldValue::U16(v) => Some(*v as u64),
            FieldValue::U32(v) => Some(*v as u64),
            FieldValue::U64(v) => Some(*v),
            FieldValue::Bytes(_) => None,
        }
    }
}

/// Selectable INQUIRY fields, numbered as the control interface passes them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InquiryField {
    PeripheralQualifier,
    PeripheralDeviceType,
    Removable,
    Version,
    ResponseDataFormat,
    HiSup,
    NormAca,
    AdditionalLength,
    Sccs,
    Acc,
    Tpgs,
    ThirdPartyCopy,
    Protect,
    EncServ,
    MultiP,
    CmdQue,
    VendorId,
    ProductId,
    ProductRevision,
}

impl InquiryField {
    pub fn from_u32(val: u32) -> Option<Self> {
        use InquiryField::*;
        let field = match val {
            0 => PeripheralQualifier,
            1 => PeripheralDeviceType,
            2 => Removable,
            3 => Version,
            4 => ResponseDataFormat,
            5 => HiSup,
            6 => NormAca,
            7 => AdditionalLength,
            8 => Sccs,
            9 => Acc,
            10 => Tpgs,
            11 => ThirdPartyCopy,
            12 => Protect,
            13 => EncServ,
            14 => MultiP,
            15 => CmdQue,
            16 => VendorId,
            17 => ProductId,
            18 => ProductRevision,
            _ => return None,
        };
        Some(field)
    }

    pub fn read(self, inquiry: &InquiryData) -> FieldValue {
        use InquiryField::*;
        match self {
            PeripheralQualifier => FieldValue::U8(inquiry.peripheral_qualifier()),
            PeripheralDeviceType => FieldValue::U8(inquiry.peripheral_device_type()),
            Removable => FieldValue::U8(inquiry.removable() as u8),
            Version => FieldValue::U8(inquiry.version()),
            ResponseDataFormat => FieldValue::U8(inquiry.response_data_format()),
            HiSup => FieldValue::U8(inquiry.hisup() as u8),
            NormAca => FieldValue::U8(inquiry.normaca() as u8),
            AdditionalLength => FieldValue::U8(inquiry.additional_length()),
            Sccs => FieldValue::U8(inquiry.sccs() as u8),
            Acc => FieldValue::U8(inquiry.acc() as u8),
            Tpgs => FieldValue::U8(inquiry.tpgs()),
            ThirdPartyCopy => FieldValue::U8(inquiry.third_party_copy() as u8),
            Protect => FieldValue::U8(inquiry.protect() as u8),
            EncServ => FieldValue::U8(inquiry.encserv() as u8),
            MultiP => FieldValue::U8(inquiry.multip() as u8),
            CmdQue => FieldValue::U8(inquiry.cmdque() as u8),
            VendorId => FieldValue::Bytes(inquiry.vendor_id().to_vec()),
            ProductId => FieldValue::Bytes(inquiry.product_id().to_vec()),
            ProductRevision => FieldValue::Bytes(inquiry.product_revision().to_vec()),
        }
    }
}

/// Selectable capacity descriptor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityField {
    NumberOfBlocks,
    DescriptorCode,
    BlockLength,
}

impl CapacityField {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(CapacityField::NumberOfBlocks),
            1 => Some(CapacityField::DescriptorCode),
            2 => Some(CapacityField::BlockLength),
            _ => None,
        }
    }

    pub fn read(self, desc: &CapacityDescriptor) -> FieldValue {
        match self {
            CapacityField::NumberOfBlocks => FieldValue::U32(desc.number_of_blocks),
            CapacityField::DescriptorCode => FieldValue::U8(desc.descriptor_code),
            CapacityField::BlockLength => FieldValue::U32(desc.block_length),
        }
    }
}

/// Selectable READ CAPACITY fields
///
/// Only `LogicalBlockAddress` and `BlockLength` exist in a 10-byte reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCapacityField {
    LogicalBlockAddress,
    BlockLength,
    ProtEn,
    PType,
    PIExponent,
    Lbppbe,
    Lbpme,
    Lbprz,
    LowestAlignedLba,
}

impl ReadCapacityField {
    pub fn from_u32(val: u32) -> Option<Self> {
        use ReadCapacityField::*;
        let field = match val {
            0 => LogicalBlockAddress,
            1 => BlockLength,
            2 => ProtEn,
            3 => PType,
            4 => PIExponent,
            5 => Lbppbe,
            6 => Lbpme,
            7 => Lbprz,
            8 => LowestAlignedLba,
            _ => return None,
        };
        Some(field)
    }

    pub fn read(self, capacity: &ReadCapacity) -> MsdResult<FieldValue> {
        use ReadCapacityField::*;
        let rc = match capacity {
            ReadCapacity::Ten(rc) => {
                return match self {
                    LogicalBlockAddress => Ok(FieldValue::U32(rc.logical_block_address)),
                    BlockLength => Ok(FieldValue::U32(rc.block_length)),
                    other => Err(MsdError::InvalidArgument(format!(
                        "{:?} is not part of a READ CAPACITY(10) reply",
                        other
                    ))),
                };
            }
            ReadCapacity::Sixteen(rc) => rc,
        };
        Ok(match self {
            LogicalBlockAddress => FieldValue::U64(rc.logical_block_address),
            BlockLength => FieldValue::U32(rc.block_length),
            ProtEn => FieldValue::U8(rc.prot_en as u8),
            PType => FieldValue::U8(rc.p_type),
            PIExponent => FieldValue::U8(rc.p_i_exponent),
            Lbppbe => FieldValue::U8(rc.lbppbe),
            Lbpme => FieldValue::U8(rc.lbpme as u8),
            Lbprz => FieldValue::U8(rc.lbprz as u8),
            LowestAlignedLba => FieldValue::U16(rc.lowest_aligned_lba),
        })
    }
}

/// One logical unit of a mass-storage device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MassStorageVolume {
    pub volume_number: u8,
    pub inquiry: InquiryData,
    pub capacity_desc: Vec<CapacityDescriptor>,
    pub read_capacity: Option<ReadCapacity>,
    volume_size: u64,
    block_size: u32,
    block_num: u64,
}

impl MassStorageVolume {
    pub fn new(volume_number: u8) -> Self {
        MassStorageVolume {
            volume_number,
            inquiry: InquiryData::default(),
            capacity_desc: Vec::new(),
            read_capacity: None,
            volume_size: 0,
            block_size: 0,
            block_num: 0,
        }
    }

    /// 10-byte commands unless READ CAPACITY(16) was needed
    pub fn version(&self) -> CapacityVersion {
        self.read_capacity
            .map(|rc| rc.version())
            .unwrap_or(CapacityVersion::ReadCapacity10)
    }

    /// Recompute size, block size and block count
    ///
    /// Without a usable source the geometry stays zero.
    pub fn derive_geometry(&mut self, policy: CapacityPolicy) {
        let (blocks, block_size) = match policy {
            CapacityPolicy::FirstDescriptor => self
                .capacity_desc
                .first()
                .map(|d| (d.number_of_blocks as u64, d.block_length))
                .unwrap_or((0, 0)),
            CapacityPolicy::LargestDescriptor => self
                .capacity_desc
                .iter()
                .max_by_key(|d| d.size_bytes())
                .map(|d| (d.number_of_blocks as u64, d.block_length))
                .unwrap_or((0, 0)),
            CapacityPolicy::ReadCapacity => self
                .read_capacity
                .map(|rc| (rc.last_lba() + 1, rc.block_length()))
                .unwrap_or((0, 0)),
        };
        self.block_num = blocks;
        self.block_size = block_size;
        self.volume_size = blocks * block_size as u64;
    }

    /// Size in bytes
    pub fn volume_size(&self) -> u64 {
        self.volume_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_num(&self) -> u64 {
        self.block_num
    }

    pub fn capacity_count(&self) -> usize {
        self.capacity_desc.len()
    }

    pub fn inquiry_field(&self, field: InquiryField) -> FieldValue {
        field.read(&self.inquiry)
    }

    pub fn capacity_field(&self, index: usize, field: CapacityField) -> MsdResult<FieldValue> {
        let desc = self.capacity_desc.get(index).ok_or_else(|| {
            MsdError::InvalidArgument(format!(
                "capacity descriptor {} out of range ({} found)",
                index,
                self.capacity_desc.len()
            ))
        })?;
        Ok(field.read(desc))
    }

    pub fn read_capacity_field(&self, field: ReadCapacityField) -> MsdResult<FieldValue> {
        let rc = self.read_capacity.as_ref().ok_or_else(|| {
            MsdError::Device(format!(
                "volume {} has no READ CAPACITY data",
                self.volume_number
            ))
        })?;
        field.read(rc)
    }
}
