//! In-memory Bulk-Only mass-storage device
//!
//! [`SimulatedMassStorage`] implements [`UsbHost`] by playing the device side
//! of the protocol: it accepts CBWs on bulk-OUT, serves the data phase and
//! answers with a CSW on bulk-IN. Each LUN is a sparse block store with a
//! configurable geometry and INQUIRY identity.
//!
//! Faults can be armed per opcode to exercise the driver's error paths:
//! failed commands with sense data, phase errors, stale tags, corrupt
//! signatures, residues, transport errors and transfers that never complete.

use crate::bulk::{transfer_status, CompletionCallback, Pipe, TransferCompletion, UsbHost};
use crate::error::MsdResult;
use crate::scsi::{
    asc, descriptor_type, parse_rw10_cdb, parse_rw16_cdb, sense_key, CapacityDescriptor,
    ScsiOpcode, SenseData, CAPACITY_DESCRIPTOR_LEN, INQUIRY_LEN, READ_CAPACITY_10_SENTINEL,
    READ_CAPACITY_16_SERVICE_ACTION, REQUEST_SENSE_LEN,
};
use crate::wrapper::{
    CommandBlockWrapper, CommandStatusWrapper, CswStatus, Direction, CBW_SIGNATURE, CSW_LEN,
};
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

/// Endpoint numbers the simulated interface exposes
pub const SIM_BULK_IN: u8 = 1;
pub const SIM_BULK_OUT: u8 = 2;

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// Geometry and identity of one simulated logical unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedLun {
    pub block_size: u32,
    pub blocks: u64,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub removable: bool,
    pub medium_present: bool,
    pub write_protected: bool,
    /// Formattable capacities listed after the current one
    pub formattable: Vec<CapacityDescriptor>,
}

impl SimulatedLun {
    pub fn new(block_size: u32, blocks: u64) -> Self {
        SimulatedLun {
            block_size,
            blocks,
            vendor: "RUSTSIM".to_string(),
            product: "Bulk-Only Disk".to_string(),
            revision: "1.00".to_string(),
            removable: true,
            medium_present: true,
            write_protected: false,
            formattable: Vec::new(),
        }
    }

    pub fn with_identity(mut self, vendor: &str, product: &str, revision: &str) -> Self {
        self.vendor = vendor.to_string();
        self.product = product.to_string();
        self.revision = revision.to_string();
        self
    }

    pub fn write_protected(mut self, protected: bool) -> Self {
        self.write_protected = protected;
        self
    }

    pub fn without_medium(mut self) -> Self {
        self.medium_present = false;
        self
    }

    pub fn with_formattable(mut self, descriptor: CapacityDescriptor) -> Self {
        self.formattable.push(descriptor);
        self
    }
}

/// Misbehavior armed against the next matching command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// CSW reports failure; REQUEST SENSE returns the given sense
    FailCommand(ScsiOpcode, SenseData),
    /// CSW reports a phase error
    PhaseError(ScsiOpcode),
    /// CSW echoes a different tag
    WrongTag(ScsiOpcode),
    /// CSW carries the CBW signature instead of the CSW one
    BadSignature(ScsiOpcode),
    /// CSW reports success with a non-zero residue
    Residue(ScsiOpcode, u32),
    /// The CBW transfer completes with `E_TRANSFER`
    TransportError(ScsiOpcode),
    /// The CBW transfer is accepted but never completes
    NoCompletion(ScsiOpcode),
}

impl Fault {
    fn opcode(&self) -> ScsiOpcode {
        match self {
            Fault::FailCommand(op, _)
            | Fault::PhaseError(op)
            | Fault::WrongTag(op)
            | Fault::BadSignature(op)
            | Fault::Residue(op, _)
            | Fault::TransportError(op)
            | Fault::NoCompletion(op) => *op,
        }
    }
}

/// Result of running a CDB against a LUN
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    /// SCSI status code
    pub status: u8,
    /// Response data (for read commands)
    pub data: Vec<u8>,
    /// Sense data (for CHECK CONDITION status)
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    pub fn good_no_data() -> Self {
        ScsiResponse::good(Vec::new())
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }
}

struct ArmedFault {
    lun: Option<u8>,
    fault: Fault,
    remaining: u32,
}

enum Phase {
    Command,
    DataIn {
        data: Vec<u8>,
        csw: CommandStatusWrapper,
    },
    DataOut {
        cbw: CommandBlockWrapper,
        fault: Option<Fault>,
    },
    Status(CommandStatusWrapper),
}

enum Outcome {
    Complete { status: u32, actual: usize },
    Hold,
}

impl Outcome {
    fn ok(actual: usize) -> Self {
        Outcome::Complete {
            status: transfer_status::S_TRANSFER,
            actual,
        }
    }

    fn stall() -> Self {
        Outcome::Complete {
            status: transfer_status::E_TRANSFER | transfer_status::E_STALLED,
            actual: 0,
        }
    }
}

struct LunState {
    config: SimulatedLun,
    storage: HashMap<u64, Vec<u8>>,
}

struct SimState {
    luns: Vec<LunState>,
    phase: Phase,
    pending_sense: HashMap<u8, SenseData>,
    faults: Vec<ArmedFault>,
    max_lun_reply: Option<u8>,
    opcode_log: Vec<(u8, ScsiOpcode)>,
    cbw_log: Vec<CommandBlockWrapper>,
}

/// Simulated Bulk-Only device reachable through [`UsbHost`]
pub struct SimulatedMassStorage {
    state: Mutex<SimState>,
    held: Mutex<Vec<CompletionCallback>>,
    asynchronous: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedMassStorage {
    pub fn new(luns: Vec<SimulatedLun>) -> Self {
        let max_lun = luns.len().saturating_sub(1).min(u8::MAX as usize) as u8;
        SimulatedMassStorage {
            state: Mutex::new(SimState {
                luns: luns
                    .into_iter()
                    .map(|config| LunState {
                        config,
                        storage: HashMap::new(),
                    })
                    .collect(),
                phase: Phase::Command,
                pending_sense: HashMap::new(),
                faults: Vec::new(),
                max_lun_reply: Some(max_lun),
                opcode_log: Vec::new(),
                cbw_log: Vec::new(),
            }),
            held: Mutex::new(Vec::new()),
            asynchronous: AtomicBool::new(false),
        }
    }

    pub fn bulk_in(&self) -> u8 {
        SIM_BULK_IN
    }

    pub fn bulk_out(&self) -> u8 {
        SIM_BULK_OUT
    }

    /// Complete transfers from a spawned thread instead of inline
    pub fn set_async(&self, asynchronous: bool) {
        self.asynchronous.store(asynchronous, Ordering::SeqCst);
    }

    /// GET MAX LUN reply; `None` never completes the request
    pub fn set_max_lun_reply(&self, reply: Option<u8>) {
        lock(&self.state).max_lun_reply = reply;
    }

    /// Arm `fault` for the next `times` matching commands on any LUN
    pub fn inject(&self, fault: Fault, times: u32) {
        self.arm(None, fault, times);
    }

    /// Arm `fault` for the next `times` matching commands on `lun`
    pub fn inject_lun(&self, lun: u8, fault: Fault, times: u32) {
        self.arm(Some(lun), fault, times);
    }

    fn arm(&self, lun: Option<u8>, fault: Fault, times: u32) {
        lock(&self.state).faults.push(ArmedFault {
            lun,
            fault,
            remaining: times,
        });
    }

    /// (LUN, opcode) of every command received, in order
    pub fn opcode_log(&self) -> Vec<(u8, ScsiOpcode)> {
        lock(&self.state).opcode_log.clone()
    }

    /// Every CBW received, in order
    pub fn cbw_log(&self) -> Vec<CommandBlockWrapper> {
        lock(&self.state).cbw_log.clone()
    }

    pub fn clear_logs(&self) {
        let mut state = lock(&self.state);
        state.opcode_log.clear();
        state.cbw_log.clear();
    }

    /// Stored contents of one block; `None` if never written
    pub fn read_block(&self, lun: u8, lba: u64) -> Option<Vec<u8>> {
        let state = lock(&self.state);
        state.luns.get(lun as usize)?.storage.get(&lba).cloned()
    }

    /// Number of callbacks held back by [`Fault::NoCompletion`] or a silent
    /// GET MAX LUN
    pub fn held_count(&self) -> usize {
        lock(&self.held).len()
    }

    fn finish(&self, outcome: Outcome, buffer: Vec<u8>, callback: CompletionCallback) {
        match outcome {
            Outcome::Complete { status, actual } => {
                let completion = TransferCompletion {
                    status,
                    buffer,
                    actual_length: actual,
                };
                if self.asynchronous.load(Ordering::SeqCst) {
                    thread::spawn(move || callback(completion));
                } else {
                    callback(completion);
                }
            }
            Outcome::Hold => lock(&self.held).push(callback),
        }
    }
}

impl UsbHost for SimulatedMassStorage {
    fn submit_bulk_transfer(
        &self,
        _interface: u8,
        pipe: Pipe,
        _priority: u8,
        mut buffer: Vec<u8>,
        len: usize,
        callback: CompletionCallback,
    ) -> MsdResult<()> {
        let len = len.min(buffer.len());
        let outcome = lock(&self.state).bulk(pipe, &mut buffer[..len]);
        self.finish(outcome, buffer, callback);
        Ok(())
    }

    fn get_max_lun(&self, _interface: u8, callback: CompletionCallback) -> MsdResult<()> {
        let reply = lock(&self.state).max_lun_reply;
        match reply {
            Some(max_lun) => self.finish(Outcome::ok(1), vec![max_lun], callback),
            None => self.finish(Outcome::Hold, Vec::new(), callback),
        }
        Ok(())
    }
}

impl SimState {
    fn bulk(&mut self, pipe: Pipe, buffer: &mut [u8]) -> Outcome {
        let phase = std::mem::replace(&mut self.phase, Phase::Command);
        match (pipe.direction, phase) {
            (Direction::Out, Phase::Command) => self.command(buffer),
            (Direction::Out, Phase::DataOut { cbw, fault }) => {
                let response = match &fault {
                    Some(Fault::FailCommand(_, sense)) => {
                        ScsiResponse::check_condition(sense.clone())
                    }
                    _ => self.execute(&cbw, Some(&*buffer)),
                };
                let csw = self.status(&cbw, &response, fault.as_ref());
                self.phase = Phase::Status(csw);
                Outcome::ok(buffer.len())
            }
            (Direction::In, Phase::DataIn { data, csw }) => {
                let n = buffer.len().min(data.len());
                buffer[..n].copy_from_slice(&data[..n]);
                self.phase = Phase::Status(csw);
                Outcome::ok(n)
            }
            (Direction::In, Phase::Status(csw)) if buffer.len() >= CSW_LEN => {
                buffer[..CSW_LEN].copy_from_slice(&csw.to_bytes());
                Outcome::ok(CSW_LEN)
            }
            (direction, _) => {
                log::debug!("Simulated device stalls unexpected {:?} transfer", direction);
                Outcome::stall()
            }
        }
    }

    fn take_fault(&mut self, lun: u8, opcode: ScsiOpcode) -> Option<Fault> {
        let index = self.faults.iter().position(|armed| {
            armed.remaining > 0
                && armed.fault.opcode() == opcode
                && armed.lun.map_or(true, |l| l == lun)
        })?;
        let armed = &mut self.faults[index];
        armed.remaining -= 1;
        let fault = armed.fault.clone();
        if armed.remaining == 0 {
            self.faults.remove(index);
        }
        Some(fault)
    }

    fn command(&mut self, bytes: &[u8]) -> Outcome {
        let cbw = match CommandBlockWrapper::from_bytes(bytes) {
            Ok(cbw) if cbw.signature == CBW_SIGNATURE => cbw,
            _ => return Outcome::stall(),
        };
        self.cbw_log.push(cbw);

        let fault = match cbw.opcode() {
            Some(opcode) => {
                self.opcode_log.push((cbw.lun, opcode));
                self.take_fault(cbw.lun, opcode)
            }
            None => None,
        };
        match fault {
            Some(Fault::TransportError(_)) => return Outcome::stall(),
            Some(Fault::NoCompletion(_)) => return Outcome::Hold,
            _ => {}
        }

        let expected = cbw.transfer_length as usize;
        if cbw.direction() == Direction::Out && expected > 0 {
            self.phase = Phase::DataOut { cbw, fault };
            return Outcome::ok(bytes.len());
        }

        let response = match &fault {
            Some(Fault::FailCommand(_, sense)) => ScsiResponse::check_condition(sense.clone()),
            _ => self.execute(&cbw, None),
        };
        let csw = self.status(&cbw, &response, fault.as_ref());
        self.phase = if expected > 0 {
            let mut data = response.data;
            data.resize(expected, 0);
            Phase::DataIn { data, csw }
        } else {
            Phase::Status(csw)
        };
        Outcome::ok(bytes.len())
    }

    /// CSW for a finished command; records sense for a later REQUEST SENSE
    fn status(
        &mut self,
        cbw: &CommandBlockWrapper,
        response: &ScsiResponse,
        fault: Option<&Fault>,
    ) -> CommandStatusWrapper {
        let mut csw = if response.status == scsi_status::GOOD {
            CommandStatusWrapper::new(cbw.tag, 0, CswStatus::Passed)
        } else {
            if let Some(sense) = &response.sense {
                self.pending_sense.insert(cbw.lun, sense.clone());
            }
            CommandStatusWrapper::new(cbw.tag, cbw.transfer_length, CswStatus::Failed)
        };

        match fault {
            Some(Fault::PhaseError(_)) => csw.status = CswStatus::PhaseError as u8,
            Some(Fault::WrongTag(_)) => csw.tag = cbw.tag.wrapping_add(1),
            Some(Fault::BadSignature(_)) => csw.signature = CBW_SIGNATURE,
            Some(Fault::Residue(_, residue)) => csw.data_residue = *residue,
            _ => {}
        }
        csw
    }

    fn execute(&mut self, cbw: &CommandBlockWrapper, write_data: Option<&[u8]>) -> ScsiResponse {
        let cdb = &cbw.command[..cbw.command_len as usize];
        let opcode = match cbw.opcode() {
            Some(opcode) => opcode,
            None => return ScsiResponse::check_condition(SenseData::invalid_command()),
        };

        if opcode == ScsiOpcode::RequestSense {
            return Self::handle_request_sense(cdb, self.pending_sense.remove(&cbw.lun));
        }

        let lun = match self.luns.get_mut(cbw.lun as usize) {
            Some(lun) => lun,
            None => {
                return ScsiResponse::check_condition(SenseData::new(
                    sense_key::ILLEGAL_REQUEST,
                    asc::LOGICAL_UNIT_NOT_SUPPORTED,
                    0,
                ))
            }
        };

        match opcode {
            ScsiOpcode::Inquiry => Self::handle_inquiry(cdb, &lun.config),
            _ if !lun.config.medium_present => {
                ScsiResponse::check_condition(SenseData::medium_not_present())
            }
            ScsiOpcode::ReadFormatCapacities => {
                Self::handle_read_format_capacities(cdb, &lun.config)
            }
            ScsiOpcode::ReadCapacity10 => Self::handle_read_capacity_10(&lun.config),
            ScsiOpcode::ReadCapacity16 => Self::handle_service_action_in_16(cdb, &lun.config),
            ScsiOpcode::Read10 => match parse_rw10_cdb(cdb) {
                Some((lba, blocks)) => Self::handle_read(lun, lba, blocks),
                None => ScsiResponse::check_condition(SenseData::invalid_command()),
            },
            ScsiOpcode::Read16 => match parse_rw16_cdb(cdb) {
                Some((lba, blocks)) => Self::handle_read(lun, lba, blocks),
                None => ScsiResponse::check_condition(SenseData::invalid_command()),
            },
            ScsiOpcode::Write10 => match parse_rw10_cdb(cdb) {
                Some((lba, blocks)) => Self::handle_write(lun, lba, blocks, write_data),
                None => ScsiResponse::check_condition(SenseData::invalid_command()),
            },
            ScsiOpcode::Write16 => match parse_rw16_cdb(cdb) {
                Some((lba, blocks)) => Self::handle_write(lun, lba, blocks, write_data),
                None => ScsiResponse::check_condition(SenseData::invalid_command()),
            },
            ScsiOpcode::RequestSense => ScsiResponse::good_no_data(),
        }
    }

    /// INQUIRY (0x12), standard page only
    fn handle_inquiry(cdb: &[u8], lun: &SimulatedLun) -> ScsiResponse {
        if cdb[1] & 0x01 != 0 {
            return ScsiResponse::check_condition(SenseData::new(
                sense_key::ILLEGAL_REQUEST,
                asc::INVALID_FIELD_IN_CDB,
                0,
            ));
        }
        let alloc_len = cdb[4] as usize;

        let mut data = vec![0u8; INQUIRY_LEN];
        // Direct access block device
        data[0] = 0x00;
        data[1] = if lun.removable { 0x80 } else { 0x00 };
        // SPC-4
        data[2] = 0x06;
        data[3] = 0x02;
        data[4] = (INQUIRY_LEN - 5) as u8;

        let mut put = |offset: usize, width: usize, text: &str| {
            let field = &mut data[offset..offset + width];
            field.fill(b' ');
            let bytes = text.as_bytes();
            let n = bytes.len().min(width);
            field[..n].copy_from_slice(&bytes[..n]);
        };
        put(8, 8, &lun.vendor);
        put(16, 16, &lun.product);
        put(32, 4, &lun.revision);

        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    /// READ FORMAT CAPACITIES (0x23)
    fn handle_read_format_capacities(cdb: &[u8], lun: &SimulatedLun) -> ScsiResponse {
        let alloc_len = BigEndian::read_u16(&cdb[7..9]) as usize;

        let current = CapacityDescriptor {
            number_of_blocks: lun.blocks.min(u32::MAX as u64) as u32,
            descriptor_code: descriptor_type::FORMATTED,
            block_length: lun.block_size,
        };
        let descriptors: Vec<CapacityDescriptor> = std::iter::once(current)
            .chain(lun.formattable.iter().copied())
            .take(31)
            .collect();

        let mut data = vec![0u8, 0, 0, (descriptors.len() * CAPACITY_DESCRIPTOR_LEN) as u8];
        for descriptor in &descriptors {
            data.extend_from_slice(&descriptor.to_bytes());
        }
        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    /// READ CAPACITY (10) - 0x25
    fn handle_read_capacity_10(lun: &SimulatedLun) -> ScsiResponse {
        let last_lba = lun.blocks.saturating_sub(1);
        let last_lba_32 = if last_lba >= READ_CAPACITY_10_SENTINEL as u64 {
            READ_CAPACITY_10_SENTINEL
        } else {
            last_lba as u32
        };

        let mut data = vec![0u8; 8];
        BigEndian::write_u32(&mut data[0..4], last_lba_32);
        BigEndian::write_u32(&mut data[4..8], lun.block_size);
        ScsiResponse::good(data)
    }

    /// SERVICE ACTION IN (16) - READ CAPACITY (16) only
    fn handle_service_action_in_16(cdb: &[u8], lun: &SimulatedLun) -> ScsiResponse {
        if cdb.len() < 16 || cdb[1] & 0x1F != READ_CAPACITY_16_SERVICE_ACTION {
            return ScsiResponse::check_condition(SenseData::invalid_command());
        }
        let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;

        let mut data = vec![0u8; 32];
        BigEndian::write_u64(&mut data[0..8], lun.blocks.saturating_sub(1));
        BigEndian::write_u32(&mut data[8..12], lun.block_size);
        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    fn check_range(lun: &LunState, lba: u64, blocks: u32) -> Option<ScsiResponse> {
        match lba.checked_add(blocks as u64) {
            Some(end) if end <= lun.config.blocks => None,
            _ => Some(ScsiResponse::check_condition(SenseData::lba_out_of_range(
                lba as u32,
            ))),
        }
    }

    fn handle_read(lun: &mut LunState, lba: u64, blocks: u32) -> ScsiResponse {
        if let Some(err) = Self::check_range(lun, lba, blocks) {
            return err;
        }
        let block_size = lun.config.block_size as usize;
        let mut data = Vec::with_capacity(blocks as usize * block_size);
        for block in lba..lba + blocks as u64 {
            match lun.storage.get(&block) {
                Some(stored) => data.extend_from_slice(stored),
                None => data.resize(data.len() + block_size, 0),
            }
        }
        ScsiResponse::good(data)
    }

    fn handle_write(
        lun: &mut LunState,
        lba: u64,
        blocks: u32,
        data: Option<&[u8]>,
    ) -> ScsiResponse {
        if lun.config.write_protected {
            return ScsiResponse::check_condition(SenseData::write_protected());
        }
        if let Some(err) = Self::check_range(lun, lba, blocks) {
            return err;
        }
        let block_size = lun.config.block_size as usize;
        let data = match data {
            Some(data) if data.len() == blocks as usize * block_size => data,
            _ => {
                return ScsiResponse::check_condition(SenseData::new(
                    sense_key::ILLEGAL_REQUEST,
                    asc::INVALID_FIELD_IN_CDB,
                    0,
                ))
            }
        };
        for (i, chunk) in data.chunks(block_size).enumerate() {
            lun.storage.insert(lba + i as u64, chunk.to_vec());
        }
        ScsiResponse::good_no_data()
    }

    /// REQUEST SENSE (0x03); reports and clears the pending condition
    fn handle_request_sense(cdb: &[u8], pending: Option<SenseData>) -> ScsiResponse {
        let alloc_len = (cdb[4] as usize).min(REQUEST_SENSE_LEN);
        let sense = pending
            .unwrap_or_else(|| SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0));
        let mut data = sense.to_bytes();
        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
