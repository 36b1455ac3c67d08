//! SCSI command execution over Bulk-Only Transport
//!
//! One call to [`CommandExecutor::execute`] runs one command to completion:
//!
//! 1. validate the CBW locally
//! 2. send the 31-byte CBW on bulk-OUT
//! 3. run the data phase, if any
//! 4. read the 13-byte CSW from bulk-IN
//! 5. check signature, tag, status and residue
//! 6. on a bad CSW, issue one REQUEST SENSE and fail with the decoded sense
//!
//! Transport failures in steps 2-4 are returned as-is, without sense.

use crate::bulk::BulkGateway;
use crate::error::{MsdError, MsdResult};
use crate::scsi::{Cdb, SenseData, REQUEST_SENSE_LEN};
use crate::sense::SenseStatus;
use crate::wrapper::{CommandBlockWrapper, CommandStatusWrapper, Direction, CBW_LEN, CSW_LEN};
use std::time::Duration;

/// Data phase of a single command
pub enum DataPhase<'a> {
    None,
    /// Device-to-host; filled with exactly `len()` bytes on success
    In(&'a mut [u8]),
    /// Host-to-device
    Out(&'a [u8]),
}

impl DataPhase<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataPhase::None => 0,
            DataPhase::In(buf) => buf.len(),
            DataPhase::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn direction(&self) -> Option<Direction> {
        match self {
            DataPhase::None => None,
            DataPhase::In(_) => Some(Direction::In),
            DataPhase::Out(_) => Some(Direction::Out),
        }
    }
}

/// Runs SCSI commands against one device's bulk endpoint pair
///
/// Owns the device's scratch buffer and tag counter. Callers serialize access
/// (the driver keeps each device behind a mutex), so at most one CBW is ever
/// outstanding.
pub struct CommandExecutor {
    gateway: BulkGateway,
    bulk_in: u8,
    bulk_out: u8,
    scratch: Vec<u8>,
    buffer_size: usize,
    next_tag: u32,
}

impl CommandExecutor {
    pub fn new(gateway: BulkGateway, bulk_in: u8, bulk_out: u8, buffer_size: usize) -> Self {
        CommandExecutor {
            gateway,
            bulk_in,
            bulk_out,
            scratch: vec![0u8; buffer_size],
            buffer_size,
            next_tag: rand::random(),
        }
    }

    /// Tag the next CBW will carry
    pub fn next_tag(&self) -> u32 {
        self.next_tag
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn gateway(&self) -> &BulkGateway {
        &self.gateway
    }

    /// Execute one command, recovering sense data if the device rejects it
    pub fn execute(
        &mut self,
        lun: u8,
        cdb: &Cdb,
        data: DataPhase<'_>,
        timeout: Duration,
    ) -> MsdResult<()> {
        let expected = data.len();
        let (csw, received) = self.transact(lun, cdb, data, timeout)?;
        let tag = self.next_tag.wrapping_sub(1);

        // A short data phase with a clean CSW is a failure; one the device
        // owns up to already fails on its residue.
        let reason = match csw.check(tag) {
            Ok(()) if received < expected => {
                format!("short data phase: {} of {} bytes", received, expected)
            }
            Ok(()) => return Ok(()),
            Err(MsdError::Protocol(reason)) => reason,
            Err(e) => return Err(e),
        };

        log::warn!("{:?} on LUN {} failed: {}", cdb.opcode, lun, reason);
        let sense = self.request_sense(lun, timeout);
        let status = match &sense {
            Some(sense) => {
                let status = SenseStatus::from(sense);
                log::warn!(
                    "Sense key 0x{:02x} ASC 0x{:02x} ASCQ 0x{:02x}: {}",
                    sense.sense_key,
                    sense.asc,
                    sense.ascq,
                    status
                );
                status
            }
            None => SenseStatus::Unknown,
        };

        Err(MsdError::CommandFailed {
            opcode: cdb.opcode,
            reason,
            sense,
            status,
        })
    }

    /// REQUEST SENSE without further recovery; any failure yields `None`
    fn request_sense(&mut self, lun: u8, timeout: Duration) -> Option<SenseData> {
        let mut reply = [0u8; REQUEST_SENSE_LEN];
        let cdb = Cdb::request_sense(REQUEST_SENSE_LEN as u8);

        let (csw, received) = match self.transact(lun, &cdb, DataPhase::In(&mut reply), timeout) {
            Ok(exchange) => exchange,
            Err(e) => {
                log::warn!("REQUEST SENSE on LUN {} failed: {}", lun, e);
                return None;
            }
        };
        if let Err(e) = csw.check(self.next_tag.wrapping_sub(1)) {
            log::warn!("REQUEST SENSE on LUN {} rejected: {}", lun, e);
            return None;
        }

        match SenseData::from_bytes(&reply[..received]) {
            Ok(sense) => Some(sense),
            Err(e) => {
                log::warn!("Undecodable sense data on LUN {}: {}", lun, e);
                None
            }
        }
    }

    /// CBW, data phase and CSW for one command
    ///
    /// Returns the CSW unchecked, plus the number of data-phase bytes the host
    /// controller reports as moved.
    fn transact(
        &mut self,
        lun: u8,
        cdb: &Cdb,
        mut data: DataPhase<'_>,
        timeout: Duration,
    ) -> MsdResult<(CommandStatusWrapper, usize)> {
        let len = data.len();
        if len > self.buffer_size {
            return Err(MsdError::InvalidArgument(format!(
                "{}-byte data phase exceeds {}-byte transfer buffer",
                len, self.buffer_size
            )));
        }
        if let Some(direction) = data.direction() {
            if direction != cdb.opcode.direction() {
                return Err(MsdError::InvalidCommand(format!(
                    "{:?} cannot carry a {:?} data phase",
                    cdb.opcode, direction
                )));
            }
        }

        let tag = self.next_tag;
        let cbw = CommandBlockWrapper::build(
            tag,
            len as u32,
            cdb.opcode.direction().flags(),
            lun,
            cdb.len,
        )
        .with_command(cdb.bytes);
        cbw.validate()?;
        self.next_tag = self.next_tag.wrapping_add(1);

        let cbw_bytes = cbw.to_bytes();
        log::debug!(
            "CBW tag 0x{:08x} LUN {} len {} cdb {}",
            tag,
            lun,
            len,
            hex::encode(cdb.as_slice())
        );
        log::trace!("CBW {}", hex::encode(&cbw_bytes));

        let mut scratch = self.take_scratch();
        scratch[..CBW_LEN].copy_from_slice(&cbw_bytes);
        let completion = self.gateway.bulk_out(self.bulk_out, scratch, CBW_LEN, timeout)?;
        self.scratch = completion.buffer;

        let received = match &mut data {
            DataPhase::In(buf) if !buf.is_empty() => {
                let scratch = self.take_scratch();
                let completion = self.gateway.bulk_in(self.bulk_in, scratch, len, timeout)?;
                let got = completion.actual_length.min(len);
                buf[..got].copy_from_slice(&completion.buffer[..got]);
                self.scratch = completion.buffer;
                got
            }
            DataPhase::Out(buf) if !buf.is_empty() => {
                let mut scratch = self.take_scratch();
                scratch[..len].copy_from_slice(&buf[..]);
                let completion = self.gateway.bulk_out(self.bulk_out, scratch, len, timeout)?;
                self.scratch = completion.buffer;
                completion.actual_length.min(len)
            }
            _ => 0,
        };

        let scratch = self.take_scratch();
        let completion = self.gateway.bulk_in(self.bulk_in, scratch, CSW_LEN, timeout)?;
        let got = completion.actual_length.min(CSW_LEN);
        let csw = CommandStatusWrapper::from_bytes(&completion.buffer[..got]);
        self.scratch = completion.buffer;
        Ok((csw?, received))
    }

    /// Move the scratch buffer out, re-allocating one lost to a failed transfer
    fn take_scratch(&mut self) -> Vec<u8> {
        let scratch = std::mem::take(&mut self.scratch);
        if scratch.len() == self.buffer_size {
            scratch
        } else {
            vec![0u8; self.buffer_size]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{
        transfer_status, BulkGateway, CompletionCallback, Pipe, TransferCompletion, UsbHost,
        PRIORITY_8,
    };
    use crate::scsi::{ScsiOpcode, INQUIRY_LEN};
    use crate::sim::{Fault, SimulatedLun, SimulatedMassStorage};
    use crate::wrapper::CswStatus;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn executor(sim: &Arc<SimulatedMassStorage>) -> CommandExecutor {
        let gateway = BulkGateway::new(sim.clone(), 0, PRIORITY_8);
        CommandExecutor::new(gateway, sim.bulk_in(), sim.bulk_out(), 4096)
    }

    #[test]
    fn test_inquiry_round_trip() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        let mut exec = executor(&sim);
        let mut reply = [0u8; INQUIRY_LEN];
        exec.execute(0, &Cdb::inquiry(INQUIRY_LEN as u8), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap();
        assert_eq!(&reply[8..16], b"RUSTSIM ");
        assert_eq!(sim.opcode_log(), vec![(0, ScsiOpcode::Inquiry)]);
    }

    #[test]
    fn test_tags_increment() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        let mut exec = executor(&sim);
        let first = exec.next_tag();
        let mut reply = [0u8; 8];
        for _ in 0..3 {
            exec.execute(0, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), TIMEOUT)
                .unwrap();
        }
        let tags: Vec<u32> = sim.cbw_log().iter().map(|cbw| cbw.tag).collect();
        assert_eq!(
            tags,
            vec![first, first.wrapping_add(1), first.wrapping_add(2)]
        );
    }

    #[test]
    fn test_failed_csw_issues_one_request_sense() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::FailCommand(ScsiOpcode::Read10, SenseData::medium_error()), 1);
        let mut exec = executor(&sim);
        let mut block = vec![0u8; 512];
        let err = exec
            .execute(0, &Cdb::read_10(0, 1), DataPhase::In(&mut block), TIMEOUT)
            .unwrap_err();

        assert_eq!(err.sense_status(), Some(SenseStatus::UnrecoveredReadError));
        assert_eq!(
            sim.opcode_log(),
            vec![(0, ScsiOpcode::Read10), (0, ScsiOpcode::RequestSense)]
        );
    }

    #[test]
    fn test_tag_mismatch_is_failure() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::WrongTag(ScsiOpcode::ReadCapacity10), 1);
        let mut exec = executor(&sim);
        let mut reply = [0u8; 8];
        let err = exec
            .execute(0, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, MsdError::CommandFailed { .. }));
        // No pending sense on the device, so the reply decodes as NO SENSE
        assert_eq!(err.sense_status(), Some(SenseStatus::NoSense));
    }

    #[test]
    fn test_request_sense_failure_is_not_retried() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::PhaseError(ScsiOpcode::Inquiry), 1);
        sim.inject(Fault::PhaseError(ScsiOpcode::RequestSense), 1);
        let mut exec = executor(&sim);
        let mut reply = [0u8; INQUIRY_LEN];
        let err = exec
            .execute(0, &Cdb::inquiry(INQUIRY_LEN as u8), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        assert_eq!(err.sense_status(), Some(SenseStatus::Unknown));
        assert_eq!(sim.opcode_log().len(), 2);
    }

    #[test]
    fn test_transport_error_skips_sense() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::TransportError(ScsiOpcode::Inquiry), 1);
        let mut exec = executor(&sim);
        let mut reply = [0u8; INQUIRY_LEN];
        let err = exec
            .execute(0, &Cdb::inquiry(INQUIRY_LEN as u8), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(sim.opcode_log(), vec![(0, ScsiOpcode::Inquiry)]);
    }

    #[test]
    fn test_oversized_transfer_rejected_locally() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        let mut exec = executor(&sim);
        let mut big = vec![0u8; 8192];
        let err = exec
            .execute(0, &Cdb::read_10(0, 16), DataPhase::In(&mut big), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, MsdError::InvalidArgument(_)));
        assert!(sim.cbw_log().is_empty());
    }

    #[test]
    fn test_direction_mismatch_rejected() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        let mut exec = executor(&sim);
        let block = vec![0u8; 512];
        assert!(exec
            .execute(0, &Cdb::read_10(0, 1), DataPhase::Out(&block), TIMEOUT)
            .is_err());
    }

    #[test]
    fn test_bad_lun_never_reaches_wire() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        let mut exec = executor(&sim);
        let tag = exec.next_tag();
        let mut reply = [0u8; 8];
        let err = exec
            .execute(16, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, MsdError::InvalidCommand(_)));
        assert_eq!(exec.next_tag(), tag);
        assert!(sim.cbw_log().is_empty());
    }

    #[test]
    fn test_lost_completion_times_out_and_recovers() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::NoCompletion(ScsiOpcode::ReadCapacity10), 1);
        let mut exec = executor(&sim);
        let mut reply = [0u8; 8];
        let short = Duration::from_millis(20);
        let err = exec
            .execute(0, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), short)
            .unwrap_err();
        assert!(matches!(err, MsdError::Timeout(_)));

        // The scratch buffer went down with the lost transfer
        exec.execute(0, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap();
        assert_eq!(&reply[4..8], &[0, 0, 2, 0]);
    }

    #[test]
    fn test_residue_alone_fails_command() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::Residue(ScsiOpcode::ReadCapacity10, 4), 1);
        let mut exec = executor(&sim);
        let mut reply = [0u8; 8];
        let err = exec
            .execute(0, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, MsdError::CommandFailed { .. }));
        assert_eq!(
            sim.opcode_log(),
            vec![(0, ScsiOpcode::ReadCapacity10), (0, ScsiOpcode::RequestSense)]
        );
    }

    #[test]
    fn test_bad_csw_signature_fails_command() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        sim.inject(Fault::BadSignature(ScsiOpcode::ReadCapacity10), 1);
        let mut exec = executor(&sim);
        let mut reply = [0u8; 8];
        let err = exec
            .execute(0, &Cdb::read_capacity_10(), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, MsdError::CommandFailed { .. }));
        assert_eq!(
            sim.opcode_log(),
            vec![(0, ScsiOpcode::ReadCapacity10), (0, ScsiOpcode::RequestSense)]
        );
    }

    #[test]
    fn test_zero_length_skips_data_phase() {
        let sim = Arc::new(SimulatedMassStorage::new(vec![SimulatedLun::new(512, 1000)]));
        let mut exec = executor(&sim);

        // The simulated device stalls any data-phase transfer here
        exec.execute(0, &Cdb::read_10(0, 0), DataPhase::None, TIMEOUT)
            .unwrap();
        exec.execute(0, &Cdb::read_10(0, 0), DataPhase::In(&mut []), TIMEOUT)
            .unwrap();

        assert!(sim.cbw_log().iter().all(|cbw| cbw.transfer_length == 0));
        assert_eq!(
            sim.opcode_log(),
            vec![(0, ScsiOpcode::Read10), (0, ScsiOpcode::Read10)]
        );
    }

    /// Host whose IN transfers return scripted bytes and lengths
    struct ScriptedHost {
        replies: Mutex<VecDeque<(Vec<u8>, usize)>>,
        commands: Mutex<Vec<ScsiOpcode>>,
    }

    impl ScriptedHost {
        fn new(replies: Vec<(Vec<u8>, usize)>) -> Self {
            ScriptedHost {
                replies: Mutex::new(replies.into()),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl UsbHost for ScriptedHost {
        fn submit_bulk_transfer(
            &self,
            _interface: u8,
            pipe: Pipe,
            _priority: u8,
            mut buffer: Vec<u8>,
            len: usize,
            callback: CompletionCallback,
        ) -> MsdResult<()> {
            let actual_length = match pipe.direction {
                Direction::Out => {
                    if len == CBW_LEN {
                        let cbw = CommandBlockWrapper::from_bytes(&buffer[..len]).unwrap();
                        self.commands.lock().unwrap().push(cbw.opcode().unwrap());
                    }
                    len
                }
                Direction::In => {
                    let (bytes, actual) = self.replies.lock().unwrap().pop_front().unwrap();
                    buffer[..bytes.len()].copy_from_slice(&bytes);
                    actual
                }
            };
            callback(TransferCompletion {
                status: transfer_status::S_TRANSFER,
                buffer,
                actual_length,
            });
            Ok(())
        }

        fn get_max_lun(&self, _interface: u8, callback: CompletionCallback) -> MsdResult<()> {
            callback(TransferCompletion {
                status: transfer_status::S_TRANSFER,
                buffer: vec![0],
                actual_length: 1,
            });
            Ok(())
        }
    }

    fn scripted(host: &Arc<ScriptedHost>) -> CommandExecutor {
        CommandExecutor::new(BulkGateway::new(host.clone(), 0, PRIORITY_8), 0x81, 0x02, 4096)
    }

    #[test]
    fn test_short_csw_is_protocol_error() {
        let host = Arc::new(ScriptedHost::new(Vec::new()));
        let mut exec = scripted(&host);
        let csw = CommandStatusWrapper::new(exec.next_tag(), 0, CswStatus::Passed);
        host.replies.lock().unwrap().push_back((csw.to_bytes(), 0));

        let err = exec
            .execute(0, &Cdb::read_10(0, 0), DataPhase::None, TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, MsdError::Protocol(_)), "got {:?}", err);
        assert_eq!(*host.commands.lock().unwrap(), vec![ScsiOpcode::Read10]);
    }

    #[test]
    fn test_short_data_phase_fetches_sense() {
        let host = Arc::new(ScriptedHost::new(Vec::new()));
        let mut exec = scripted(&host);
        let tag = exec.next_tag();
        {
            let mut replies = host.replies.lock().unwrap();
            replies.push_back((vec![0x5A; INQUIRY_LEN], 20));
            let csw = CommandStatusWrapper::new(tag, 0, CswStatus::Passed);
            replies.push_back((csw.to_bytes(), CSW_LEN));
            let sense = SenseData::medium_not_present().to_bytes();
            replies.push_back((sense, REQUEST_SENSE_LEN));
            let csw = CommandStatusWrapper::new(tag.wrapping_add(1), 0, CswStatus::Passed);
            replies.push_back((csw.to_bytes(), CSW_LEN));
        }

        let mut reply = [0u8; INQUIRY_LEN];
        let err = exec
            .execute(0, &Cdb::inquiry(INQUIRY_LEN as u8), DataPhase::In(&mut reply), TIMEOUT)
            .unwrap_err();
        match &err {
            MsdError::CommandFailed { reason, .. } => {
                assert!(reason.contains("20 of 36"), "reason was {}", reason)
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
        assert_eq!(err.sense_status(), Some(SenseStatus::MediumNotPresent));
        assert_eq!(
            *host.commands.lock().unwrap(),
            vec![ScsiOpcode::Inquiry, ScsiOpcode::RequestSense]
        );
        assert!(host.replies.lock().unwrap().is_empty());
    }
}
