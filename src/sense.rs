//! REQUEST SENSE classification
//!
//! Maps a `(sense key, ASC, ASCQ)` triple to a fixed set of statuses with
//! human-readable descriptions. Lookup is a single exhaustive match; anything
//! not listed resolves to [`SenseStatus::Unknown`].

use crate::scsi::SenseData;
use std::fmt;

/// Decoded sense condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenseStatus {
    NoSense,
    RecoveredDataWithRetries,
    RecoveredDataWithEcc,
    NotReadyCauseNotReportable,
    BecomingReady,
    InitCommandRequired,
    FormatInProgress,
    MediumNotPresent,
    CommunicationFailure,
    NoSeekComplete,
    WriteFault,
    UnrecoveredReadError,
    RecordNotFound,
    IncompatibleMedium,
    MediumFormatCorrupted,
    InternalTargetFailure,
    ParameterListLengthError,
    InvalidCommandOpCode,
    LbaOutOfRange,
    InvalidFieldInCdb,
    LogicalUnitNotSupported,
    InvalidFieldInParameterList,
    MediumRemovalPrevented,
    MediumChanged,
    PowerOnReset,
    ModeParametersChanged,
    WriteProtMedia,
    CommandAborted,
    OverlappedCommandAttempted,
    Miscompare,
    /// Triple not in the table
    Unknown,
}

/// Every known status with its triple, in sense key order
pub const SENSE_TABLE: [(SenseStatus, (u8, u8, u8)); 30] = [
    (SenseStatus::NoSense, (0x00, 0x00, 0x00)),
    (SenseStatus::RecoveredDataWithRetries, (0x01, 0x17, 0x01)),
    (SenseStatus::RecoveredDataWithEcc, (0x01, 0x18, 0x00)),
    (SenseStatus::NotReadyCauseNotReportable, (0x02, 0x04, 0x00)),
    (SenseStatus::BecomingReady, (0x02, 0x04, 0x01)),
    (SenseStatus::InitCommandRequired, (0x02, 0x04, 0x02)),
    (SenseStatus::FormatInProgress, (0x02, 0x04, 0x04)),
    (SenseStatus::MediumNotPresent, (0x02, 0x3A, 0x00)),
    (SenseStatus::NoSeekComplete, (0x03, 0x02, 0x00)),
    (SenseStatus::WriteFault, (0x03, 0x03, 0x00)),
    (SenseStatus::UnrecoveredReadError, (0x03, 0x11, 0x00)),
    (SenseStatus::RecordNotFound, (0x03, 0x14, 0x01)),
    (SenseStatus::IncompatibleMedium, (0x03, 0x30, 0x00)),
    (SenseStatus::MediumFormatCorrupted, (0x03, 0x31, 0x00)),
    (SenseStatus::CommunicationFailure, (0x04, 0x08, 0x00)),
    (SenseStatus::InternalTargetFailure, (0x04, 0x44, 0x00)),
    (SenseStatus::ParameterListLengthError, (0x05, 0x1A, 0x00)),
    (SenseStatus::InvalidCommandOpCode, (0x05, 0x20, 0x00)),
    (SenseStatus::LbaOutOfRange, (0x05, 0x21, 0x00)),
    (SenseStatus::InvalidFieldInCdb, (0x05, 0x24, 0x00)),
    (SenseStatus::LogicalUnitNotSupported, (0x05, 0x25, 0x00)),
    (SenseStatus::InvalidFieldInParameterList, (0x05, 0x26, 0x00)),
    (SenseStatus::MediumRemovalPrevented, (0x05, 0x53, 0x02)),
    (SenseStatus::MediumChanged, (0x06, 0x28, 0x00)),
    (SenseStatus::PowerOnReset, (0x06, 0x29, 0x00)),
    (SenseStatus::ModeParametersChanged, (0x06, 0x2A, 0x01)),
    (SenseStatus::WriteProtMedia, (0x07, 0x27, 0x00)),
    (SenseStatus::CommandAborted, (0x0B, 0x00, 0x00)),
    (SenseStatus::OverlappedCommandAttempted, (0x0B, 0x4E, 0x00)),
    (SenseStatus::Miscompare, (0x0E, 0x1D, 0x00)),
];

impl SenseStatus {
    pub fn from_triple(sense_key: u8, asc: u8, ascq: u8) -> Self {
        match (sense_key & 0x0F, asc, ascq) {
            (0x00, 0x00, 0x00) => SenseStatus::NoSense,
            (0x01, 0x17, 0x01) => SenseStatus::RecoveredDataWithRetries,
            (0x01, 0x18, 0x00) => SenseStatus::RecoveredDataWithEcc,
            (0x02, 0x04, 0x00) => SenseStatus::NotReadyCauseNotReportable,
            (0x02, 0x04, 0x01) => SenseStatus::BecomingReady,
            (0x02, 0x04, 0x02) => SenseStatus::InitCommandRequired,
            (0x02, 0x04, 0x04) => SenseStatus::FormatInProgress,
            (0x02, 0x3A, 0x00) => SenseStatus::MediumNotPresent,
            (0x03, 0x02, 0x00) => SenseStatus::NoSeekComplete,
            (0x03, 0x03, 0x00) => SenseStatus::WriteFault,
            (0x03, 0x11, 0x00) => SenseStatus::UnrecoveredReadError,
            (0x03, 0x14, 0x01) => SenseStatus::RecordNotFound,
            (0x03, 0x30, 0x00) => SenseStatus::IncompatibleMedium,
            (0x03, 0x31, 0x00) => SenseStatus::MediumFormatCorrupted,
            (0x04, 0x08, 0x00) => SenseStatus::CommunicationFailure,
            (0x04, 0x44, 0x00) => SenseStatus::InternalTargetFailure,
            (0x05, 0x1A, 0x00) => SenseStatus::ParameterListLengthError,
            (0x05, 0x20, 0x00) => SenseStatus::InvalidCommandOpCode,
            (0x05, 0x21, 0x00) => SenseStatus::LbaOutOfRange,
            (0x05, 0x24, 0x00) => SenseStatus::InvalidFieldInCdb,
            (0x05, 0x25, 0x00) => SenseStatus::LogicalUnitNotSupported,
            (0x05, 0x26, 0x00) => SenseStatus::InvalidFieldInParameterList,
            (0x05, 0x53, 0x02) => SenseStatus::MediumRemovalPrevented,
            (0x06, 0x28, 0x00) => SenseStatus::MediumChanged,
            (0x06, 0x29, 0x00) => SenseStatus::PowerOnReset,
            (0x06, 0x2A, 0x01) => SenseStatus::ModeParametersChanged,
            (0x07, 0x27, 0x00) => SenseStatus::WriteProtMedia,
            (0x0B, 0x00, 0x00) => SenseStatus::CommandAborted,
            (0x0B, 0x4E, 0x00) => SenseStatus::OverlappedCommandAttempted,
            (0x0E, 0x1D, 0x00) => SenseStatus::Miscompare,
            _ => SenseStatus::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SenseStatus::NoSense => "no sense",
            SenseStatus::RecoveredDataWithRetries => "recovered data with retries",
            SenseStatus::RecoveredDataWithEcc => "recovered data with error correction",
            SenseStatus::NotReadyCauseNotReportable => {
                "logical unit not ready, cause not reportable"
            }
            SenseStatus::BecomingReady => "logical unit is in process of becoming ready",
            SenseStatus::InitCommandRequired => {
                "logical unit not ready, initializing command required"
            }
            SenseStatus::FormatInProgress => "logical unit not ready, format in progress",
            SenseStatus::MediumNotPresent => "medium not present",
            SenseStatus::NoSeekComplete => "no seek complete",
            SenseStatus::WriteFault => "write fault",
            SenseStatus::UnrecoveredReadError => "unrecovered read error",
            SenseStatus::RecordNotFound => "record not found",
            SenseStatus::IncompatibleMedium => "incompatible medium installed",
            SenseStatus::MediumFormatCorrupted => "medium format corrupted",
            SenseStatus::CommunicationFailure => "logical unit communication failure",
            SenseStatus::InternalTargetFailure => "internal target failure",
            SenseStatus::ParameterListLengthError => "parameter list length error",
            SenseStatus::InvalidCommandOpCode => "invalid command operation code",
            SenseStatus::LbaOutOfRange => "logical block address out of range",
            SenseStatus::InvalidFieldInCdb => "invalid field in CDB",
            SenseStatus::LogicalUnitNotSupported => "logical unit not supported",
            SenseStatus::InvalidFieldInParameterList => "invalid field in parameter list",
            SenseStatus::MediumRemovalPrevented => "medium removal prevented",
            SenseStatus::MediumChanged => "not ready to ready change, medium may have changed",
            SenseStatus::PowerOnReset => "power on, reset, or bus device reset occurred",
            SenseStatus::ModeParametersChanged => "mode parameters changed",
            SenseStatus::WriteProtMedia => "write protected media",
            SenseStatus::CommandAborted => "command aborted",
            SenseStatus::OverlappedCommandAttempted => "overlapped commands attempted",
            SenseStatus::Miscompare => "miscompare during verify operation",
            SenseStatus::Unknown => "unknown sense code",
        }
    }

    /// Condition that a later retry may clear (unit attention, becoming ready)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SenseStatus::BecomingReady
                | SenseStatus::MediumChanged
                | SenseStatus::PowerOnReset
                | SenseStatus::ModeParametersChanged
        )
    }
}

impl From<&SenseData> for SenseStatus {
    fn from(sense: &SenseData) -> Self {
        SenseStatus::from_triple(sense.sense_key, sense.asc, sense.ascq)
    }
}

impl fmt::Display for SenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
