//! Error types for mass-storage driver operations

use crate::bulk::Pipe;
use crate::scsi::{ScsiOpcode, SenseData};
use crate::sense::SenseStatus;
use std::time::Duration;
use thiserror::Error;

/// Mass-storage driver errors
#[derive(Debug, Error)]
pub enum MsdError {
    /// The host controller reported a failed bulk or control transfer
    #[error("Transfer error on {pipe}: status 0x{status:08x}")]
    Transfer { pipe: Pipe, status: u32 },

    /// A transfer was submitted but never completed
    #[error("Transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device rejected a command; carries the decoded REQUEST SENSE reply
    #[error("{opcode:?} failed: {reason} (sense: {status})")]
    CommandFailed {
        opcode: ScsiOpcode,
        reason: String,
        sense: Option<SenseData>,
        status: SenseStatus,
    },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid volume {volume}: device has {volumes} volume(s)")]
    InvalidVolume { volume: u8, volumes: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device error: {0}")]
    Device(String),
}

impl MsdError {
    /// Decoded sense status, if this error came from a failed command
    pub fn sense_status(&self) -> Option<SenseStatus> {
        match self {
            MsdError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for failures of the USB transport itself (no sense data available)
    pub fn is_transport(&self) -> bool {
        matches!(self, MsdError::Transfer { .. } | MsdError::Timeout(_))
    }
}

/// Result type for mass-storage operations
pub type MsdResult<T> = Result<T, MsdError>;
