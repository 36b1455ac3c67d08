//! Bulk transfer gateway
//!
//! The host controller driver is an external collaborator reached through the
//! [`UsbHost`] trait. It accepts transfers asynchronously and reports each one
//! through a completion callback. [`BulkGateway`] turns that into a blocking
//! call: every submitted transfer gets its own completion channel, and the
//! calling thread waits on it with a timeout.

use crate::error::{MsdError, MsdResult};
use crate::wrapper::Direction;
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Completion status flags reported by the host controller
pub mod transfer_status {
    /// Transfer completed
    pub const S_TRANSFER: u32 = 0x0000_0001;
    /// Transfer failed (see the detail bits)
    pub const E_TRANSFER: u32 = 0x0000_0002;
    pub const E_STALLED: u32 = 0x0000_0100;
    pub const E_NAK_TIMEOUT: u32 = 0x0000_0200;
    pub const E_BABBLE: u32 = 0x0000_0400;
    pub const E_DISCONNECTED: u32 = 0x0000_0800;

    /// A completion counts as successful only with S_TRANSFER and no error flag
    pub fn is_success(status: u32) -> bool {
        status & E_TRANSFER == 0 && status & S_TRANSFER != 0
    }
}

/// Transfer priority passed through to the host controller
pub const PRIORITY_8: u8 = 8;

/// Endpoint address bits
pub const ENDPOINT_MASK: u8 = 0x0F;
pub const DIRECTION_MASK: u8 = 0x80;

const PIPE_BULK: u32 = 3;

/// A bulk pipe: endpoint number plus direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipe {
    pub endpoint: u8,
    pub direction: Direction,
}

impl Pipe {
    /// Packed pipe word: type in bits 31:30, endpoint in 18:15, IN in bit 7
    pub fn raw(&self) -> u32 {
        let dir = match self.direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        (PIPE_BULK << 30) | (((self.endpoint & ENDPOINT_MASK) as u32) << 15) | dir
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::In => "in",
            Direction::Out => "out",
        };
        write!(f, "bulk-{} ep{}", dir, self.endpoint)
    }
}

/// Bulk-OUT pipe for a raw endpoint address
pub fn usb_sndbulkpipe(endpoint: u8) -> Pipe {
    Pipe {
        endpoint: endpoint & ENDPOINT_MASK,
        direction: Direction::Out,
    }
}

/// Bulk-IN pipe for a raw endpoint address
pub fn usb_rcvbulkpipe(endpoint: u8) -> Pipe {
    Pipe {
        endpoint: endpoint & ENDPOINT_MASK,
        direction: Direction::In,
    }
}

/// What the host controller hands back when a transfer finishes
#[derive(Debug)]
pub struct TransferCompletion {
    /// [`transfer_status`] flags
    pub status: u32,
    /// The buffer given to the transfer; IN transfers filled its prefix
    pub buffer: Vec<u8>,
    /// Bytes actually moved
    pub actual_length: usize,
}

/// Completion callback invoked exactly once per accepted transfer
pub type CompletionCallback = Box<dyn FnOnce(TransferCompletion) + Send + 'static>;

/// Host controller interface consumed by the driver
///
/// Implementations may invoke the callback from any thread, including from
/// inside `submit_bulk_transfer` itself.
pub trait UsbHost: Send + Sync {
    /// Queue one bulk transfer of `len` bytes
    ///
    /// For OUT pipes the first `len` bytes of `buffer` are sent. For IN pipes
    /// up to `len` bytes are written to the front of `buffer`.
    fn submit_bulk_transfer(
        &self,
        interface: u8,
        pipe: Pipe,
        priority: u8,
        buffer: Vec<u8>,
        len: usize,
        callback: CompletionCallback,
    ) -> MsdResult<()>;

    /// Issue the class-specific GET MAX LUN control request (one data byte)
    fn get_max_lun(&self, interface: u8, callback: CompletionCallback) -> MsdResult<()>;
}

/// Blocking wrapper around [`UsbHost`] bound to one interface
#[derive(Clone)]
pub struct BulkGateway {
    host: Arc<dyn UsbHost>,
    interface: u8,
    priority: u8,
}

impl BulkGateway {
    pub fn new(host: Arc<dyn UsbHost>, interface: u8, priority: u8) -> Self {
        BulkGateway {
            host,
            interface,
            priority,
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Submit one bulk transfer and wait for its completion
    pub fn transfer(
        &self,
        pipe: Pipe,
        buffer: Vec<u8>,
        len: usize,
        timeout: Duration,
    ) -> MsdResult<TransferCompletion> {
        if len > buffer.len() {
            return Err(MsdError::InvalidArgument(format!(
                "transfer of {} bytes exceeds {}-byte buffer",
                len,
                buffer.len()
            )));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.host.submit_bulk_transfer(
            self.interface,
            pipe,
            self.priority,
            buffer,
            len,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        )?;

        let completion = wait(&rx, timeout)?;
        if !transfer_status::is_success(completion.status) {
            log::debug!("{} failed with status 0x{:08x}", pipe, completion.status);
            return Err(MsdError::Transfer {
                pipe,
                status: completion.status,
            });
        }
        Ok(completion)
    }

    /// Send `len` bytes from `buffer` on a bulk-OUT endpoint
    pub fn bulk_out(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        len: usize,
        timeout: Duration,
    ) -> MsdResult<TransferCompletion> {
        self.transfer(usb_sndbulkpipe(endpoint), buffer, len, timeout)
    }

    /// Receive up to `len` bytes into `buffer` from a bulk-IN endpoint
    pub fn bulk_in(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        len: usize,
        timeout: Duration,
    ) -> MsdResult<TransferCompletion> {
        self.transfer(usb_rcvbulkpipe(endpoint), buffer, len, timeout)
    }

    /// GET MAX LUN with a bounded wait
    pub fn get_max_lun(&self, timeout: Duration) -> MsdResult<u8> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.host.get_max_lun(
            self.interface,
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
        )?;

        let completion = wait(&rx, timeout)?;
        if !transfer_status::is_success(completion.status) {
            return Err(MsdError::Transfer {
                pipe: Pipe {
                    endpoint: 0,
                    direction: Direction::In,
                },
                status: completion.status,
            });
        }
        if completion.actual_length < 1 || completion.buffer.is_empty() {
            return Err(MsdError::Protocol("empty GET MAX LUN reply".to_string()));
        }
        Ok(completion.buffer[0])
    }
}

fn wait(
    rx: &mpsc::Receiver<TransferCompletion>,
    timeout: Duration,
) -> MsdResult<TransferCompletion> {
    match rx.recv_timeout(timeout) {
        Ok(completion) => Ok(completion),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(MsdError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(MsdError::Device(
            "host controller dropped the completion callback".to_string(),
        )),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
