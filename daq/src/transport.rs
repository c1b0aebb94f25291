//! Synchronous command transport.
//!
//! One implementation per transport family (USB control channel here,
//! TCP framing in [`crate::net`]); per-model command opcodes are data passed
//! in by the caller. This layer never retries — retry policy belongs to
//! callers that know whether a command is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError},
};

use crate::error::DaqError;

/// Request/response exchange with one device.
///
/// `send` and `query` block the calling thread for up to `timeout`.
pub trait CommandTransport: Send + Sync {
    /// Issue a command carrying `payload` to the device.
    fn send(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DaqError>;

    /// Issue a command and read back up to `out.len()` reply bytes.
    /// Returns the number of bytes actually received.
    fn query(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, DaqError>;

    /// Largest payload one command round trip can carry.
    fn max_command_len(&self) -> usize;

    /// Whether the device link is still believed alive.
    fn is_connected(&self) -> bool;

    /// `query` for fixed-length replies: the reply must fill `out` exactly.
    /// Callers with variable-length replies use [`CommandTransport::query`]
    /// directly.
    fn query_exact(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<(), DaqError> {
        let received = self.query(opcode, value, index, out, timeout)?;
        if received != out.len() {
            return Err(DaqError::ShortReply {
                expected: out.len(),
                received,
            });
        }
        Ok(())
    }
}

/// Vendor control transfers over a claimed USB interface.
pub struct UsbTransport {
    interface: nusb::Interface,
    max_command_len: usize,
    connected: AtomicBool,
}

impl UsbTransport {
    pub fn new(interface: nusb::Interface, max_command_len: usize) -> Self {
        UsbTransport {
            interface,
            max_command_len,
            connected: AtomicBool::new(true),
        }
    }

    pub(crate) fn interface(&self) -> &nusb::Interface {
        &self.interface
    }

    fn map_error(&self, err: TransferError) -> DaqError {
        match err {
            // nusb reports an expired control-transfer deadline as a
            // cancelled transfer
            TransferError::Cancelled => DaqError::Timeout,
            TransferError::Disconnected => {
                self.connected.store(false, Ordering::Release);
                DaqError::NotConnected
            }
            other => DaqError::Transfer(other),
        }
    }
}

impl CommandTransport for UsbTransport {
    fn send(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DaqError> {
        if !self.is_connected() {
            return Err(DaqError::NotConnected);
        }
        log::trace!("control out: opcode {opcode:#04x}, {} bytes", payload.len());
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: opcode,
                    value,
                    index,
                    data: payload,
                },
                timeout,
            )
            .wait()
            .map_err(|e| self.map_error(e))
    }

    fn query(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, DaqError> {
        if !self.is_connected() {
            return Err(DaqError::NotConnected);
        }
        let reply = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: opcode,
                    value,
                    index,
                    length: out.len() as u16,
                },
                timeout,
            )
            .wait()
            .map_err(|e| self.map_error(e))?;
        let received = reply.len().min(out.len());
        out[..received].copy_from_slice(&reply[..received]);
        Ok(received)
    }

    fn max_command_len(&self) -> usize {
        self.max_command_len
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
