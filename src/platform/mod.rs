//! Boundary between the transfer engine and the OS.
//!
//! The engine only needs a handle to an opened device and an overlapped
//! request primitive: submit a request with a completion signal, wait on the
//! signal, read back the result. [`DeviceIo`] captures that surface so the
//! engine can run against the Windows driver backend or a test double.

use std::{fmt::Debug, sync::Arc, time::Duration};

use crate::Error;

mod signal;
pub use signal::{CompletionSignal, IoStatus, SignalFuture, WaitStatus};

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "windows")]
pub use windows::DriverHandle;

#[cfg(test)]
pub(crate) mod mock;

/// Opaque OS handle to an opened device.
pub type RawHandle = isize;

/// Handle value meaning "no device": never opened, or already closed.
pub const INVALID_HANDLE: RawHandle = -1;

/// Request codes understood by the device driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IoctlCode {
    /// Control transfer on endpoint zero. The setup packet and data share one buffer.
    ControlTransfer = 0x0022_0020,

    /// Non-control transfer with the data following the request header.
    BufferedTransfer = 0x0022_0024,

    /// Clear a halt condition on a pipe.
    ResetPipe = 0x0022_002C,

    /// Read the driver's per-pipe transfer size.
    GetTransferSize = 0x0022_0034,

    /// Set the driver's per-pipe transfer size.
    SetTransferSize = 0x0022_0038,

    /// Cancel all requests pending on a pipe.
    AbortPipe = 0x0022_0044,

    /// Non-control transfer with the data in a separate, caller-owned buffer.
    DirectTransfer = 0x0022_004A,
}

impl IoctlCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// One overlapped request.
///
/// In buffered modes `input` and `output` point at the same memory.
#[derive(Debug, Copy, Clone)]
pub struct IoRequest {
    pub code: IoctlCode,
    pub input: *const u8,
    pub input_len: usize,
    pub output: *mut u8,
    pub output_len: usize,
}

/// The asynchronous I/O primitive the transfer engine drives.
///
/// There is at most one request in flight per endpoint. The engine keeps the
/// request's buffers alive and untouched until its signal completes, and
/// always waits for completion before releasing them, including after a
/// timeout.
pub trait DeviceIo: Send + Sync + Debug {
    /// The OS handle of the opened device, or [`INVALID_HANDLE`].
    fn raw_handle(&self) -> RawHandle;

    /// `false` if the handle is the invalid sentinel. No I/O is attempted on
    /// an invalid handle.
    fn is_valid(&self) -> bool {
        self.raw_handle() != INVALID_HANDLE
    }

    /// Submit an overlapped request and return the byte count reported if the
    /// request finished immediately.
    ///
    /// The backend must call [`CompletionSignal::complete`] on `signal` exactly
    /// once, including when submission fails.
    ///
    /// # Safety
    /// `request.input` and `request.output` must be valid for reads and writes
    /// of their lengths until `signal` completes.
    unsafe fn submit(&self, request: IoRequest, signal: &Arc<CompletionSignal>) -> u32;

    /// Wait for `signal` for at most `timeout`, or without bound if `None`.
    fn wait(&self, signal: &CompletionSignal, timeout: Option<Duration>) -> WaitStatus {
        signal.wait(timeout)
    }

    /// Read the outcome of a completed request.
    fn get_result(&self, signal: &CompletionSignal) -> IoStatus {
        signal.result().unwrap_or(IoStatus::FAILED)
    }

    /// Issue a request and block until it completes.
    ///
    /// Returns the number of bytes written to `output`.
    fn ioctl(&self, code: IoctlCode, input: &[u8], output: &mut [u8]) -> Result<usize, Error>;
}

/// A [`DeviceIo`] for a device that is not open.
///
/// Endpoints built against it report
/// [`TransferStatus::InvalidHandle`][crate::transfer::TransferStatus::InvalidHandle]
/// for every operation.
#[derive(Debug, Default, Copy, Clone)]
pub struct Disconnected;

impl DeviceIo for Disconnected {
    fn raw_handle(&self) -> RawHandle {
        INVALID_HANDLE
    }

    unsafe fn submit(&self, _request: IoRequest, signal: &Arc<CompletionSignal>) -> u32 {
        signal.complete(0, false);
        0
    }

    fn ioctl(&self, _code: IoctlCode, _input: &[u8], _output: &mut [u8]) -> Result<usize, Error> {
        Err(Error::new(crate::ErrorKind::InvalidHandle, "device is not open"))
    }
}
