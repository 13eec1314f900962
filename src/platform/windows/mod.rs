//! Backend for the vendor driver's IOCTL protocol.
//!
//! Requests are issued with overlapped `DeviceIoControl` on a handle opened
//! with `FILE_FLAG_OVERLAPPED`. Completions are delivered through a shared
//! I/O completion port serviced by one background thread, which completes
//! the request's [`CompletionSignal`].

use std::{
    ffi::{c_void, OsStr},
    fmt::Debug,
    mem,
    os::windows::{io::AsRawHandle, prelude::OwnedHandle},
    sync::Arc,
};

use log::{debug, error};
use windows_sys::Win32::{
    Foundation::{GetLastError, ERROR_IO_PENDING, TRUE, WIN32_ERROR},
    System::IO::{DeviceIoControl, OVERLAPPED},
};

use crate::Error;

use super::{CompletionSignal, DeviceIo, IoRequest, IoctlCode, RawHandle};

mod events;
mod util;

use util::{create_file, error_kind, raw_handle};

/// A request in flight. `overlapped` must stay the first field: the
/// completion port hands back a pointer to it.
#[repr(C)]
struct PendingRequest {
    overlapped: OVERLAPPED,
    signal: Arc<CompletionSignal>,
}

impl PendingRequest {
    /// Complete and free a request whose completion was dequeued from the port.
    ///
    /// # Safety
    /// `overlapped` must come from a `PendingRequest` leaked by
    /// [`DriverHandle::start`] and not yet completed.
    unsafe fn complete_from_port(overlapped: *mut OVERLAPPED, bytes: u32) {
        let request = unsafe { Box::from_raw(overlapped as *mut PendingRequest) };
        // `Internal` holds the NTSTATUS of the request.
        let success = request.overlapped.Internal == 0;
        request.signal.complete(bytes, success);
    }
}

/// An opened device handle of the vendor driver.
pub struct DriverHandle {
    handle: OwnedHandle,
}

impl DriverHandle {
    /// Open the device interface at `path` for overlapped I/O.
    pub fn open(path: &OsStr) -> Result<DriverHandle, Error> {
        let handle = create_file(path).map_err(|e| {
            debug!("failed to open {path:?}: error {e}");
            Error::new_os(error_kind(e), "failed to open device", e)
        })?;
        events::register(&handle)?;
        Ok(DriverHandle { handle })
    }

    /// Submit the request. On `Err`, the request never reached the driver and
    /// `signal` has already been completed.
    ///
    /// # Safety
    /// See [`DeviceIo::submit`].
    unsafe fn start(
        &self,
        request: IoRequest,
        signal: &Arc<CompletionSignal>,
    ) -> Result<u32, WIN32_ERROR> {
        let pending = Box::into_raw(Box::new(PendingRequest {
            overlapped: unsafe { mem::zeroed() },
            signal: signal.clone(),
        }));

        let mut immediate = 0;
        let r = unsafe {
            DeviceIoControl(
                raw_handle(&self.handle),
                request.code.code(),
                request.input as *const c_void,
                request.input_len as u32,
                request.output as *mut c_void,
                request.output_len as u32,
                &mut immediate,
                pending as *mut OVERLAPPED,
            )
        };

        // A successful synchronous completion still queues a packet on the
        // port, so only failures are completed here.
        if r == TRUE {
            return Ok(immediate);
        }

        let err = unsafe { GetLastError() };
        if err == ERROR_IO_PENDING {
            return Ok(0);
        }

        error!(
            "{:?} submit failed: {}",
            request.code,
            std::io::Error::from_raw_os_error(err as i32)
        );

        // SAFETY: the request was not accepted, so no completion packet will
        // be queued and the allocation is still ours.
        let pending = unsafe { Box::from_raw(pending) };
        pending.signal.complete(0, false);
        Err(err)
    }
}

impl Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("handle", &self.handle.as_raw_handle())
            .finish()
    }
}

impl DeviceIo for DriverHandle {
    fn raw_handle(&self) -> RawHandle {
        self.handle.as_raw_handle() as RawHandle
    }

    unsafe fn submit(&self, request: IoRequest, signal: &Arc<CompletionSignal>) -> u32 {
        unsafe { self.start(request, signal) }.unwrap_or(0)
    }

    fn ioctl(&self, code: IoctlCode, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        let signal = Arc::new(CompletionSignal::new());
        let request = IoRequest {
            code,
            input: input.as_ptr(),
            input_len: input.len(),
            output: output.as_mut_ptr(),
            output_len: output.len(),
        };

        // SAFETY: both buffers outlive the unbounded wait below.
        if let Err(e) = unsafe { self.start(request, &signal) } {
            return Err(Error::new_os(error_kind(e), "device request failed", e));
        }

        // An unbounded wait only returns once signaled.
        self.wait(&signal, None);

        let result = self.get_result(&signal);
        if result.success {
            Ok(result.bytes_transferred as usize)
        } else {
            Err(Error::new(crate::ErrorKind::Other, "device request failed").log_debug())
        }
    }
}
