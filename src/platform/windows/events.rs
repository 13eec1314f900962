//! Shared I/O completion port and the thread that drains it.

use once_cell::sync::OnceCell;
use std::{
    mem,
    os::windows::{
        io::HandleOrNull,
        prelude::{OwnedHandle, RawHandle},
    },
    ptr, thread,
};
use windows_sys::Win32::{
    Foundation::{GetLastError, FALSE, INVALID_HANDLE_VALUE},
    System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED_ENTRY},
};

use log::{error, trace};

use crate::{Error, ErrorKind};

use super::{util::raw_handle, PendingRequest};

/// Completions dequeued per wakeup.
const BATCH: usize = 16;

struct CompletionPort(OwnedHandle);

impl CompletionPort {
    fn create() -> Result<CompletionPort, Error> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        let handle: Result<OwnedHandle, _> =
            unsafe { HandleOrNull::from_raw_handle(port as RawHandle) }.try_into();
        handle.map(CompletionPort).map_err(|_| {
            let code = unsafe { GetLastError() };
            Error::new_os(ErrorKind::Other, "failed to create IO completion port", code).log_error()
        })
    }

    fn associate(&self, device: &OwnedHandle) -> Result<(), Error> {
        let r = unsafe { CreateIoCompletionPort(raw_handle(device), raw_handle(&self.0), 0, 0) };
        if r.is_null() {
            let code = unsafe { GetLastError() };
            return Err(Error::new_os(
                ErrorKind::Other,
                "failed to associate device with IO completion port",
                code,
            )
            .log_error());
        }
        Ok(())
    }

    /// Block until at least one completion is queued.
    fn dequeue<'a>(
        &self,
        entries: &'a mut [OVERLAPPED_ENTRY; BATCH],
    ) -> Result<&'a [OVERLAPPED_ENTRY], Error> {
        let mut count = 0;
        let r = unsafe {
            GetQueuedCompletionStatusEx(
                raw_handle(&self.0),
                entries.as_mut_ptr(),
                BATCH as u32,
                &mut count,
                u32::MAX,
                FALSE,
            )
        };
        if r == FALSE {
            let code = unsafe { GetLastError() };
            return Err(Error::new_os(
                ErrorKind::Other,
                "failed to dequeue IO completions",
                code,
            ));
        }
        Ok(&entries[..count as usize])
    }
}

static PORT: OnceCell<CompletionPort> = OnceCell::new();

/// Deliver completions of requests on `device` to the completion thread,
/// which is started on first use.
pub(super) fn register(device: &OwnedHandle) -> Result<(), Error> {
    let port = PORT.get_or_try_init(CompletionPort::create)?;

    static STARTED: OnceCell<()> = OnceCell::new();
    STARTED.get_or_try_init(|| {
        thread::Builder::new()
            .name("usbxfer-iocp".into())
            .spawn(move || drain(port))
            .map(|_| ())
            .map_err(|_| Error::new(ErrorKind::Other, "failed to start IO completion thread"))
    })?;

    port.associate(device)
}

fn drain(port: &'static CompletionPort) {
    let mut entries: [OVERLAPPED_ENTRY; BATCH] = unsafe { mem::zeroed() };
    loop {
        let completed = match port.dequeue(&mut entries) {
            Ok(completed) => completed,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };

        for entry in completed {
            trace!(
                "request {:?} completed with {} bytes",
                entry.lpOverlapped,
                entry.dwNumberOfBytesTransferred
            );
            // SAFETY: every OVERLAPPED submitted on a registered handle is the
            // first field of a `PendingRequest` leaked by `start`.
            unsafe {
                PendingRequest::complete_from_port(
                    entry.lpOverlapped,
                    entry.dwNumberOfBytesTransferred,
                );
            }
        }
    }
}
