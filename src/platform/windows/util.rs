use std::{
    ffi::OsStr,
    os::windows::prelude::{
        AsHandle, AsRawHandle, HandleOrInvalid, OsStrExt, OwnedHandle, RawHandle,
    },
    ptr::{null, null_mut},
};

use windows_sys::Win32::{
    Foundation::{
        GetLastError, ERROR_ACCESS_DENIED, ERROR_BAD_COMMAND, ERROR_DEVICE_NOT_CONNECTED,
        ERROR_FILE_NOT_FOUND, ERROR_NO_SUCH_DEVICE, ERROR_SHARING_VIOLATION, GENERIC_READ,
        GENERIC_WRITE, HANDLE, WIN32_ERROR,
    },
    Storage::FileSystem::{
        CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
};

use crate::ErrorKind;

/// Wrapper around `CreateFile`, opening for overlapped read and write.
pub fn create_file(path: &OsStr) -> Result<OwnedHandle, WIN32_ERROR> {
    let wide_name: Vec<u16> = path.encode_wide().chain(Some(0)).collect();

    unsafe {
        let r = CreateFileW(
            wide_name.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            null(),
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            null_mut(),
        );
        HandleOrInvalid::from_raw_handle(r as RawHandle)
            .try_into()
            .map_err(|_| GetLastError())
    }
}

pub fn raw_handle(h: impl AsHandle) -> HANDLE {
    h.as_handle().as_raw_handle() as HANDLE
}

/// Classify a Win32 error from opening a device or issuing a request.
pub fn error_kind(err: WIN32_ERROR) -> ErrorKind {
    match err {
        ERROR_BAD_COMMAND
        | ERROR_FILE_NOT_FOUND
        | ERROR_DEVICE_NOT_CONNECTED
        | ERROR_NO_SUCH_DEVICE => ErrorKind::Disconnected,
        ERROR_ACCESS_DENIED => ErrorKind::PermissionDenied,
        ERROR_SHARING_VIOLATION => ErrorKind::Busy,
        _ => ErrorKind::Other,
    }
}
