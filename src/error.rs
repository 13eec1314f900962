use std::{fmt::Display, io, num::NonZeroU32};

/// Error returned from `usbxfer` operations other than descriptor decoding and transfers.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    #[allow(unused)]
    pub(crate) fn new_os(kind: ErrorKind, message: &'static str, code: u32) -> Self {
        Self {
            kind,
            code: NonZeroU32::new(code),
            message,
        }
    }

    #[track_caller]
    #[allow(unused)]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error code from the OS, if applicable.
    ///
    /// On Windows this is the `WIN32_ERROR` value.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (os error {})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Disconnected => io::ErrorKind::NotConnected,
            ErrorKind::Busy => io::ErrorKind::Other,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::InvalidHandle => io::ErrorKind::InvalidInput,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Device is disconnected.
    Disconnected,

    /// Device or endpoint is in use by another application or handle.
    Busy,

    /// This user or application does not have permission to perform the requested operation.
    PermissionDenied,

    /// Requested device path, configuration, or interface not found.
    NotFound,

    /// The requested operation is not supported by the platform or driver.
    Unsupported,

    /// The device handle is the invalid-handle sentinel (never opened, or closed).
    InvalidHandle,

    /// Uncategorized error.
    Other,
}

/// Reason a descriptor decoder stopped before consuming its whole input.
///
/// Decoders never fail outright on device-supplied data. They return the
/// topology decoded so far and report one of these as the stop reason.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// A record would extend past the end of the buffer.
    OutOfBounds {
        /// Offset of the record that could not be read.
        offset: usize,
        /// Bytes the record needs.
        needed: usize,
        /// Bytes remaining in the buffer at `offset`.
        available: usize,
    },

    /// A record's `bLength` is too small to advance past it.
    InvalidLength {
        /// Offset of the record.
        offset: usize,
        /// Its `bLength` field.
        length: u8,
    },

    /// Too many unrecognized records were found where endpoints were expected.
    UnexpectedDescriptorRun {
        /// `bInterfaceNumber` of the interface being decoded.
        interface_number: u8,
        /// Number of records skipped before giving up.
        skipped: usize,
    },

    /// The records do not add up to the declared total length.
    MalformedTotalLength {
        /// The declared `wTotalLength`.
        declared: usize,
        /// Bytes actually consumed by the decoder.
        consumed: usize,
    },
}

impl Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::OutOfBounds {
                offset,
                needed,
                available,
            } => write!(
                f,
                "descriptor at offset {offset} needs {needed} bytes but only {available} remain"
            ),
            DescriptorError::InvalidLength { offset, length } => {
                write!(f, "descriptor at offset {offset} has invalid bLength {length}")
            }
            DescriptorError::UnexpectedDescriptorRun {
                interface_number,
                skipped,
            } => write!(
                f,
                "interface {interface_number}: gave up after {skipped} unexpected descriptors"
            ),
            DescriptorError::MalformedTotalLength { declared, consumed } => write!(
                f,
                "declared total length {declared} does not match {consumed} bytes of descriptors"
            ),
        }
    }
}

impl std::error::Error for DescriptorError {}

impl From<DescriptorError> for io::Error {
    fn from(value: DescriptorError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}

/// Transfer error.
///
/// Obtained from [`Completion::into_result`][crate::transfer::Completion::into_result].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer did not complete within the endpoint's timeout and was aborted.
    TimedOut,

    /// The endpoint's device handle is invalid. No request was issued.
    InvalidHandle,

    /// The request can't be expressed on this endpoint, e.g. a control setup
    /// on a bulk endpoint or a buffer longer than the driver accepts.
    InvalidArgument,

    /// The request completed, but the USB or driver status is nonzero.
    DeviceStatus {
        /// USB-class status (`USBD_STATUS`).
        usbd_status: u32,
        /// Driver / system status (`NTSTATUS` or Win32 error).
        nt_status: u32,
    },

    /// The I/O primitive reported failure without a status code.
    Failed,
}

impl Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::TimedOut => write!(f, "transfer timed out"),
            TransferError::InvalidHandle => write!(f, "device handle is invalid"),
            TransferError::InvalidArgument => write!(f, "invalid transfer request"),
            TransferError::DeviceStatus {
                usbd_status,
                nt_status,
            } => write!(
                f,
                "transfer failed (USBD status 0x{usbd_status:08X}, NT status 0x{nt_status:08X})"
            ),
            TransferError::Failed => write!(f, "transfer failed"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<TransferError> for io::Error {
    fn from(value: TransferError) -> Self {
        let kind = match value {
            TransferError::TimedOut => io::ErrorKind::TimedOut,
            TransferError::InvalidHandle | TransferError::InvalidArgument => {
                io::ErrorKind::InvalidInput
            }
            TransferError::DeviceStatus { .. } | TransferError::Failed => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

/// Error reading a descriptor from the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GetDescriptorError {
    /// Transfer error when getting the descriptor.
    Transfer(TransferError),

    /// Invalid descriptor data
    InvalidDescriptor,
}

impl Display for GetDescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GetDescriptorError::Transfer(e) => write!(f, "{}", e),
            GetDescriptorError::InvalidDescriptor => write!(f, "invalid descriptor"),
        }
    }
}

impl std::error::Error for GetDescriptorError {}

impl From<GetDescriptorError> for io::Error {
    fn from(value: GetDescriptorError) -> Self {
        match value {
            GetDescriptorError::Transfer(e) => e.into(),
            GetDescriptorError::InvalidDescriptor => {
                io::Error::new(io::ErrorKind::InvalidData, "invalid descriptor")
            }
        }
    }
}
