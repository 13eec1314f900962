//! Transfer-related types.
//!
//! Use the methods on an [`Endpoint`][`crate::Endpoint`] to make individual
//! transfers. Each call blocks until the request completes, times out, or
//! fails, and reports the outcome as a [`Completion`].

use crate::TransferError;

mod control;
pub use control::{ControlSetup, ControlType, Direction, Recipient};
pub(crate) use control::control_timeout_secs;

pub(crate) mod request;
pub use request::{ISO_PACKET_INFO_LEN, REQUEST_HEADER_LEN};
pub(crate) use request::RequestBuffer;

pub(crate) mod engine;

/// How the data of a non-control transfer is handed to the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransferMode {
    /// The caller's buffer is passed to the driver directly, separate from the
    /// request header.
    #[default]
    Direct = 0,

    /// The data is copied into the request buffer after the header, and copied
    /// back out on completion.
    Buffered = 1,
}

impl TransferMode {
    pub(crate) fn from_u8(v: u8) -> TransferMode {
        match v {
            1 => TransferMode::Buffered,
            _ => TransferMode::Direct,
        }
    }
}

/// Status of one isochronous packet, as written back by the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct IsoPacketInfo {
    /// USBD status of the packet.
    pub status: u32,

    /// Bytes transferred in the packet.
    pub length: u32,
}

/// Transfer status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer completed successfully.
    Complete,

    /// The wait exceeded the endpoint timeout. The endpoint was aborted.
    TimedOut,

    /// The device handle is invalid. No request was issued.
    InvalidHandle,

    /// The request can't be expressed on this endpoint. No request was issued.
    InvalidArgument,

    /// The request completed with a nonzero USBD or NT status.
    DeviceStatus,

    /// The I/O primitive reported failure.
    Failed,
}

/// Status and length returned on transfer completion.
///
/// A transfer can move data even when it fails, thus this is a struct
/// containing both rather than a `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Indicates successful completion or error.
    pub status: TransferStatus,

    /// Number of bytes moved into or out of the caller's buffer.
    pub actual_length: usize,

    /// USBD status reported by the driver.
    pub usbd_status: u32,

    /// NT status reported by the driver.
    pub nt_status: u32,

    /// Per-packet results of an isochronous transfer, when requested.
    pub iso_packets: Vec<IsoPacketInfo>,
}

impl Completion {
    pub(crate) fn without_io(status: TransferStatus) -> Completion {
        Completion {
            status,
            actual_length: 0,
            usbd_status: 0,
            nt_status: 0,
            iso_packets: Vec::new(),
        }
    }

    /// `true` if the transfer completed successfully.
    pub fn is_complete(&self) -> bool {
        self.status == TransferStatus::Complete
    }

    /// Get the error, if any.
    pub fn error(&self) -> Option<TransferError> {
        match self.status {
            TransferStatus::Complete => None,
            TransferStatus::TimedOut => Some(TransferError::TimedOut),
            TransferStatus::InvalidHandle => Some(TransferError::InvalidHandle),
            TransferStatus::InvalidArgument => Some(TransferError::InvalidArgument),
            TransferStatus::DeviceStatus => Some(TransferError::DeviceStatus {
                usbd_status: self.usbd_status,
                nt_status: self.nt_status,
            }),
            TransferStatus::Failed => Some(TransferError::Failed),
        }
    }

    /// Ignore any partial data and get the number of bytes transferred, or
    /// the error.
    pub fn into_result(self) -> Result<usize, TransferError> {
        match self.error() {
            None => Ok(self.actual_length),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result() {
        let mut c = Completion::without_io(TransferStatus::Complete);
        c.actual_length = 12;
        assert_eq!(c.clone().into_result(), Ok(12));

        c.status = TransferStatus::DeviceStatus;
        c.usbd_status = 0xC000_0004;
        assert_eq!(
            c.into_result(),
            Err(TransferError::DeviceStatus {
                usbd_status: 0xC000_0004,
                nt_status: 0
            })
        );

        assert_eq!(
            Completion::without_io(TransferStatus::InvalidHandle).into_result(),
            Err(TransferError::InvalidHandle)
        );
    }

    #[test]
    fn test_transfer_mode() {
        assert_eq!(TransferMode::default(), TransferMode::Direct);
        assert_eq!(
            TransferMode::from_u8(TransferMode::Buffered as u8),
            TransferMode::Buffered
        );
        assert_eq!(TransferMode::from_u8(7), TransferMode::Direct);
    }
}
