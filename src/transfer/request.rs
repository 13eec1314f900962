//! Layout of the request header the driver expects in front of every transfer.
//!
//! ```text
//! offset  size  field
//!      0     1  bmRequestType      (control only)
//!      1     1  bRequest           (control only)
//!      2     2  wValue             (control only)
//!      4     2  wIndex             (control only)
//!      6     2  wLength            (control only)
//!      8     4  timeout, seconds   (control only)
//!     12     1  wait forever
//!     13     1  endpoint address
//!     14     4  NT status          (written by the driver)
//!     18     4  USBD status        (written by the driver)
//!     22     4  iso packet block offset
//!     26     4  iso packet block length
//!     30     4  data offset
//!     34     4  data length
//! ```
//!
//! All fields are little-endian and packed.

use super::{control::SETUP_PACKET_SIZE, IsoPacketInfo};

/// Length of the request header.
pub const REQUEST_HEADER_LEN: usize = 38;

/// Length of one isochronous packet record in the packet block.
pub const ISO_PACKET_INFO_LEN: usize = 8;

pub(crate) const OFFSET_REQUEST_TYPE: usize = 0;
pub(crate) const OFFSET_REQUEST: usize = 1;
pub(crate) const OFFSET_VALUE: usize = 2;
pub(crate) const OFFSET_INDEX: usize = 4;
pub(crate) const OFFSET_LENGTH: usize = 6;
pub(crate) const OFFSET_TIMEOUT: usize = 8;
pub(crate) const OFFSET_WAIT_FOREVER: usize = 12;
pub(crate) const OFFSET_ENDPOINT: usize = 13;
pub(crate) const OFFSET_NT_STATUS: usize = 14;
pub(crate) const OFFSET_USBD_STATUS: usize = 18;
pub(crate) const OFFSET_ISO_OFFSET: usize = 22;
pub(crate) const OFFSET_ISO_LENGTH: usize = 26;
pub(crate) const OFFSET_BUFFER_OFFSET: usize = 30;
pub(crate) const OFFSET_BUFFER_LENGTH: usize = 34;

/// Request header at the start of a request buffer.
///
/// The buffer is always at least [`REQUEST_HEADER_LEN`] bytes; the data and
/// isochronous packet block, if any, follow it.
pub(crate) struct RequestBuffer {
    buf: Vec<u8>,
}

macro_rules! header_fields {
    ($(
        $get:ident / $set:ident at $pos:ident -> $ty:ty;
    )*) => {
        impl RequestBuffer {
            $(
                #[allow(unused)]
                pub(crate) fn $get(&self) -> $ty {
                    <$ty>::from_le_bytes(self.buf[$pos..$pos + std::mem::size_of::<$ty>()].try_into().unwrap())
                }

                #[allow(unused)]
                pub(crate) fn $set(&mut self, v: $ty) {
                    self.buf[$pos..$pos + std::mem::size_of::<$ty>()].copy_from_slice(&v.to_le_bytes());
                }
            )*
        }
    }
}

header_fields! {
    request_type / set_request_type at OFFSET_REQUEST_TYPE -> u8;
    request / set_request at OFFSET_REQUEST -> u8;
    value / set_value at OFFSET_VALUE -> u16;
    index / set_index at OFFSET_INDEX -> u16;
    length / set_length at OFFSET_LENGTH -> u16;
    timeout_secs / set_timeout_secs at OFFSET_TIMEOUT -> u32;
    wait_forever / set_wait_forever at OFFSET_WAIT_FOREVER -> u8;
    endpoint / set_endpoint at OFFSET_ENDPOINT -> u8;
    nt_status / set_nt_status at OFFSET_NT_STATUS -> u32;
    usbd_status / set_usbd_status at OFFSET_USBD_STATUS -> u32;
    iso_offset / set_iso_offset at OFFSET_ISO_OFFSET -> u32;
    iso_length / set_iso_length at OFFSET_ISO_LENGTH -> u32;
    buffer_offset / set_buffer_offset at OFFSET_BUFFER_OFFSET -> u32;
    buffer_length / set_buffer_length at OFFSET_BUFFER_LENGTH -> u32;
}

impl RequestBuffer {
    /// Allocate a zeroed header followed by `trailing` zeroed bytes.
    pub(crate) fn new(trailing: usize) -> RequestBuffer {
        RequestBuffer {
            buf: vec![0; REQUEST_HEADER_LEN + trailing],
        }
    }

    /// Write the 8-byte setup packet over the control fields at the start of
    /// the header.
    pub(crate) fn set_setup_packet(&mut self, packet: &[u8; SETUP_PACKET_SIZE]) {
        self.buf[OFFSET_REQUEST_TYPE..OFFSET_REQUEST_TYPE + SETUP_PACKET_SIZE]
            .copy_from_slice(packet);
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    /// Bytes of the buffer starting at `offset`, clamped to the buffer.
    pub(crate) fn tail(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.buf.len());
        let end = offset.saturating_add(len).min(self.buf.len());
        &self.buf[start..end]
    }

    pub(crate) fn tail_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        let start = offset.min(self.buf.len());
        let end = offset.saturating_add(len).min(self.buf.len());
        &mut self.buf[start..end]
    }

    /// Decode the isochronous packet block described by the header.
    pub(crate) fn iso_packets(&self) -> Vec<IsoPacketInfo> {
        let offset = self.iso_offset() as usize;
        let length = self.iso_length() as usize;
        self.tail(offset, length)
            .chunks_exact(ISO_PACKET_INFO_LEN)
            .map(|c| IsoPacketInfo {
                status: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                length: u32::from_le_bytes(c[4..8].try_into().unwrap()),
            })
            .collect()
    }
}

impl std::fmt::Debug for RequestBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuffer")
            .field("request_type", &format_args!("0x{:02X}", self.request_type()))
            .field("request", &format_args!("0x{:02X}", self.request()))
            .field("endpoint", &format_args!("0x{:02X}", self.endpoint()))
            .field("nt_status", &format_args!("0x{:08X}", self.nt_status()))
            .field("usbd_status", &format_args!("0x{:08X}", self.usbd_status()))
            .field("iso_offset", &self.iso_offset())
            .field("iso_length", &self.iso_length())
            .field("buffer_offset", &self.buffer_offset())
            .field("buffer_length", &self.buffer_length())
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut r = RequestBuffer::new(4);
        r.set_request_type(0xC0);
        r.set_request(0xA0);
        r.set_value(0x1234);
        r.set_index(0x5678);
        r.set_length(4);
        r.set_timeout_secs(10);
        r.set_endpoint(0x81);
        r.set_iso_offset(38);
        r.set_buffer_offset(38);
        r.set_buffer_length(4);

        #[rustfmt::skip]
        let expected: [u8; REQUEST_HEADER_LEN] = [
            0xC0, 0xA0, 0x34, 0x12, 0x78, 0x56, 0x04, 0x00,
            0x0A, 0x00, 0x00, 0x00,
            0x00, 0x81,
            0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x26, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x26, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
        ];
        assert_eq!(&r.as_slice()[..REQUEST_HEADER_LEN], &expected);
        assert_eq!(r.len(), REQUEST_HEADER_LEN + 4);
    }

    #[test]
    fn test_iso_packets() {
        let mut r = RequestBuffer::new(2 * ISO_PACKET_INFO_LEN);
        r.set_iso_offset(REQUEST_HEADER_LEN as u32);
        r.set_iso_length(2 * ISO_PACKET_INFO_LEN as u32);
        r.tail_mut(REQUEST_HEADER_LEN, 16).copy_from_slice(&[
            0, 0, 0, 0, 0x00, 0x04, 0, 0, //
            0x30, 0, 0, 0xC0, 0x10, 0, 0, 0,
        ]);
        assert_eq!(
            r.iso_packets(),
            vec![
                IsoPacketInfo {
                    status: 0,
                    length: 1024
                },
                IsoPacketInfo {
                    status: 0xC000_0030,
                    length: 16
                },
            ]
        );
    }

    #[test]
    fn test_iso_block_out_of_range() {
        let mut r = RequestBuffer::new(0);
        r.set_iso_offset(REQUEST_HEADER_LEN as u32);
        r.set_iso_length(64);
        assert!(r.iso_packets().is_empty());
    }
}
