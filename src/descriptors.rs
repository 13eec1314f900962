//! Bounds-checked access to raw USB descriptor records.
//!
//! Descriptors are self-describing, length-prefixed records chained one after
//! another in a flat buffer. [`DescriptorCursor`] walks such a buffer and hands
//! out typed, fixed-layout views of the record at its current offset without
//! copying. Every view is only created after the cursor has checked that the
//! whole fixed layout lies inside the buffer, so field accessors never read out
//! of bounds on truncated or malformed device data.

use std::fmt::Debug;

use log::warn;

use crate::error::DescriptorError;

pub(crate) const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub(crate) const DESCRIPTOR_LEN_DEVICE: u8 = 18;

pub(crate) const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESCRIPTOR_LEN_CONFIGURATION: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_STRING: u8 = 0x03;

pub(crate) const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub(crate) const DESCRIPTOR_LEN_INTERFACE: u8 = 9;

pub(crate) const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub(crate) const DESCRIPTOR_LEN_ENDPOINT: u8 = 7;

pub(crate) const DESCRIPTOR_TYPE_BOS: u8 = 0x0F;
pub(crate) const DESCRIPTOR_LEN_BOS: u8 = 5;

pub(crate) const DESCRIPTOR_TYPE_DEVICE_CAPABILITY: u8 = 0x10;
pub(crate) const DESCRIPTOR_LEN_CAPABILITY_HEADER: u8 = 3;

pub(crate) const DESCRIPTOR_TYPE_SUPERSPEED_COMPANION: u8 = 0x30;
pub(crate) const DESCRIPTOR_LEN_SUPERSPEED_COMPANION: u8 = 6;

pub(crate) const CAPABILITY_TYPE_USB20_EXTENSION: u8 = 0x02;
pub(crate) const CAPABILITY_LEN_USB20_EXTENSION: u8 = 7;

pub(crate) const CAPABILITY_TYPE_SUPERSPEED: u8 = 0x03;
pub(crate) const CAPABILITY_LEN_SUPERSPEED: u8 = 10;

pub(crate) const CAPABILITY_TYPE_CONTAINER_ID: u8 = 0x04;
pub(crate) const CAPABILITY_LEN_CONTAINER_ID: u8 = 20;

/// Size of the UUID carried by a Container ID capability.
pub const CONTAINER_ID_SIZE: usize = 16;

/// USB defined language IDs for string descriptors.
pub mod language_id {
    /// US English
    pub const US_ENGLISH: u16 = 0x0409;
}

/// How endpoint records inside an interface are decoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Endpoint records stand alone.
    #[default]
    Standard,

    /// Each endpoint record may be followed by a SuperSpeed Endpoint Companion
    /// record, detected by its descriptor type.
    SuperSpeed,
}

impl DecodeMode {
    /// Select the decode mode appropriate for a device's `bcdUSB` version.
    pub fn for_usb_version(bcd_usb: u16) -> DecodeMode {
        if bcd_usb >= 0x0300 {
            DecodeMode::SuperSpeed
        } else {
            DecodeMode::Standard
        }
    }
}

mod sealed {
    pub trait Wrap<'a> {
        /// Wrap a slice that is exactly `LEN` bytes long.
        fn wrap(bytes: &'a [u8]) -> Self;
    }
}

/// A fixed-layout descriptor record that [`DescriptorCursor::read`] can produce.
pub trait DescriptorShape<'a>: sealed::Wrap<'a> + Sized {
    /// Number of bytes in the fixed layout.
    const LEN: u8;
}

/// A bounds-checked reader over a buffer of chained descriptor records.
///
/// The cursor never advances implicitly: callers inspect the record at the
/// current offset with [`peek_type`][Self::peek_type] or [`read`][Self::read]
/// and then decide how far to [`advance`][Self::advance].
#[derive(Clone)]
pub struct DescriptorCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorCursor<'a> {
    /// Create a cursor at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> DescriptorCursor<'a> {
        DescriptorCursor { buf, offset: 0 }
    }

    /// Create a cursor positioned at `offset` within `buf`.
    ///
    /// An offset past the end of the buffer is allowed; every read from it
    /// fails with [`DescriptorError::OutOfBounds`].
    pub fn at(buf: &'a [u8], offset: usize) -> DescriptorCursor<'a> {
        DescriptorCursor { buf, offset }
    }

    /// Current offset from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes left after the current offset.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    /// `true` if no bytes remain.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Get the bytes from the current offset to the end of the buffer.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf.get(self.offset..).unwrap_or(&[])
    }

    fn check(&self, needed: usize) -> Result<&'a [u8], DescriptorError> {
        let available = self.remaining();
        if needed > available {
            return Err(DescriptorError::OutOfBounds {
                offset: self.offset,
                needed,
                available,
            });
        }
        Ok(&self.buf[self.offset..self.offset + needed])
    }

    /// Read the `bLength` field of the record at the current offset.
    pub fn peek_len(&self) -> Result<u8, DescriptorError> {
        Ok(self.check(1)?[0])
    }

    /// Read the `bDescriptorType` field of the record at the current offset
    /// without advancing.
    pub fn peek_type(&self) -> Result<u8, DescriptorError> {
        Ok(self.check(2)?[1])
    }

    /// Interpret the bytes at the current offset as the fixed-layout record `T`.
    ///
    /// Returns the record along with its declared `bLength`, which may be larger
    /// than the fixed layout. Fails if the layout would extend past the end of
    /// the buffer, or if `bLength` is shorter than the layout.
    pub fn read<T: DescriptorShape<'a>>(&self) -> Result<(T, usize), DescriptorError> {
        let bytes = self.check(T::LEN as usize)?;
        let declared = bytes[0];
        if declared < T::LEN {
            return Err(DescriptorError::InvalidLength {
                offset: self.offset,
                length: declared,
            });
        }
        Ok((T::wrap(bytes), declared as usize))
    }

    /// Move the offset forward by `n` bytes.
    ///
    /// Moving exactly to the end of the buffer is allowed; moving past it is not.
    pub fn advance(&mut self, n: usize) -> Result<(), DescriptorError> {
        self.check(n)?;
        self.offset += n;
        Ok(())
    }

    /// Skip the record at the current offset by its own declared length.
    ///
    /// Returns the number of bytes skipped. A `bLength` below 2 can't point to
    /// the next record and is reported as [`DescriptorError::InvalidLength`].
    pub fn skip(&mut self) -> Result<usize, DescriptorError> {
        let (header, len) = self.read_header()?;
        if len > self.remaining() {
            warn!(
                "descriptor type 0x{:02X} with bLength {} exceeds remaining buffer length {}",
                header.descriptor_type(),
                len,
                self.remaining()
            );
        }
        self.advance(len)?;
        Ok(len)
    }

    fn read_header(&self) -> Result<(DescriptorHeader<'a>, usize), DescriptorError> {
        let (header, len): (DescriptorHeader, usize) = self.read()?;
        Ok((header, len))
    }
}

impl Debug for DescriptorCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorCursor")
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .finish()
    }
}

macro_rules! descriptor_fields {
    (impl $(<$( $i_lt:lifetime ),+>)? $tname:ident $(<$( $t_lt:lifetime ),+>)? {
        $(
            $(#[$attr:meta])*
            $vis:vis fn $name:ident at $pos:literal -> $ty:ty;
        )*
    }) => {
        impl $(<$( $i_lt ),+>)? $tname $(<$( $t_lt ),+>)? {
            $(
                $(#[$attr])*
                #[inline]
                $vis fn $name(&self) -> $ty { <$ty>::from_le_bytes(self.0[$pos..$pos + std::mem::size_of::<$ty>()].try_into().unwrap()) }
            )*
        }
    }
}

macro_rules! descriptor_shape {
    ($tname:ident, $len:expr) => {
        impl<'a> sealed::Wrap<'a> for $tname<'a> {
            fn wrap(bytes: &'a [u8]) -> Self {
                debug_assert_eq!(bytes.len(), $len as usize);
                $tname(bytes)
            }
        }

        impl<'a> DescriptorShape<'a> for $tname<'a> {
            const LEN: u8 = $len;
        }

        impl<'a> $tname<'a> {
            /// Get the raw bytes of the fixed layout.
            pub fn as_bytes(&self) -> &'a [u8] {
                self.0
            }
        }
    };
}

/// The two fields common to every descriptor.
#[derive(Clone, Copy)]
pub struct DescriptorHeader<'a>(&'a [u8]);
descriptor_shape!(DescriptorHeader, 2);

descriptor_fields! {
    impl<'a> DescriptorHeader<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;
    }
}

/// Configuration descriptor header.
#[derive(Clone, Copy)]
pub struct ConfigurationDescriptor<'a>(&'a [u8]);
descriptor_shape!(ConfigurationDescriptor, DESCRIPTOR_LEN_CONFIGURATION);

descriptor_fields! {
    impl<'a> ConfigurationDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `wTotalLength` descriptor field: length of the configuration and all its trailing descriptors.
        #[doc(alias = "wTotalLength")]
        pub fn total_length at 2 -> u16;

        /// `bNumInterfaces` descriptor field.
        #[doc(alias = "bNumInterfaces")]
        pub fn num_interfaces at 4 -> u8;

        /// `bConfigurationValue` descriptor field.
        #[doc(alias = "bConfigurationValue")]
        pub fn configuration_value at 5 -> u8;

        /// `iConfiguration` descriptor field.
        #[doc(alias = "iConfiguration")]
        pub fn string_index at 6 -> u8;

        /// `bmAttributes` descriptor field.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 7 -> u8;

        /// `bMaxPower` descriptor field, in units of 2 mA.
        #[doc(alias = "bMaxPower")]
        pub fn max_power at 8 -> u8;
    }
}

/// Interface descriptor, one per alternate setting.
#[derive(Clone, Copy)]
pub struct InterfaceDescriptor<'a>(&'a [u8]);
descriptor_shape!(InterfaceDescriptor, DESCRIPTOR_LEN_INTERFACE);

descriptor_fields! {
    impl<'a> InterfaceDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bInterfaceNumber` descriptor field.
        #[doc(alias = "bInterfaceNumber")]
        pub fn interface_number at 2 -> u8;

        /// `bAlternateSetting` descriptor field.
        #[doc(alias = "bAlternateSetting")]
        pub fn alternate_setting at 3 -> u8;

        /// `bNumEndpoints` descriptor field, not counting endpoint zero.
        #[doc(alias = "bNumEndpoints")]
        pub fn num_endpoints at 4 -> u8;

        /// `bInterfaceClass` descriptor field.
        #[doc(alias = "bInterfaceClass")]
        pub fn class at 5 -> u8;

        /// `bInterfaceSubClass` descriptor field.
        #[doc(alias = "bInterfaceSubClass")]
        pub fn subclass at 6 -> u8;

        /// `bInterfaceProtocol` descriptor field.
        #[doc(alias = "bInterfaceProtocol")]
        pub fn protocol at 7 -> u8;

        /// `iInterface` descriptor field.
        #[doc(alias = "iInterface")]
        pub fn string_index at 8 -> u8;
    }
}

/// Endpoint descriptor.
#[derive(Clone, Copy)]
pub struct EndpointDescriptor<'a>(&'a [u8]);
descriptor_shape!(EndpointDescriptor, DESCRIPTOR_LEN_ENDPOINT);

descriptor_fields! {
    impl<'a> EndpointDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bEndpointAddress` descriptor field.
        #[doc(alias = "bEndpointAddress")]
        pub fn address at 2 -> u8;

        /// `bmAttributes` descriptor field. Bits 0..2 are the transfer type.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 3 -> u8;

        /// Raw `wMaxPacketSize` descriptor field, including the high-bandwidth bits.
        #[doc(alias = "wMaxPacketSize")]
        pub fn max_packet_size_raw at 4 -> u16;

        /// `bInterval` descriptor field.
        #[doc(alias = "bInterval")]
        pub fn interval at 6 -> u8;
    }
}

/// SuperSpeed Endpoint Companion descriptor.
#[derive(Clone, Copy)]
pub struct SuperSpeedCompanionDescriptor<'a>(&'a [u8]);
descriptor_shape!(
    SuperSpeedCompanionDescriptor,
    DESCRIPTOR_LEN_SUPERSPEED_COMPANION
);

descriptor_fields! {
    impl<'a> SuperSpeedCompanionDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bMaxBurst` descriptor field: packets per burst minus one.
        #[doc(alias = "bMaxBurst")]
        pub fn max_burst at 2 -> u8;

        /// `bmAttributes` descriptor field: streams for bulk, `Mult` for isochronous.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 3 -> u8;

        /// `wBytesPerInterval` descriptor field.
        #[doc(alias = "wBytesPerInterval")]
        pub fn bytes_per_interval at 4 -> u16;
    }
}

/// Binary Object Store descriptor header.
#[derive(Clone, Copy)]
pub struct BosDescriptor<'a>(&'a [u8]);
descriptor_shape!(BosDescriptor, DESCRIPTOR_LEN_BOS);

descriptor_fields! {
    impl<'a> BosDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `wTotalLength` descriptor field, including all device capabilities.
        #[doc(alias = "wTotalLength")]
        pub fn total_length at 2 -> u16;

        /// `bNumDeviceCaps` descriptor field.
        #[doc(alias = "bNumDeviceCaps")]
        pub fn num_device_caps at 4 -> u8;
    }
}

/// The fields common to every device capability descriptor.
#[derive(Clone, Copy)]
pub struct CapabilityHeader<'a>(&'a [u8]);
descriptor_shape!(CapabilityHeader, DESCRIPTOR_LEN_CAPABILITY_HEADER);

descriptor_fields! {
    impl<'a> CapabilityHeader<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bDevCapabilityType` descriptor field.
        #[doc(alias = "bDevCapabilityType")]
        pub fn capability_type at 2 -> u8;
    }
}

/// USB 2.0 Extension device capability.
#[derive(Clone, Copy)]
pub struct Usb20ExtensionDescriptor<'a>(&'a [u8]);
descriptor_shape!(Usb20ExtensionDescriptor, CAPABILITY_LEN_USB20_EXTENSION);

descriptor_fields! {
    impl<'a> Usb20ExtensionDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bDevCapabilityType` descriptor field.
        #[doc(alias = "bDevCapabilityType")]
        pub fn capability_type at 2 -> u8;

        /// `bmAttributes` descriptor field. Bit 1 is Link Power Management support.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 3 -> u32;
    }
}

/// SuperSpeed USB device capability.
#[derive(Clone, Copy)]
pub struct SuperSpeedCapabilityDescriptor<'a>(&'a [u8]);
descriptor_shape!(SuperSpeedCapabilityDescriptor, CAPABILITY_LEN_SUPERSPEED);

descriptor_fields! {
    impl<'a> SuperSpeedCapabilityDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bDevCapabilityType` descriptor field.
        #[doc(alias = "bDevCapabilityType")]
        pub fn capability_type at 2 -> u8;

        /// `bmAttributes` descriptor field. Bit 1 is Latency Tolerance Messages support.
        #[doc(alias = "bmAttributes")]
        pub fn attributes at 3 -> u8;

        /// `wSpeedsSupported` descriptor field: bit 0 low, 1 full, 2 high, 3 SuperSpeed.
        #[doc(alias = "wSpeedsSupported")]
        pub fn speeds_supported at 4 -> u16;

        /// `bFunctionalitySupport` descriptor field: lowest speed with full functionality.
        #[doc(alias = "bFunctionalitySupport")]
        pub fn functionality_support at 6 -> u8;

        /// `bU1DevExitLat` descriptor field, in microseconds.
        #[doc(alias = "bU1DevExitLat")]
        pub fn u1_exit_latency at 7 -> u8;

        /// `wU2DevExitLat` descriptor field, in microseconds.
        #[doc(alias = "wU2DevExitLat")]
        pub fn u2_exit_latency at 8 -> u16;
    }
}

/// Container ID device capability.
#[derive(Clone, Copy)]
pub struct ContainerIdDescriptor<'a>(&'a [u8]);
descriptor_shape!(ContainerIdDescriptor, CAPABILITY_LEN_CONTAINER_ID);

descriptor_fields! {
    impl<'a> ContainerIdDescriptor<'a> {
        /// `bLength` descriptor field.
        #[doc(alias = "bLength")]
        pub fn length at 0 -> u8;

        /// `bDescriptorType` descriptor field.
        #[doc(alias = "bDescriptorType")]
        pub fn descriptor_type at 1 -> u8;

        /// `bDevCapabilityType` descriptor field.
        #[doc(alias = "bDevCapabilityType")]
        pub fn capability_type at 2 -> u8;

        /// `bReserved` descriptor field.
        #[doc(alias = "bReserved")]
        pub fn reserved at 3 -> u8;
    }
}

impl<'a> ContainerIdDescriptor<'a> {
    /// `ContainerID` descriptor field: a UUID unique to the device instance.
    #[doc(alias = "ContainerID")]
    pub fn container_id(&self) -> [u8; CONTAINER_ID_SIZE] {
        self.0[4..4 + CONTAINER_ID_SIZE].try_into().unwrap()
    }
}

/// `bLength` of the device descriptor at the start of `buf`, or `None` if
/// `buf` is too short, declares a short record, or holds another type.
pub(crate) fn validate_device_descriptor(buf: &[u8]) -> Option<usize> {
    if buf.len() < DESCRIPTOR_LEN_DEVICE as usize {
        if !buf.is_empty() {
            warn!(
                "device descriptor buffer is {} bytes, need {}",
                buf.len(),
                DESCRIPTOR_LEN_DEVICE
            );
        }
        return None;
    }

    if buf[0] < DESCRIPTOR_LEN_DEVICE {
        warn!("invalid device descriptor bLength");
        return None;
    }

    if buf[1] != DESCRIPTOR_TYPE_DEVICE {
        warn!(
            "device bDescriptorType is {}, not a device descriptor",
            buf[1]
        );
        return None;
    }

    Some(buf[0] as usize)
}

/// The 18-byte device descriptor, as read by [`UsbDevice::open`] or passed
/// to [`UsbDevice::from_descriptors`].
///
/// [`UsbDevice::open`]: crate::UsbDevice::open
/// [`UsbDevice::from_descriptors`]: crate::UsbDevice::from_descriptors
#[derive(Clone)]
pub struct DeviceDescriptor([u8; DESCRIPTOR_LEN_DEVICE as usize]);

impl DeviceDescriptor {
    /// Copy the device descriptor from the start of `buf`. Bytes past the
    /// 18-byte record are ignored.
    pub fn new(buf: &[u8]) -> Option<Self> {
        validate_device_descriptor(buf)?;
        Some(Self(
            buf[0..DESCRIPTOR_LEN_DEVICE as usize].try_into().unwrap(),
        ))
    }

    /// Raw descriptor bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

descriptor_fields! {
    impl DeviceDescriptor {
        /// `bcdUSB`: USB release in BCD, e.g. `0x0210`. Decides whether
        /// `open` reads a BOS descriptor.
        #[doc(alias = "bcdUSB")]
        pub fn usb_version at 2 -> u16;

        /// `bDeviceClass`.
        #[doc(alias = "bDeviceClass")]
        pub fn class at 4 -> u8;

        /// `bDeviceSubClass`.
        #[doc(alias = "bDeviceSubClass")]
        pub fn subclass at 5 -> u8;

        /// `bDeviceProtocol`.
        #[doc(alias = "bDeviceProtocol")]
        pub fn protocol at 6 -> u8;

        /// `bMaxPacketSize0`: max packet size of the shared control endpoint.
        /// Passed through unchanged, including the exponent form of USB 3.
        #[doc(alias = "bMaxPacketSize0")]
        pub fn max_packet_size_0 at 7 -> u8;

        /// `idVendor`.
        #[doc(alias = "idVendor")]
        pub fn vendor_id at 8 -> u16;

        /// `idProduct`.
        #[doc(alias = "idProduct")]
        pub fn product_id at 10 -> u16;

        /// `bcdDevice`: device release in BCD.
        #[doc(alias = "bcdDevice")]
        pub fn device_version at 12 -> u16;

        fn manufacturer_string_index_raw at 14 -> u8;
        fn product_string_index_raw at 15 -> u8;
        fn serial_number_string_index_raw at 16 -> u8;

        /// `bNumConfigurations`: how many configuration descriptors `open`
        /// requests.
        #[doc(alias = "bNumConfigurations")]
        pub fn num_configurations at 17 -> u8;
    }
}

impl DeviceDescriptor {
    /// `iManufacturer`, or `None` when zero.
    pub fn manufacturer_string_index(&self) -> Option<u8> {
        Some(self.manufacturer_string_index_raw()).filter(|&i| i != 0)
    }

    /// `iProduct`, or `None` when zero.
    pub fn product_string_index(&self) -> Option<u8> {
        Some(self.product_string_index_raw()).filter(|&i| i != 0)
    }

    /// `iSerialNumber`, or `None` when zero.
    pub fn serial_number_string_index(&self) -> Option<u8> {
        Some(self.serial_number_string_index_raw()).filter(|&i| i != 0)
    }
}

impl Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("usb_version", &format_args!("0x{:04X}", self.usb_version()))
            .field("class", &format_args!("0x{:02X}", self.class()))
            .field("subclass", &format_args!("0x{:02X}", self.subclass()))
            .field("protocol", &format_args!("0x{:02X}", self.protocol()))
            .field("max_packet_size_0", &self.max_packet_size_0())
            .field("vendor_id", &format_args!("0x{:04X}", self.vendor_id()))
            .field("product_id", &format_args!("0x{:04X}", self.product_id()))
            .field(
                "device_version",
                &format_args!("0x{:04X}", self.device_version()),
            )
            .field(
                "manufacturer_string_index",
                &self.manufacturer_string_index(),
            )
            .field("product_string_index", &self.product_string_index())
            .field(
                "serial_number_string_index",
                &self.serial_number_string_index(),
            )
            .field("num_configurations", &self.num_configurations())
            .finish()
    }
}

pub(crate) fn validate_string_descriptor(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] as usize == data.len() && data[1] == DESCRIPTOR_TYPE_STRING
}

pub(crate) fn decode_string_descriptor(data: &[u8]) -> Option<String> {
    if !validate_string_descriptor(data) {
        return None;
    }

    Some(
        char::decode_utf16(
            data[2..]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes(c.try_into().unwrap())),
        )
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect::<String>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_does_not_advance() {
        let buf = [9, 4, 0, 0, 1, 3, 0, 0, 0];
        let c = DescriptorCursor::new(&buf);
        assert_eq!(c.peek_type(), Ok(DESCRIPTOR_TYPE_INTERFACE));
        assert_eq!(c.peek_len(), Ok(9));
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let buf = [7, 5, 0x81, 2];
        let c = DescriptorCursor::new(&buf);
        assert_eq!(
            c.read::<EndpointDescriptor>().map(|(_, l)| l),
            Err(DescriptorError::OutOfBounds {
                offset: 0,
                needed: 7,
                available: 4
            })
        );
    }

    #[test]
    fn test_read_short_length() {
        let buf = [3, 5, 0x81, 2, 0x40, 0, 0];
        let c = DescriptorCursor::new(&buf);
        assert_eq!(
            c.read::<EndpointDescriptor>().map(|(_, l)| l),
            Err(DescriptorError::InvalidLength {
                offset: 0,
                length: 3
            })
        );
    }

    #[test]
    fn test_read_endpoint() {
        let buf = [7, 5, 0x81, 2, 0x00, 0x02, 0, 0xAA];
        let c = DescriptorCursor::new(&buf);
        let (ep, len): (EndpointDescriptor, usize) = c.read().unwrap();
        assert_eq!(len, 7);
        assert_eq!(ep.address(), 0x81);
        assert_eq!(ep.attributes(), 2);
        assert_eq!(ep.max_packet_size_raw(), 512);
        assert_eq!(ep.interval(), 0);
    }

    #[test]
    fn test_advance_and_skip() {
        let buf = [5, 0x24, 0, 0, 0, 2, 0xFF];
        let mut c = DescriptorCursor::new(&buf);
        assert_eq!(c.skip(), Ok(5));
        assert_eq!(c.offset(), 5);
        assert_eq!(c.peek_type(), Ok(0xFF));
        assert!(c.advance(3).is_err());
        assert_eq!(c.advance(2), Ok(()));
        assert!(c.is_empty());
        assert!(c.peek_type().is_err());
    }

    #[test]
    fn test_skip_zero_length() {
        let buf = [0, 0x24, 0, 0];
        let mut c = DescriptorCursor::new(&buf);
        assert_eq!(
            c.skip(),
            Err(DescriptorError::InvalidLength {
                offset: 0,
                length: 0
            })
        );
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_cursor_past_end() {
        let buf = [9, 2];
        let c = DescriptorCursor::at(&buf, 10);
        assert_eq!(c.remaining(), 0);
        assert_eq!(c.as_bytes(), &[] as &[u8]);
        assert!(c.peek_len().is_err());
    }

    #[test]
    fn test_decode_mode() {
        assert_eq!(DecodeMode::for_usb_version(0x0200), DecodeMode::Standard);
        assert_eq!(DecodeMode::for_usb_version(0x0210), DecodeMode::Standard);
        assert_eq!(DecodeMode::for_usb_version(0x0300), DecodeMode::SuperSpeed);
        assert_eq!(DecodeMode::for_usb_version(0x0320), DecodeMode::SuperSpeed);
    }

    #[test]
    fn test_string_descriptor() {
        assert_eq!(
            decode_string_descriptor(&[8, 3, b'a', 0, b'b', 0, b'c', 0]).as_deref(),
            Some("abc")
        );
        assert_eq!(decode_string_descriptor(&[9, 3, b'a', 0]), None);
    }

    #[test]
    #[rustfmt::skip]
    fn test_linux_root_hub() {
        let dev = DeviceDescriptor::new(&[
            0x12, 0x01, 0x00, 0x02, 0x09, 0x00, 0x01, 0x40, 0x6b,
            0x1d, 0x02, 0x00, 0x10, 0x05, 0x03, 0x02, 0x01, 0x01
        ]).unwrap();
        assert_eq!(dev.usb_version(), 0x0200);
        assert_eq!(dev.class(), 0x09);
        assert_eq!(dev.max_packet_size_0(), 64);
        assert_eq!(dev.vendor_id(), 0x1d6b);
        assert_eq!(dev.product_id(), 0x0002);
        assert_eq!(dev.manufacturer_string_index(), Some(3));
        assert_eq!(dev.num_configurations(), 1);

        assert!(DeviceDescriptor::new(&[0x12, 0x02, 0x00]).is_none());
    }
}
