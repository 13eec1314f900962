//! USB descriptor topology and endpoint transfers over an overlapped-IO
//! device driver.
//!
//! A [`UsbDevice`] decodes the device, configuration and BOS descriptors of
//! an opened device into [`Configuration`]s, [`Interface`]s and
//! [`Endpoint`]s. Each endpoint carries its own timeout and
//! [`TransferMode`][transfer::TransferMode] and performs blocking transfers
//! through the [`DeviceIo`][platform::DeviceIo] it was built against.
//!
//! Decoding never panics on device-supplied data: a malformed descriptor
//! stops decoding at the offending record and the partial topology is kept,
//! with the reason available as a [`DescriptorError`].

pub mod descriptors;
pub mod platform;
pub mod transfer;

mod error;
pub use error::{DescriptorError, Error, ErrorKind, GetDescriptorError, TransferError};

mod endpoint;
pub use endpoint::{
    effective_max_packet_size, Endpoint, EndpointKind, LastStatus, SuperSpeedCompanion,
    TransferType, DEFAULT_TIMEOUT,
};

mod interface;
pub use interface::{Interface, InterfaceGroup, MAX_UNEXPECTED_DESCRIPTORS};

mod configuration;
pub use configuration::{Configuration, MAX_INTERFACES};

pub mod bos;
pub use bos::BosCapabilities;

pub mod hid;

mod device;
pub use device::UsbDevice;
