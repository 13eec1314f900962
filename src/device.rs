use std::{
    fmt::{Debug, Display},
    num::NonZeroU8,
    sync::Arc,
};

use log::{debug, error, warn};

use crate::{
    bos::BosCapabilities,
    descriptors::{
        decode_string_descriptor, validate_string_descriptor, DecodeMode, DeviceDescriptor,
        DESCRIPTOR_LEN_DEVICE, DESCRIPTOR_TYPE_BOS, DESCRIPTOR_TYPE_CONFIGURATION,
        DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_STRING,
    },
    interface::Interface,
    platform::DeviceIo,
    transfer::{ControlSetup, ControlType, Direction, Recipient},
    Configuration, Endpoint, Error, ErrorKind, GetDescriptorError,
};

const STANDARD_REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Packet size used on endpoint zero before the device descriptor is known.
const INITIAL_MAX_PACKET_SIZE_0: u8 = 64;

/// The configuration header is fetched first to learn `wTotalLength`.
const CONFIGURATION_HEADER_LEN: usize = 9;
const BOS_HEADER_LEN: usize = 5;

/// The decoded descriptor topology of one opened device.
///
/// Every configuration shares the device's single control endpoint, which
/// also appears in slot zero of every interface.
///
/// ```no_run
/// # fn open() -> std::sync::Arc<dyn usbxfer::platform::DeviceIo> { todo!() }
/// let device = usbxfer::UsbDevice::open(open()).unwrap();
/// let ep = device.endpoint_of(0x81).expect("no endpoint 0x81");
/// let mut buf = vec![0; 4096];
/// let n = ep.transfer(&mut buf).into_result().unwrap();
/// ```
pub struct UsbDevice {
    io: Arc<dyn DeviceIo>,
    descriptor: DeviceDescriptor,
    mode: DecodeMode,
    control: Arc<Endpoint>,
    configurations: Vec<Configuration>,
    active: usize,
    bos: Option<BosCapabilities>,
}

impl UsbDevice {
    /// Build the topology from descriptors that were already read.
    ///
    /// `config_bufs` holds each full configuration descriptor set, in
    /// configuration index order. `bos_buf` is only decoded for devices
    /// reporting `bcdUSB` 2.01 or later. The decode mode follows the device's
    /// `bcdUSB`.
    pub fn from_descriptors<B: AsRef<[u8]>>(
        io: Arc<dyn DeviceIo>,
        device_desc: &[u8],
        config_bufs: &[B],
        bos_buf: Option<&[u8]>,
    ) -> Result<UsbDevice, Error> {
        let descriptor = parse_device_descriptor(device_desc)?;
        let mode = DecodeMode::for_usb_version(descriptor.usb_version());
        Self::assemble(io, descriptor, config_bufs, bos_buf, mode)
    }

    /// Like [`from_descriptors`][Self::from_descriptors], with the endpoint
    /// decode mode chosen by the caller.
    pub fn from_descriptors_with_mode<B: AsRef<[u8]>>(
        io: Arc<dyn DeviceIo>,
        device_desc: &[u8],
        config_bufs: &[B],
        bos_buf: Option<&[u8]>,
        mode: DecodeMode,
    ) -> Result<UsbDevice, Error> {
        let descriptor = parse_device_descriptor(device_desc)?;
        Self::assemble(io, descriptor, config_bufs, bos_buf, mode)
    }

    /// Read every descriptor from the device over endpoint zero and build
    /// the topology.
    pub fn open(io: Arc<dyn DeviceIo>) -> Result<UsbDevice, Error> {
        if !io.is_valid() {
            return Err(Error::new(ErrorKind::InvalidHandle, "device is not open"));
        }

        let ep0 = Endpoint::control(io.clone(), INITIAL_MAX_PACKET_SIZE_0);

        let device_desc = get_descriptor(
            &ep0,
            DESCRIPTOR_TYPE_DEVICE,
            0,
            0,
            DESCRIPTOR_LEN_DEVICE as usize,
        )
        .map_err(|e| read_error("failed to read device descriptor", e))?;
        let descriptor = parse_device_descriptor(&device_desc)?;

        let mut config_bufs = Vec::with_capacity(descriptor.num_configurations() as usize);
        for index in 0..descriptor.num_configurations() {
            let read = read_with_total_length(
                &ep0,
                DESCRIPTOR_TYPE_CONFIGURATION,
                index,
                CONFIGURATION_HEADER_LEN,
            );
            match read {
                Ok(buf) => config_bufs.push(buf),
                Err(e) => warn!("failed to read configuration descriptor {index}: {e}"),
            }
        }

        let bos_buf = if descriptor.usb_version() >= 0x0201 {
            read_with_total_length(&ep0, DESCRIPTOR_TYPE_BOS, 0, BOS_HEADER_LEN)
                .inspect_err(|e| warn!("failed to read BOS descriptor: {e}"))
                .ok()
        } else {
            None
        };

        let mode = DecodeMode::for_usb_version(descriptor.usb_version());
        Self::assemble(io, descriptor, &config_bufs, bos_buf.as_deref(), mode)
    }

    fn assemble<B: AsRef<[u8]>>(
        io: Arc<dyn DeviceIo>,
        descriptor: DeviceDescriptor,
        config_bufs: &[B],
        bos_buf: Option<&[u8]>,
        mode: DecodeMode,
    ) -> Result<UsbDevice, Error> {
        let control = Arc::new(Endpoint::control(io.clone(), descriptor.max_packet_size_0()));

        let mut configurations = Vec::with_capacity(config_bufs.len());
        for (i, buf) in config_bufs.iter().enumerate() {
            match Configuration::decode(&io, &control, buf.as_ref(), mode) {
                Ok(c) => configurations.push(c),
                Err(e) => warn!("configuration {i} not decoded: {e}"),
            }
        }

        if configurations.len() != descriptor.num_configurations() as usize {
            debug!(
                "device declares {} configurations, decoded {}",
                descriptor.num_configurations(),
                configurations.len()
            );
        }

        let bos = match bos_buf {
            Some(buf) if descriptor.usb_version() >= 0x0201 => match BosCapabilities::decode(buf) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!("BOS descriptor not decoded: {e}");
                    None
                }
            },
            Some(_) => {
                debug!(
                    "ignoring BOS descriptor for bcdUSB {:04x}",
                    descriptor.usb_version()
                );
                None
            }
            None => None,
        };

        Ok(UsbDevice {
            io,
            descriptor,
            mode,
            control,
            configurations,
            active: 0,
            bos,
        })
    }

    /// Get the device descriptor.
    ///
    /// This returns cached data and does not perform IO.
    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Endpoint decode mode used for the configurations.
    pub fn decode_mode(&self) -> DecodeMode {
        self.mode
    }

    /// `true` if the device handle is valid.
    pub fn is_open(&self) -> bool {
        self.io.is_valid()
    }

    /// The control endpoint shared by every interface.
    pub fn control_endpoint(&self) -> &Arc<Endpoint> {
        &self.control
    }

    /// Every decoded configuration, in index order.
    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    /// The selected configuration, initially the first one.
    ///
    /// `None` if no configuration could be decoded.
    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.configurations.get(self.active)
    }

    /// Select which decoded configuration [`endpoint_of`][Self::endpoint_of]
    /// and [`interface`][Self::interface] search.
    ///
    /// This does not issue `SET_CONFIGURATION`.
    pub fn select_configuration(&mut self, configuration_value: u8) -> Result<(), Error> {
        let Some(i) = self
            .configurations
            .iter()
            .position(|c| c.configuration_value() == configuration_value)
        else {
            return Err(Error::new(ErrorKind::NotFound, "no such configuration"));
        };
        self.active = i;
        Ok(())
    }

    /// Capabilities from the BOS descriptor, if the device has one.
    pub fn bos(&self) -> Option<&BosCapabilities> {
        self.bos.as_ref()
    }

    /// Find an endpoint of the active configuration by address, searching the
    /// first alternate setting of each interface. Address 0 or 0x80 returns
    /// the control endpoint.
    pub fn endpoint_of(&self, address: u8) -> Option<&Arc<Endpoint>> {
        if address & 0x7F == 0 {
            return Some(&self.control);
        }
        self.active_configuration()?.endpoint(address)
    }

    /// Find an alternate setting of the active configuration.
    pub fn interface(&self, number: u8, alternate_setting: u8) -> Option<&Interface> {
        self.active_configuration()?
            .interface(number, alternate_setting)
    }

    /// Request a descriptor from the device on the control endpoint.
    ///
    /// The `language_id` should be `0` unless you are requesting a string
    /// descriptor. At most `length` bytes are read.
    pub fn get_descriptor(
        &self,
        desc_type: u8,
        desc_index: u8,
        language_id: u16,
        length: usize,
    ) -> Result<Vec<u8>, GetDescriptorError> {
        get_descriptor(&self.control, desc_type, desc_index, language_id, length)
    }

    /// Request the list of supported languages for string descriptors.
    pub fn get_string_descriptor_supported_languages(
        &self,
    ) -> Result<impl Iterator<Item = u16>, GetDescriptorError> {
        let data = self.get_descriptor(DESCRIPTOR_TYPE_STRING, 0, 0, 255)?;
        if !validate_string_descriptor(&data) {
            error!("String descriptor language list read {data:?}, not a valid string descriptor");
            return Err(GetDescriptorError::InvalidDescriptor);
        }

        let mut iter = data.into_iter().skip(2);
        Ok(std::iter::from_fn(move || {
            Some(u16::from_le_bytes([iter.next()?, iter.next()?]))
        }))
    }

    /// Request a string descriptor from the device.
    ///
    /// Almost all devices support only the language ID
    /// [`US_ENGLISH`][`crate::descriptors::language_id::US_ENGLISH`].
    ///
    /// Unpaired UTF-16 surrogates will be replaced with `\u{FFFD}`, like
    /// [`String::from_utf16_lossy`].
    pub fn get_string_descriptor(
        &self,
        desc_index: NonZeroU8,
        language_id: u16,
    ) -> Result<String, GetDescriptorError> {
        let data = self.get_descriptor(DESCRIPTOR_TYPE_STRING, desc_index.get(), language_id, 255)?;
        decode_string_descriptor(&data).ok_or(GetDescriptorError::InvalidDescriptor)
    }
}

fn parse_device_descriptor(buf: &[u8]) -> Result<DeviceDescriptor, Error> {
    DeviceDescriptor::new(buf)
        .ok_or_else(|| Error::new(ErrorKind::Other, "invalid device descriptor").log_debug())
}

fn read_error(message: &'static str, e: GetDescriptorError) -> Error {
    let kind = match e {
        GetDescriptorError::Transfer(crate::TransferError::InvalidHandle) => ErrorKind::InvalidHandle,
        _ => ErrorKind::Other,
    };
    warn!("{message}: {e}");
    Error::new(kind, message)
}

fn get_descriptor(
    ep0: &Endpoint,
    desc_type: u8,
    desc_index: u8,
    language_id: u16,
    length: usize,
) -> Result<Vec<u8>, GetDescriptorError> {
    ep0.set_control_setup(ControlSetup {
        direction: Direction::In,
        control_type: ControlType::Standard,
        recipient: Recipient::Device,
        request: STANDARD_REQUEST_GET_DESCRIPTOR,
        value: ((desc_type as u16) << 8) | desc_index as u16,
        index: language_id,
    });

    let mut buf = vec![0; length];
    let n = ep0
        .control_read(&mut buf)
        .into_result()
        .map_err(GetDescriptorError::Transfer)?;
    buf.truncate(n);
    Ok(buf)
}

/// Read a descriptor whose `wTotalLength` is at offset 2: first the header,
/// then the whole set.
fn read_with_total_length(
    ep0: &Endpoint,
    desc_type: u8,
    desc_index: u8,
    header_len: usize,
) -> Result<Vec<u8>, GetDescriptorError> {
    let header = get_descriptor(ep0, desc_type, desc_index, 0, header_len)?;
    if header.len() < 4 || header[1] != desc_type {
        return Err(GetDescriptorError::InvalidDescriptor);
    }
    let total = u16::from_le_bytes([header[2], header[3]]) as usize;
    if total <= header.len() {
        return Ok(header);
    }
    get_descriptor(ep0, desc_type, desc_index, 0, total)
}

impl Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("descriptor", &self.descriptor)
            .field("mode", &self.mode)
            .field("configurations", &self.configurations)
            .field("active", &self.active)
            .field("bos", &self.bos)
            .finish()
    }
}

impl Display for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = &self.descriptor;
        writeln!(f, "Device {:04x}:{:04x}", d.vendor_id(), d.product_id())?;
        writeln!(f, "  USB version: {:x}.{:02x}", d.usb_version() >> 8, d.usb_version() & 0xFF)?;
        writeln!(
            f,
            "  class: 0x{:02X} subclass: 0x{:02X} protocol: 0x{:02X}",
            d.class(),
            d.subclass(),
            d.protocol()
        )?;
        writeln!(f, "  max packet size 0: {}", d.max_packet_size_0())?;
        writeln!(f, "  configurations: {}", d.num_configurations())?;
        for c in &self.configurations {
            c.fmt_tree(f, 1)?;
        }
        if let Some(bos) = &self.bos {
            bos.fmt_tree(f, 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        endpoint::TransferType,
        platform::{
            mock::{MockIo, Reply},
            Disconnected,
        },
        transfer::request::OFFSET_VALUE,
    };

    use super::*;

    #[rustfmt::skip]
    const DEVICE_USB2: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40,
        0xb4, 0x04, 0x04, 0x10, 0x00, 0x00, 0x01, 0x02,
        0x00, 0x01,
    ];

    #[rustfmt::skip]
    const DEVICE_USB21: [u8; 18] = [
        0x12, 0x01, 0x10, 0x02, 0x00, 0x00, 0x00, 0x40,
        0xb4, 0x04, 0x04, 0x10, 0x00, 0x00, 0x01, 0x02,
        0x00, 0x01,
    ];

    #[rustfmt::skip]
    const DEVICE_USB3: [u8; 18] = [
        0x12, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x09,
        0xb4, 0x04, 0xf1, 0x00, 0x00, 0x00, 0x01, 0x02,
        0x00, 0x01,
    ];

    #[rustfmt::skip]
    const CONFIG_USB2: [u8; 32] = [
        0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
        0x09, 0x04, 0x00, 0x00, 0x02, 0xff, 0x00, 0x00, 0x00,
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00,
    ];

    #[rustfmt::skip]
    const CONFIG_USB3: [u8; 44] = [
        0x09, 0x02, 0x2c, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
        0x09, 0x04, 0x00, 0x00, 0x02, 0xff, 0x00, 0x00, 0x00,
        0x07, 0x05, 0x81, 0x02, 0x00, 0x04, 0x00,
        0x06, 0x30, 0x03, 0x00, 0x00, 0x00,
        0x07, 0x05, 0x02, 0x02, 0x00, 0x04, 0x00,
        0x06, 0x30, 0x03, 0x00, 0x00, 0x00,
    ];

    #[rustfmt::skip]
    const BOS: [u8; 12] = [
        0x05, 0x0f, 0x0c, 0x00, 0x01,
        0x07, 0x10, 0x02, 0x02, 0x00, 0x00, 0x00,
    ];

    fn mock() -> (Arc<MockIo>, Arc<dyn DeviceIo>) {
        let mock = Arc::new(MockIo::new());
        let io: Arc<dyn DeviceIo> = mock.clone();
        (mock, io)
    }

    #[test]
    fn test_usb2_device() {
        let (_, io) = mock();
        let dev = UsbDevice::from_descriptors(io, &DEVICE_USB2, &[CONFIG_USB2], Some(&BOS)).unwrap();

        assert_eq!(dev.decode_mode(), DecodeMode::Standard);
        assert!(dev.bos().is_none());
        assert_eq!(dev.configurations().len(), 1);
        assert_eq!(dev.control_endpoint().max_packet_size(), 64);

        let config = dev.active_configuration().unwrap();
        assert_eq!(config.configuration_value(), 1);
        assert_eq!(config.stop_reason(), None);

        let ep = dev.endpoint_of(0x81).unwrap();
        assert_eq!(ep.transfer_type(), TransferType::Bulk);
        assert_eq!(ep.max_packet_size(), 512);
        assert!(dev.endpoint_of(0x83).is_none());
        assert!(Arc::ptr_eq(dev.endpoint_of(0x80).unwrap(), dev.control_endpoint()));

        let intf = dev.interface(0, 0).unwrap();
        assert!(Arc::ptr_eq(&intf.endpoints()[0], dev.control_endpoint()));
        assert_eq!(intf.endpoints().len(), 3);
    }

    #[test]
    fn test_bos_decoded_from_usb_2_01() {
        let (_, io) = mock();
        let dev = UsbDevice::from_descriptors(io, &DEVICE_USB21, &[CONFIG_USB2], Some(&BOS)).unwrap();
        let bos = dev.bos().unwrap();
        assert!(bos.usb20_extension().unwrap().lpm_supported());
        assert!(bos.superspeed().is_none());
    }

    #[test]
    fn test_superspeed_device() {
        let (_, io) = mock();
        let dev = UsbDevice::from_descriptors(io, &DEVICE_USB3, &[CONFIG_USB3], None).unwrap();
        assert_eq!(dev.decode_mode(), DecodeMode::SuperSpeed);
        assert!(dev.bos().is_none());

        let ep = dev.endpoint_of(0x02).unwrap();
        assert_eq!(ep.companion().unwrap().max_burst, 3);
        assert_eq!(ep.max_packet_size(), 4096);
        assert_eq!(dev.active_configuration().unwrap().bytes_consumed(), 44);
    }

    #[test]
    fn test_forced_standard_mode() {
        let (_, io) = mock();
        let dev = UsbDevice::from_descriptors_with_mode(
            io,
            &DEVICE_USB3,
            &[CONFIG_USB3],
            None,
            DecodeMode::Standard,
        )
        .unwrap();
        let ep = dev.endpoint_of(0x81).unwrap();
        assert!(ep.companion().is_none());
        assert_eq!(ep.max_packet_size(), 1024);
    }

    #[test]
    fn test_invalid_device_descriptor() {
        let (_, io) = mock();
        let err = UsbDevice::from_descriptors(io.clone(), &DEVICE_USB2[..10], &[CONFIG_USB2], None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);

        let mut wrong_type = DEVICE_USB2;
        wrong_type[1] = 0x02;
        assert!(UsbDevice::from_descriptors(io, &wrong_type, &[CONFIG_USB2], None).is_err());
    }

    #[test]
    fn test_undecodable_configuration_skipped() {
        let (_, io) = mock();
        let configs: [&[u8]; 2] = [&CONFIG_USB2[..4], &CONFIG_USB2];
        let dev = UsbDevice::from_descriptors(io, &DEVICE_USB2, &configs, None).unwrap();
        assert_eq!(dev.configurations().len(), 1);
        assert!(dev.active_configuration().is_some());
    }

    #[test]
    fn test_select_configuration() {
        let (_, io) = mock();
        let mut second = CONFIG_USB2;
        second[5] = 2;
        let mut dev =
            UsbDevice::from_descriptors(io, &DEVICE_USB2, &[CONFIG_USB2, second], None).unwrap();
        assert_eq!(dev.active_configuration().unwrap().configuration_value(), 1);
        dev.select_configuration(2).unwrap();
        assert_eq!(dev.active_configuration().unwrap().configuration_value(), 2);
        assert_eq!(
            dev.select_configuration(3).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(Arc::ptr_eq(
            dev.configurations()[0].control_endpoint(),
            dev.configurations()[1].control_endpoint()
        ));
    }

    #[test]
    fn test_open_reads_descriptors() {
        let (mock, io) = mock();
        mock.push(Reply::data(DEVICE_USB21));
        mock.push(Reply::data(&CONFIG_USB2[..9]));
        mock.push(Reply::data(CONFIG_USB2));
        mock.push(Reply::data(&BOS[..5]));
        mock.push(Reply::data(BOS));

        let dev = UsbDevice::open(io).unwrap();
        assert_eq!(dev.device_descriptor().vendor_id(), 0x04b4);
        assert_eq!(dev.configurations().len(), 1);
        assert_eq!(dev.active_configuration().unwrap().interfaces().len(), 1);
        assert!(dev.bos().is_some());

        let submitted = mock.submitted();
        let values: Vec<u16> = submitted
            .iter()
            .map(|s| u16::from_le_bytes([s.header[OFFSET_VALUE], s.header[OFFSET_VALUE + 1]]))
            .collect();
        assert_eq!(values, [0x0100, 0x0200, 0x0200, 0x0f00, 0x0f00]);
        assert!(submitted.iter().all(|s| s.header[0] == 0x80));
    }

    #[test]
    fn test_open_without_handle() {
        let err = UsbDevice::open(Arc::new(Disconnected)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_open_device_descriptor_failure() {
        let (mock, io) = mock();
        mock.push(Reply::failed());
        assert!(UsbDevice::open(io).is_err());
    }

    #[test]
    fn test_string_descriptors() {
        let (mock, io) = mock();
        let dev = UsbDevice::from_descriptors(io, &DEVICE_USB2, &[CONFIG_USB2], None).unwrap();

        mock.push(Reply::data([4, 3, 0x09, 0x04]));
        let langs: Vec<u16> = dev.get_string_descriptor_supported_languages().unwrap().collect();
        assert_eq!(langs, [0x0409]);

        mock.push(Reply::data([8, 3, b'a', 0, b'b', 0, b'c', 0]));
        let s = dev
            .get_string_descriptor(NonZeroU8::new(2).unwrap(), 0x0409)
            .unwrap();
        assert_eq!(s, "abc");

        let last = mock.submitted().pop().unwrap();
        assert_eq!(&last.header[OFFSET_VALUE..OFFSET_VALUE + 4], &[0x02, 0x03, 0x09, 0x04]);

        mock.push(Reply::data([9, 3, b'a', 0]));
        assert_eq!(
            dev.get_string_descriptor(NonZeroU8::new(1).unwrap(), 0x0409),
            Err(GetDescriptorError::InvalidDescriptor)
        );

        mock.push(Reply::status(0xC000_0004, 0));
        assert!(matches!(
            dev.get_string_descriptor(NonZeroU8::new(1).unwrap(), 0x0409),
            Err(GetDescriptorError::Transfer(_))
        ));
    }

    #[test]
    fn test_display() {
        let (_, io) = mock();
        let dev = UsbDevice::from_descriptors(io, &DEVICE_USB21, &[CONFIG_USB2], Some(&BOS)).unwrap();
        let text = dev.to_string();
        assert!(text.starts_with("Device 04b4:1004\n  USB version: 2.10\n"));
        assert!(text.contains("  Configuration 1\n"));
        assert!(text.contains("  BOS\n"));
    }
}
