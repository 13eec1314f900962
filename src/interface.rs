//! Interface decoding.

use std::{
    fmt::{Debug, Display},
    sync::Arc,
};

use log::warn;

use crate::{
    descriptors::{
        DecodeMode, DescriptorCursor, EndpointDescriptor, InterfaceDescriptor,
        SuperSpeedCompanionDescriptor, DESCRIPTOR_TYPE_ENDPOINT, DESCRIPTOR_TYPE_INTERFACE,
        DESCRIPTOR_TYPE_SUPERSPEED_COMPANION,
    },
    endpoint::TransferType,
    platform::DeviceIo,
    DescriptorError, Endpoint,
};

/// Number of unrecognized records tolerated between an interface and its
/// endpoints before decoding of that interface gives up.
pub const MAX_UNEXPECTED_DESCRIPTORS: usize = 12;

/// One alternate setting of an interface, with its endpoints.
///
/// Index 0 of [`endpoints`][Self::endpoints] is always the device's shared
/// control endpoint; the endpoints of the alternate setting follow in
/// descriptor order.
pub struct Interface {
    length: u8,
    descriptor_type: u8,
    interface_number: u8,
    alternate_setting: u8,
    num_endpoints: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    string_index: Option<u8>,
    endpoints: Vec<Arc<Endpoint>>,
    consumed: usize,
    pub(crate) alternate_count: u8,
    stop_reason: Option<DescriptorError>,
}

impl Interface {
    /// Decode the interface record at the cursor's offset and the endpoint
    /// records that follow it.
    ///
    /// Errors reading the interface record itself are returned. Errors in the
    /// endpoint records end decoding of this interface; the endpoints read so
    /// far are kept and the error is available from
    /// [`stop_reason`][Self::stop_reason].
    pub(crate) fn decode(
        io: &Arc<dyn DeviceIo>,
        control: &Arc<Endpoint>,
        cursor: &DescriptorCursor<'_>,
        mode: DecodeMode,
    ) -> Result<Interface, DescriptorError> {
        let mut cursor = cursor.clone();
        let (desc, len): (InterfaceDescriptor, usize) = cursor.read()?;
        debug_assert_eq!(desc.descriptor_type(), DESCRIPTOR_TYPE_INTERFACE);
        cursor.advance(len)?;

        let mut interface = Interface {
            length: desc.length(),
            descriptor_type: desc.descriptor_type(),
            interface_number: desc.interface_number(),
            alternate_setting: desc.alternate_setting(),
            num_endpoints: desc.num_endpoints(),
            class: desc.class(),
            subclass: desc.subclass(),
            protocol: desc.protocol(),
            string_index: Some(desc.string_index()).filter(|&i| i != 0),
            endpoints: Vec::with_capacity(desc.num_endpoints() as usize + 1),
            consumed: len,
            alternate_count: 0,
            stop_reason: None,
        };
        interface.endpoints.push(control.clone());

        if let Err(e) = interface.decode_endpoints(io, control, &mut cursor, mode) {
            warn!(
                "interface {} alt {}: stopped after {} of {} endpoints: {e}",
                interface.interface_number,
                interface.alternate_setting,
                interface.endpoints.len() - 1,
                interface.num_endpoints
            );
            interface.stop_reason = Some(e);
        }

        Ok(interface)
    }

    fn decode_endpoints(
        &mut self,
        io: &Arc<dyn DeviceIo>,
        control: &Arc<Endpoint>,
        cursor: &mut DescriptorCursor<'_>,
        mode: DecodeMode,
    ) -> Result<(), DescriptorError> {
        let mut unexpected = 0;

        while self.endpoints.len() <= self.num_endpoints as usize {
            let ty = cursor.peek_type()?;
            if ty != DESCRIPTOR_TYPE_ENDPOINT {
                unexpected += 1;
                if unexpected >= MAX_UNEXPECTED_DESCRIPTORS {
                    return Err(DescriptorError::UnexpectedDescriptorRun {
                        interface_number: self.interface_number,
                        skipped: unexpected - 1,
                    });
                }
                let offset = cursor.offset();
                let len = cursor.skip()?;
                warn!(
                    "interface {}: skipping descriptor type 0x{ty:02X} ({len} bytes) at offset {offset}",
                    self.interface_number
                );
                self.consumed += len;
                continue;
            }

            let (desc, len): (EndpointDescriptor, usize) = cursor.read()?;
            cursor.advance(len)?;
            self.consumed += len;

            let companion = if mode == DecodeMode::SuperSpeed
                && cursor.peek_type().ok() == Some(DESCRIPTOR_TYPE_SUPERSPEED_COMPANION)
            {
                let (c, len): (SuperSpeedCompanionDescriptor, usize) = cursor.read()?;
                cursor.advance(len)?;
                self.consumed += len;
                Some(c)
            } else {
                None
            };

            let endpoint = match TransferType::from_attributes(desc.attributes()) {
                TransferType::Control => control.clone(),
                _ => Arc::new(Endpoint::from_descriptor(
                    io.clone(),
                    &desc,
                    companion.as_ref(),
                )),
            };
            self.endpoints.push(endpoint);
        }

        Ok(())
    }

    /// `bLength` of the interface descriptor.
    pub fn descriptor_length(&self) -> u8 {
        self.length
    }

    /// `bDescriptorType` of the interface descriptor.
    pub fn descriptor_type(&self) -> u8 {
        self.descriptor_type
    }

    /// `bInterfaceNumber`.
    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    /// `bAlternateSetting`.
    pub fn alternate_setting(&self) -> u8 {
        self.alternate_setting
    }

    /// `bNumEndpoints`: number of endpoints declared, not counting the
    /// control endpoint.
    pub fn num_endpoints(&self) -> u8 {
        self.num_endpoints
    }

    /// `bInterfaceClass`.
    pub fn class(&self) -> u8 {
        self.class
    }

    /// `bInterfaceSubClass`.
    pub fn subclass(&self) -> u8 {
        self.subclass
    }

    /// `bInterfaceProtocol`.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// `iInterface`, or `None` if the interface has no description string.
    pub fn string_index(&self) -> Option<u8> {
        self.string_index
    }

    /// All endpoints. Index 0 is the shared control endpoint.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Endpoints of this alternate setting, without the control endpoint.
    pub fn data_endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints[1..]
    }

    /// Find the endpoint with address `address`.
    pub fn endpoint(&self, address: u8) -> Option<&Arc<Endpoint>> {
        self.data_endpoints()
            .iter()
            .find(|ep| ep.address() == address)
    }

    /// Bytes of descriptors consumed, including skipped class-specific records.
    pub fn consumed_length(&self) -> usize {
        self.consumed
    }

    /// Number of alternate settings in the configuration with the same
    /// interface number, this one included.
    pub fn alternate_count(&self) -> u8 {
        self.alternate_count
    }

    /// Why endpoint decoding stopped early, if it did.
    pub fn stop_reason(&self) -> Option<DescriptorError> {
        self.stop_reason
    }

    pub(crate) fn fmt_tree(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        indent: usize,
    ) -> std::fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(
            f,
            "{pad}Interface {} alternate setting {}",
            self.interface_number, self.alternate_setting
        )?;
        writeln!(
            f,
            "{pad}  class 0x{:02X} subclass 0x{:02X} protocol 0x{:02X}",
            self.class, self.subclass, self.protocol
        )?;
        if let Some(i) = self.string_index {
            writeln!(f, "{pad}  string index: {i}")?;
        }
        writeln!(f, "{pad}  endpoints: {}", self.num_endpoints)?;
        writeln!(f, "{pad}  descriptor type: {}", self.descriptor_type)?;
        writeln!(f, "{pad}  descriptor length: {}", self.length)?;
        for ep in self.data_endpoints() {
            for line in ep.to_string().lines() {
                writeln!(f, "{pad}  {line}")?;
            }
        }
        Ok(())
    }
}

impl Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("interface_number", &self.interface_number)
            .field("alternate_setting", &self.alternate_setting)
            .field("num_endpoints", &self.num_endpoints)
            .field("class", &format_args!("0x{:02X}", self.class))
            .field("subclass", &format_args!("0x{:02X}", self.subclass))
            .field("protocol", &format_args!("0x{:02X}", self.protocol))
            .field("string_index", &self.string_index)
            .field("endpoints", &self.data_endpoints())
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_tree(f, 0)
    }
}

/// All alternate settings of one interface number, in descriptor order.
#[derive(Debug)]
pub struct InterfaceGroup {
    interface_number: u8,
    alternates: Vec<usize>,
}

impl InterfaceGroup {
    pub(crate) fn new(interface_number: u8) -> InterfaceGroup {
        InterfaceGroup {
            interface_number,
            alternates: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, index: usize) {
        self.alternates.push(index);
    }

    /// `bInterfaceNumber` shared by the alternate settings.
    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    /// Number of alternate settings.
    pub fn len(&self) -> usize {
        self.alternates.len()
    }

    /// `true` if the group holds no alternate settings.
    pub fn is_empty(&self) -> bool {
        self.alternates.is_empty()
    }

    /// Indexes of the alternate settings into the configuration's flat
    /// interface list.
    pub fn indexes(&self) -> &[usize] {
        &self.alternates
    }

    /// The alternate settings, resolved against the configuration's flat
    /// interface list.
    pub fn alternates<'a>(
        &'a self,
        interfaces: &'a [Interface],
    ) -> impl Iterator<Item = &'a Interface> + 'a {
        self.alternates.iter().filter_map(|&i| interfaces.get(i))
    }
}

#[cfg(test)]
mod tests {
    use crate::platform::mock::MockIo;

    use super::*;

    fn setup() -> (Arc<dyn DeviceIo>, Arc<Endpoint>) {
        let io: Arc<dyn DeviceIo> = Arc::new(MockIo::new());
        let control = Arc::new(Endpoint::control(io.clone(), 64));
        (io, control)
    }

    #[test]
    #[rustfmt::skip]
    fn test_hid_descriptor_skipped() {
        let (io, control) = setup();
        let buf = [
            0x09, 0x04, 0x00, 0x00, 0x02, 0x03, 0x00, 0x00, 0x05,
            0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x22, 0x00,
            0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x01,
            0x07, 0x05, 0x01, 0x03, 0x40, 0x00, 0x01,
        ];
        let c = DescriptorCursor::new(&buf);
        let intf = Interface::decode(&io, &control, &c, DecodeMode::Standard).unwrap();

        assert_eq!(intf.interface_number(), 0);
        assert_eq!(intf.class(), 3);
        assert_eq!(intf.string_index(), Some(5));
        assert_eq!(intf.endpoints().len(), 3);
        assert!(Arc::ptr_eq(&intf.endpoints()[0], &control));
        assert_eq!(intf.endpoints()[1].address(), 0x81);
        assert_eq!(intf.endpoints()[1].transfer_type(), TransferType::Interrupt);
        assert_eq!(intf.endpoints()[2].address(), 0x01);
        assert_eq!(intf.consumed_length(), buf.len());
        assert_eq!(intf.stop_reason(), None);
        assert_eq!(intf.endpoint(0x01).map(|e| e.max_packet_size()), Some(64));
    }

    #[test]
    #[rustfmt::skip]
    fn test_superspeed_companion() {
        let (io, control) = setup();
        let buf = [
            0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
            0x07, 0x05, 0x81, 0x02, 0x00, 0x04, 0x00,
            0x06, 0x30, 0x0F, 0x00, 0x00, 0x00,
            0x07, 0x05, 0x02, 0x02, 0x00, 0x04, 0x00,
            0x06, 0x30, 0x03, 0x00, 0x00, 0x00,
        ];
        let c = DescriptorCursor::new(&buf);

        let intf = Interface::decode(&io, &control, &c, DecodeMode::SuperSpeed).unwrap();
        assert_eq!(intf.consumed_length(), buf.len());
        assert_eq!(intf.endpoints()[1].max_packet_size(), 16 * 1024);
        assert_eq!(intf.endpoints()[2].max_packet_size(), 4 * 1024);
        assert_eq!(intf.endpoints()[1].companion().map(|c| c.max_burst), Some(15));

        // In standard mode the companions are unexpected records.
        let intf = Interface::decode(&io, &control, &c, DecodeMode::Standard).unwrap();
        assert_eq!(intf.consumed_length(), buf.len() - 6);
        assert_eq!(intf.endpoints()[1].max_packet_size(), 1024);
        assert!(intf.endpoints()[1].companion().is_none());
        assert_eq!(intf.endpoints()[2].max_packet_size(), 1024);
    }

    #[test]
    #[rustfmt::skip]
    fn test_control_type_endpoint_uses_shared() {
        let (io, control) = setup();
        let buf = [
            0x09, 0x04, 0x01, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00,
            0x07, 0x05, 0x00, 0x00, 0x40, 0x00, 0x00,
        ];
        let intf = Interface::decode(&io, &control, &DescriptorCursor::new(&buf), DecodeMode::Standard)
            .unwrap();
        assert_eq!(intf.endpoints().len(), 2);
        assert!(Arc::ptr_eq(&intf.endpoints()[1], &control));
    }

    #[test]
    fn test_unexpected_run() {
        let (io, control) = setup();
        let mut buf = vec![0x09, 0x04, 0x02, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00];
        for _ in 0..MAX_UNEXPECTED_DESCRIPTORS {
            buf.extend_from_slice(&[0x03, 0x24, 0x00]);
        }
        buf.extend_from_slice(&[0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00]);

        let intf = Interface::decode(
            &io,
            &control,
            &DescriptorCursor::new(&buf),
            DecodeMode::Standard,
        )
        .unwrap();
        assert_eq!(
            intf.stop_reason(),
            Some(DescriptorError::UnexpectedDescriptorRun {
                interface_number: 2,
                skipped: MAX_UNEXPECTED_DESCRIPTORS - 1
            })
        );
        assert_eq!(intf.endpoints().len(), 1);
        assert_eq!(intf.consumed_length(), 9 + 3 * (MAX_UNEXPECTED_DESCRIPTORS - 1));

        // One fewer is tolerated.
        let buf = [&buf[..9], &buf[12..]].concat();
        let intf = Interface::decode(
            &io,
            &control,
            &DescriptorCursor::new(&buf),
            DecodeMode::Standard,
        )
        .unwrap();
        assert_eq!(intf.stop_reason(), None);
        assert_eq!(intf.endpoints().len(), 2);
    }

    #[test]
    #[rustfmt::skip]
    fn test_truncated() {
        let (io, control) = setup();
        let buf = [
            0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
            0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
            0x07, 0x05, 0x02,
        ];
        let intf = Interface::decode(&io, &control, &DescriptorCursor::new(&buf), DecodeMode::Standard)
            .unwrap();
        assert_eq!(intf.endpoints().len(), 2);
        assert!(matches!(intf.stop_reason(), Some(DescriptorError::OutOfBounds { offset: 16, .. })));

        assert!(Interface::decode(&io, &control, &DescriptorCursor::new(&buf[..5]), DecodeMode::Standard).is_err());
    }

    #[test]
    #[rustfmt::skip]
    fn test_zero_length_record() {
        let (io, control) = setup();
        let buf = [
            0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00,
            0x00, 0x24, 0x00, 0x00,
        ];
        let intf = Interface::decode(&io, &control, &DescriptorCursor::new(&buf), DecodeMode::Standard)
            .unwrap();
        assert_eq!(
            intf.stop_reason(),
            Some(DescriptorError::InvalidLength { offset: 9, length: 0 })
        );
    }
}
