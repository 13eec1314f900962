//! Configuration decoding.

use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    sync::Arc,
};

use log::{debug, warn};

use crate::{
    descriptors::{ConfigurationDescriptor, DecodeMode, DescriptorCursor, DESCRIPTOR_TYPE_INTERFACE},
    interface::{Interface, InterfaceGroup},
    platform::DeviceIo,
    DescriptorError, Endpoint,
};

/// Maximum number of interface records decoded from one configuration.
pub const MAX_INTERFACES: usize = 255;

/// A decoded configuration: every interface alternate setting, in descriptor
/// order, plus their grouping by interface number.
pub struct Configuration {
    length: u8,
    descriptor_type: u8,
    total_length: u16,
    num_interfaces: u8,
    configuration_value: u8,
    string_index: Option<u8>,
    attributes: u8,
    max_power: u8,
    control: Arc<Endpoint>,
    interfaces: Vec<Interface>,
    groups: Vec<InterfaceGroup>,
    consumed: usize,
    stop_reason: Option<DescriptorError>,
}

impl Configuration {
    /// Decode a configuration descriptor and everything that follows it.
    ///
    /// `buf` holds the full configuration as returned by
    /// `GET_DESCRIPTOR(CONFIGURATION)`. Only a buffer too short for the
    /// configuration record itself is an error. An interface that ends in a
    /// run of unexpected records keeps its own reason and decoding resumes at
    /// the next interface record. Any other malformation stops decoding and
    /// keeps the interfaces decoded so far; the reason is reported by
    /// [`stop_reason`][Self::stop_reason].
    pub fn decode(
        io: &Arc<dyn DeviceIo>,
        control: &Arc<Endpoint>,
        buf: &[u8],
        mode: DecodeMode,
    ) -> Result<Configuration, DescriptorError> {
        let mut cursor = DescriptorCursor::new(buf);
        let (desc, len): (ConfigurationDescriptor, usize) = cursor.read()?;
        cursor.advance(len)?;

        let mut config = Configuration {
            length: desc.length(),
            descriptor_type: desc.descriptor_type(),
            total_length: desc.total_length(),
            num_interfaces: desc.num_interfaces(),
            configuration_value: desc.configuration_value(),
            string_index: Some(desc.string_index()).filter(|&i| i != 0),
            attributes: desc.attributes(),
            max_power: desc.max_power(),
            control: control.clone(),
            interfaces: Vec::new(),
            groups: Vec::new(),
            consumed: len,
            stop_reason: None,
        };

        if let Err(e) = config.decode_interfaces(io, &mut cursor, mode) {
            warn!(
                "configuration {}: stopped after {} interfaces at offset {}: {e}",
                config.configuration_value,
                config.interfaces.len(),
                cursor.offset()
            );
            config.stop_reason = Some(e);
        }

        config.group_alternates();

        debug!(
            "configuration {}: {} interface records in {} groups, {} of {} bytes",
            config.configuration_value,
            config.interfaces.len(),
            config.groups.len(),
            config.consumed,
            config.total_length
        );

        Ok(config)
    }

    fn decode_interfaces(
        &mut self,
        io: &Arc<dyn DeviceIo>,
        cursor: &mut DescriptorCursor<'_>,
        mode: DecodeMode,
    ) -> Result<(), DescriptorError> {
        let total = self.total_length as usize;

        while self.consumed < total && self.interfaces.len() < MAX_INTERFACES {
            let ty = cursor.peek_type()?;
            if ty != DESCRIPTOR_TYPE_INTERFACE {
                let len = cursor.skip()?;
                debug!(
                    "configuration {}: skipping descriptor type 0x{ty:02X} ({len} bytes)",
                    self.configuration_value
                );
                self.consumed += len;
                continue;
            }

            let interface = Interface::decode(io, &self.control, cursor, mode)?;
            let len = interface.consumed_length();
            let stop = interface.stop_reason();
            self.interfaces.push(interface);
            match stop {
                // The interface keeps its own reason; the records it left
                // behind are skipped until the next interface.
                None | Some(DescriptorError::UnexpectedDescriptorRun { .. }) => {}
                Some(e) => return Err(e),
            }
            cursor.advance(len)?;
            self.consumed += len;
        }

        if self.interfaces.len() >= MAX_INTERFACES && self.consumed < total {
            warn!(
                "configuration {}: interface limit of {MAX_INTERFACES} reached",
                self.configuration_value
            );
        }

        if self.consumed > total {
            return Err(DescriptorError::MalformedTotalLength {
                declared: total,
                consumed: self.consumed,
            });
        }

        Ok(())
    }

    fn group_alternates(&mut self) {
        let mut counts: HashMap<u8, u8> = HashMap::new();
        for interface in &self.interfaces {
            let n = counts.entry(interface.interface_number()).or_default();
            *n = n.saturating_add(1);
        }

        for (i, interface) in self.interfaces.iter_mut().enumerate() {
            let number = interface.interface_number();
            interface.alternate_count = counts[&number];

            match self.groups.iter_mut().find(|g| g.interface_number() == number) {
                Some(group) => group.push(i),
                None => {
                    let mut group = InterfaceGroup::new(number);
                    group.push(i);
                    self.groups.push(group);
                }
            }
        }

        if self.groups.len() > self.num_interfaces as usize {
            warn!(
                "configuration {}: {} interface numbers found but bNumInterfaces is {}",
                self.configuration_value,
                self.groups.len(),
                self.num_interfaces
            );
        }
    }

    /// `bLength` of the configuration descriptor.
    pub fn descriptor_length(&self) -> u8 {
        self.length
    }

    /// `bDescriptorType` of the configuration descriptor.
    pub fn descriptor_type(&self) -> u8 {
        self.descriptor_type
    }

    /// `wTotalLength`: declared length of the configuration and all its
    /// descendant descriptors.
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    /// `bNumInterfaces`.
    pub fn num_interfaces(&self) -> u8 {
        self.num_interfaces
    }

    /// `bConfigurationValue`.
    pub fn configuration_value(&self) -> u8 {
        self.configuration_value
    }

    /// `iConfiguration`, or `None` if the configuration has no description string.
    pub fn string_index(&self) -> Option<u8> {
        self.string_index
    }

    /// `bmAttributes`.
    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Bit 6 of `bmAttributes`.
    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    /// Bit 5 of `bmAttributes`.
    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }

    /// `bMaxPower`, in device-specific units.
    pub fn max_power(&self) -> u8 {
        self.max_power
    }

    /// The control endpoint shared by all interfaces.
    pub fn control_endpoint(&self) -> &Arc<Endpoint> {
        &self.control
    }

    /// Every decoded interface record, alternate settings included, in
    /// descriptor order.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Interfaces grouped by interface number, in order of first appearance.
    pub fn groups(&self) -> &[InterfaceGroup] {
        &self.groups
    }

    /// Find an interface by number and alternate setting.
    pub fn interface(&self, number: u8, alternate_setting: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| {
            i.interface_number() == number && i.alternate_setting() == alternate_setting
        })
    }

    /// Find an endpoint by address among the first alternate setting of each
    /// interface.
    pub fn endpoint(&self, address: u8) -> Option<&Arc<Endpoint>> {
        if address & 0x7F == 0 {
            return Some(&self.control);
        }
        self.groups
            .iter()
            .filter_map(|g| g.alternates(&self.interfaces).next())
            .find_map(|i| i.endpoint(address))
    }

    /// Bytes decoded, starting with the configuration record.
    pub fn bytes_consumed(&self) -> usize {
        self.consumed
    }

    /// Why decoding stopped before reaching `wTotalLength`, if it did.
    pub fn stop_reason(&self) -> Option<DescriptorError> {
        self.stop_reason
    }
}

impl Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("configuration_value", &self.configuration_value)
            .field("total_length", &self.total_length)
            .field("num_interfaces", &self.num_interfaces)
            .field("attributes", &format_args!("0x{:02X}", self.attributes))
            .field("max_power", &self.max_power)
            .field("string_index", &self.string_index)
            .field("interfaces", &self.interfaces)
            .field("stop_reason", &self.stop_reason)
            .finish()
    }
}

impl Configuration {
    pub(crate) fn fmt_tree(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        indent: usize,
    ) -> std::fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(f, "{pad}Configuration {}", self.configuration_value)?;
        if let Some(i) = self.string_index {
            writeln!(f, "{pad}  string index: {i}")?;
        }
        writeln!(f, "{pad}  interfaces: {}", self.num_interfaces)?;
        writeln!(f, "{pad}  attributes: 0x{:02X}", self.attributes)?;
        writeln!(f, "{pad}  max power: {}", self.max_power)?;
        writeln!(f, "{pad}  total length: {}", self.total_length)?;
        writeln!(f, "{pad}  descriptor type: {}", self.descriptor_type)?;
        writeln!(f, "{pad}  descriptor length: {}", self.length)?;
        writeln!(f, "{pad}  Control endpoint (0x00)")?;
        for group in &self.groups {
            writeln!(
                f,
                "{pad}  Interface {} ({} alternate settings)",
                group.interface_number(),
                group.len()
            )?;
            for interface in group.alternates(&self.interfaces) {
                interface.fmt_tree(f, indent + 2)?;
            }
        }
        if let Some(e) = &self.stop_reason {
            writeln!(f, "{pad}  decoding stopped: {e}")?;
        }
        Ok(())
    }
}

impl Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_tree(f, 0)
    }
}
