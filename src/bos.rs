//! Binary Object Store decoding.
//!
//! The BOS descriptor is requested separately from the configurations, on
//! devices reporting `bcdUSB` 2.01 or later, and chains a list of device
//! capability descriptors.

use std::fmt::{Debug, Display};

use log::{debug, warn};

use crate::{
    descriptors::{
        BosDescriptor, CapabilityHeader, ContainerIdDescriptor, DescriptorCursor,
        SuperSpeedCapabilityDescriptor, Usb20ExtensionDescriptor, CAPABILITY_TYPE_CONTAINER_ID,
        CAPABILITY_TYPE_SUPERSPEED, CAPABILITY_TYPE_USB20_EXTENSION, CONTAINER_ID_SIZE,
    },
    DescriptorError,
};

/// USB 2.0 Extension capability.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Usb20Extension {
    pub length: u8,
    pub descriptor_type: u8,
    pub capability_type: u8,

    /// `bmAttributes`. Bit 1 is set if Link Power Management is supported.
    pub attributes: u32,
}

impl Usb20Extension {
    /// Link Power Management support.
    pub fn lpm_supported(&self) -> bool {
        self.attributes & 0x02 != 0
    }
}

/// SuperSpeed USB Device capability.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SuperSpeedCapability {
    pub length: u8,
    pub descriptor_type: u8,
    pub capability_type: u8,

    /// `bmAttributes`. Bit 1 is set if Latency Tolerance Messages are supported.
    pub attributes: u8,

    /// `wSpeedsSupported`: bit 0 low, 1 full, 2 high, 3 SuperSpeed.
    pub speeds_supported: u16,

    /// `bFunctionalitySupport`: lowest speed with full functionality.
    pub functionality_support: u8,

    /// `bU1DevExitLat`, in microseconds.
    pub u1_exit_latency: u8,

    /// `wU2DevExitLat`, in microseconds.
    pub u2_exit_latency: u16,
}

/// Container ID capability.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ContainerId {
    pub length: u8,
    pub descriptor_type: u8,
    pub capability_type: u8,
    pub reserved: u8,

    /// UUID identifying the device instance across all its USB connections.
    pub container_id: [u8; CONTAINER_ID_SIZE],
}

impl Debug for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerId")
            .field("length", &self.length)
            .field("descriptor_type", &self.descriptor_type)
            .field("capability_type", &self.capability_type)
            .field("container_id", &format_args!("{}", self.uuid()))
            .finish()
    }
}

impl ContainerId {
    /// The container ID formatted as a UUID string.
    pub fn uuid(&self) -> String {
        let b = &self.container_id;
        let hex = |r: std::ops::Range<usize>| -> String {
            b[r].iter().map(|x| format!("{x:02x}")).collect()
        };
        format!(
            "{}-{}-{}-{}-{}",
            hex(0..4),
            hex(4..6),
            hex(6..8),
            hex(8..10),
            hex(10..16)
        )
    }
}

/// One device capability record, in the order it appeared.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capability {
    Usb20Extension(Usb20Extension),
    SuperSpeed(SuperSpeedCapability),
    ContainerId(ContainerId),

    /// A capability type this crate doesn't decode. It was skipped by its
    /// declared length.
    Invalid {
        capability_type: u8,
        length: u8,
    },
}

/// A decoded Binary Object Store.
pub struct BosCapabilities {
    length: u8,
    descriptor_type: u8,
    total_length: u16,
    num_device_caps: u8,
    usb20_extension: Option<Usb20Extension>,
    superspeed: Option<SuperSpeedCapability>,
    container_id: Option<ContainerId>,
    capabilities: Vec<Capability>,
    stop_reason: Option<DescriptorError>,
}

impl BosCapabilities {
    /// Decode a BOS descriptor and its device capabilities.
    ///
    /// Only a buffer too short for the BOS header is an error. Decoding stops
    /// at the declared total length, or early on a malformed capability; the
    /// capabilities decoded up to that point are kept.
    pub fn decode(buf: &[u8]) -> Result<BosCapabilities, DescriptorError> {
        let mut cursor = DescriptorCursor::new(buf);
        let (desc, len): (BosDescriptor, usize) = cursor.read()?;

        let mut bos = BosCapabilities {
            length: desc.length(),
            descriptor_type: desc.descriptor_type(),
            total_length: desc.total_length(),
            num_device_caps: desc.num_device_caps(),
            usb20_extension: None,
            superspeed: None,
            container_id: None,
            capabilities: Vec::new(),
            stop_reason: None,
        };

        if let Err(e) = bos.decode_capabilities(&mut cursor, len) {
            warn!(
                "BOS: stopped after {} of {} capabilities: {e}",
                bos.capabilities.len(),
                bos.num_device_caps
            );
            bos.stop_reason = Some(e);
        }

        debug!(
            "BOS: {} capabilities in {} bytes",
            bos.capabilities.len(),
            bos.total_length
        );

        Ok(bos)
    }

    fn decode_capabilities(
        &mut self,
        cursor: &mut DescriptorCursor<'_>,
        header_len: usize,
    ) -> Result<(), DescriptorError> {
        let total = self.total_length as usize;
        let mismatch = |consumed| DescriptorError::MalformedTotalLength {
            declared: total,
            consumed,
        };

        let mut consumed = header_len;
        if consumed > total {
            return Err(mismatch(consumed));
        }
        cursor.advance(header_len)?;

        for _ in 0..self.num_device_caps {
            if consumed == total {
                return Err(mismatch(consumed));
            }

            let (header, len): (CapabilityHeader, usize) = cursor.read()?;
            let capability = match header.capability_type() {
                CAPABILITY_TYPE_USB20_EXTENSION => {
                    let (d, _): (Usb20ExtensionDescriptor, _) = cursor.read()?;
                    let cap = Usb20Extension {
                        length: d.length(),
                        descriptor_type: d.descriptor_type(),
                        capability_type: d.capability_type(),
                        attributes: d.attributes(),
                    };
                    if self.usb20_extension.replace(cap).is_some() {
                        warn!("BOS: duplicate USB 2.0 Extension capability");
                    }
                    Capability::Usb20Extension(cap)
                }
                CAPABILITY_TYPE_SUPERSPEED => {
                    let (d, _): (SuperSpeedCapabilityDescriptor, _) = cursor.read()?;
                    let cap = SuperSpeedCapability {
                        length: d.length(),
                        descriptor_type: d.descriptor_type(),
                        capability_type: d.capability_type(),
                        attributes: d.attributes(),
                        speeds_supported: d.speeds_supported(),
                        functionality_support: d.functionality_support(),
                        u1_exit_latency: d.u1_exit_latency(),
                        u2_exit_latency: d.u2_exit_latency(),
                    };
                    if self.superspeed.replace(cap).is_some() {
                        warn!("BOS: duplicate SuperSpeed capability");
                    }
                    Capability::SuperSpeed(cap)
                }
                CAPABILITY_TYPE_CONTAINER_ID => {
                    let (d, _): (ContainerIdDescriptor, _) = cursor.read()?;
                    let cap = ContainerId {
                        length: d.length(),
                        descriptor_type: d.descriptor_type(),
                        capability_type: d.capability_type(),
                        reserved: d.reserved(),
                        container_id: d.container_id(),
                    };
                    if self.container_id.replace(cap).is_some() {
                        warn!("BOS: duplicate Container ID capability");
                    }
                    Capability::ContainerId(cap)
                }
                other => {
                    warn!(
                        "BOS: unknown device capability type 0x{other:02X} ({len} bytes)",
                    );
                    Capability::Invalid {
                        capability_type: other,
                        length: header.length(),
                    }
                }
            };

            cursor.advance(len)?;
            self.capabilities.push(capability);
            consumed += len;
            if consumed > total {
                return Err(mismatch(consumed));
            }
        }

        Ok(())
    }

    /// `bLength` of the BOS descriptor.
    pub fn descriptor_length(&self) -> u8 {
        self.length
    }

    /// `bDescriptorType` of the BOS descriptor.
    pub fn descriptor_type(&self) -> u8 {
        self.descriptor_type
    }

    /// `wTotalLength`, including all device capabilities.
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    /// `bNumDeviceCaps`.
    pub fn num_device_caps(&self) -> u8 {
        self.num_device_caps
    }

    /// The USB 2.0 Extension capability, if present.
    pub fn usb20_extension(&self) -> Option<&Usb20Extension> {
        self.usb20_extension.as_ref()
    }

    /// The SuperSpeed USB Device capability, if present.
    pub fn superspeed(&self) -> Option<&SuperSpeedCapability> {
        self.superspeed.as_ref()
    }

    /// The Container ID capability, if present.
    pub fn container_id(&self) -> Option<&ContainerId> {
        self.container_id.as_ref()
    }

    /// Every capability record decoded, in order, including placeholders for
    /// unknown types.
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Why decoding stopped early, if it did.
    pub fn stop_reason(&self) -> Option<DescriptorError> {
        self.stop_reason
    }

    pub(crate) fn fmt_tree(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        indent: usize,
    ) -> std::fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(f, "{pad}BOS")?;
        writeln!(f, "{pad}  device capabilities: {}", self.num_device_caps)?;
        writeln!(f, "{pad}  descriptor type: {}", self.descriptor_type)?;
        writeln!(f, "{pad}  descriptor length: {}", self.length)?;
        writeln!(f, "{pad}  total length: {}", self.total_length)?;
        for cap in &self.capabilities {
            match cap {
                Capability::Usb20Extension(c) => {
                    writeln!(f, "{pad}  USB 2.0 Extension")?;
                    writeln!(f, "{pad}    attributes: 0x{:08X}", c.attributes)?;
                }
                Capability::SuperSpeed(c) => {
                    writeln!(f, "{pad}  SuperSpeed USB Device capability")?;
                    writeln!(f, "{pad}    attributes: 0x{:02X}", c.attributes)?;
                    writeln!(f, "{pad}    speeds supported: 0x{:04X}", c.speeds_supported)?;
                    writeln!(f, "{pad}    functionality support: {}", c.functionality_support)?;
                    writeln!(f, "{pad}    U1 exit latency: {}", c.u1_exit_latency)?;
                    writeln!(f, "{pad}    U2 exit latency: {}", c.u2_exit_latency)?;
                }
                Capability::ContainerId(c) => {
                    writeln!(f, "{pad}  Container ID")?;
                    writeln!(f, "{pad}    {}", c.uuid())?;
                }
                Capability::Invalid {
                    capability_type, ..
                } => {
                    writeln!(
                        f,
                        "{pad}  invalid device capability (type 0x{capability_type:02X})"
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl Debug for BosCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BosCapabilities")
            .field("total_length", &self.total_length)
            .field("num_device_caps", &self.num_device_caps)
            .field("capabilities", &self.capabilities)
            .field("stop_reason", &self.stop_reason)
            .finish()
    }
}

impl Display for BosCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_tree(f, 0)
    }
}
