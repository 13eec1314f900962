use std::{
    fmt::{Debug, Display},
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::debug;

use crate::{
    descriptors::{
        EndpointDescriptor, SuperSpeedCompanionDescriptor, DESCRIPTOR_LEN_ENDPOINT,
        DESCRIPTOR_TYPE_ENDPOINT,
    },
    platform::{DeviceIo, IoctlCode},
    transfer::{
        engine::Engine, Completion, ControlSetup, Direction, TransferMode, TransferStatus,
        ISO_PACKET_INFO_LEN,
    },
    Error, ErrorKind, TransferError,
};

/// Default transfer timeout of every endpoint.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Endpoint type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    /// Control endpoint.
    Control = 0,

    /// Isochronous endpoint.
    Isochronous = 1,

    /// Bulk endpoint.
    Bulk = 2,

    /// Interrupt endpoint.
    Interrupt = 3,
}

impl TransferType {
    /// Get the transfer type from the low two bits of `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> TransferType {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

/// Fields of a SuperSpeed Endpoint Companion descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SuperSpeedCompanion {
    /// `bLength` of the companion record.
    pub length: u8,

    /// `bDescriptorType` of the companion record.
    pub descriptor_type: u8,

    /// `bMaxBurst`: packets per burst minus one.
    pub max_burst: u8,

    /// `bmAttributes`: streams for bulk, `Mult` for isochronous.
    pub attributes: u8,

    /// `wBytesPerInterval`.
    pub bytes_per_interval: u16,
}

impl SuperSpeedCompanion {
    pub(crate) fn from_descriptor(d: &SuperSpeedCompanionDescriptor) -> SuperSpeedCompanion {
        SuperSpeedCompanion {
            length: d.length(),
            descriptor_type: d.descriptor_type(),
            max_burst: d.max_burst(),
            attributes: d.attributes(),
            bytes_per_interval: d.bytes_per_interval(),
        }
    }
}

/// Compute the number of bytes an endpoint can move per service interval.
///
/// `max_packet_size_raw` is the `wMaxPacketSize` field: bits 0..10 are the
/// packet size and bits 11..12 the number of additional high-bandwidth
/// transactions. A SuperSpeed companion multiplies it by the burst size,
/// and for isochronous endpoints by `Mult + 1` as well.
pub fn effective_max_packet_size(
    max_packet_size_raw: u16,
    attributes: u8,
    companion: Option<&SuperSpeedCompanion>,
) -> usize {
    let transactions = (((max_packet_size_raw & 0x1800) >> 11) + 1) as usize;
    let mut size = (max_packet_size_raw & 0x07FF) as usize * transactions;
    if let Some(c) = companion {
        size *= c.max_burst as usize + 1;
        if TransferType::from_attributes(attributes) == TransferType::Isochronous {
            size *= (c.attributes & 0x03) as usize + 1;
        }
    }
    size
}

/// Kind-specific state of an endpoint.
pub enum EndpointKind {
    /// The default control pipe. Holds the setup fields of the next request.
    Control { setup: Mutex<ControlSetup> },

    /// Bulk endpoint.
    Bulk,

    /// Interrupt endpoint.
    Interrupt,

    /// Isochronous endpoint.
    Isochronous,
}

impl EndpointKind {
    fn for_type(ty: TransferType) -> EndpointKind {
        match ty {
            TransferType::Control => EndpointKind::Control {
                setup: Mutex::new(ControlSetup::default()),
            },
            TransferType::Isochronous => EndpointKind::Isochronous,
            TransferType::Bulk => EndpointKind::Bulk,
            TransferType::Interrupt => EndpointKind::Interrupt,
        }
    }

    /// The transfer type this kind corresponds to.
    pub fn transfer_type(&self) -> TransferType {
        match self {
            EndpointKind::Control { .. } => TransferType::Control,
            EndpointKind::Bulk => TransferType::Bulk,
            EndpointKind::Interrupt => TransferType::Interrupt,
            EndpointKind::Isochronous => TransferType::Isochronous,
        }
    }
}

impl Debug for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Control { setup } => f
                .debug_struct("Control")
                .field("setup", &*setup.lock().unwrap())
                .finish(),
            EndpointKind::Bulk => write!(f, "Bulk"),
            EndpointKind::Interrupt => write!(f, "Interrupt"),
            EndpointKind::Isochronous => write!(f, "Isochronous"),
        }
    }
}

/// Outcome of the most recent transfer on an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LastStatus {
    /// USBD status reported by the driver.
    pub usbd_status: u32,

    /// NT status reported by the driver.
    pub nt_status: u32,

    /// Bytes moved by the transfer.
    pub bytes_transferred: usize,

    /// Why the transfer failed, or `None` if it succeeded.
    pub last_error: Option<TransferError>,
}

/// A USB endpoint of an opened device.
///
/// Built once from its descriptor while decoding a configuration. Every
/// transfer method blocks the calling thread until the request finishes or
/// exceeds [`timeout`][Self::timeout]. Only one request is in
/// flight at a time; calling transfer methods on the same endpoint from
/// several threads at once is not supported.
///
/// The control endpoint is shared by every interface of a device through an
/// `Arc`, so its settings are shared by all of them.
pub struct Endpoint {
    io: Arc<dyn DeviceIo>,
    length: u8,
    descriptor_type: u8,
    address: u8,
    attributes: u8,
    max_packet_size_raw: u16,
    max_packet_size: usize,
    interval: u8,
    companion: Option<SuperSpeedCompanion>,
    kind: EndpointKind,
    timeout_ms: AtomicU32,
    transfer_mode: AtomicU8,
    last_status: Mutex<LastStatus>,
}

impl Endpoint {
    #[allow(clippy::too_many_arguments)]
    fn new(
        io: Arc<dyn DeviceIo>,
        length: u8,
        descriptor_type: u8,
        address: u8,
        attributes: u8,
        max_packet_size_raw: u16,
        interval: u8,
        companion: Option<SuperSpeedCompanion>,
    ) -> Endpoint {
        let ty = TransferType::from_attributes(attributes);
        let max_packet_size =
            effective_max_packet_size(max_packet_size_raw, attributes, companion.as_ref());
        Endpoint {
            io,
            length,
            descriptor_type,
            address,
            attributes,
            max_packet_size_raw,
            max_packet_size,
            interval,
            companion,
            kind: EndpointKind::for_type(ty),
            timeout_ms: AtomicU32::new(DEFAULT_TIMEOUT.as_millis() as u32),
            transfer_mode: AtomicU8::new(TransferMode::Direct as u8),
            last_status: Mutex::new(LastStatus::default()),
        }
    }

    /// Build an endpoint from its descriptor and optional SuperSpeed companion.
    pub(crate) fn from_descriptor(
        io: Arc<dyn DeviceIo>,
        desc: &EndpointDescriptor,
        companion: Option<&SuperSpeedCompanionDescriptor>,
    ) -> Endpoint {
        Endpoint::new(
            io,
            desc.length(),
            desc.descriptor_type(),
            desc.address(),
            desc.attributes(),
            desc.max_packet_size_raw(),
            desc.interval(),
            companion.map(SuperSpeedCompanion::from_descriptor),
        )
    }

    /// Build the default control endpoint of a device.
    ///
    /// `max_packet_size` comes from `bMaxPacketSize0` of the device descriptor.
    pub fn control(io: Arc<dyn DeviceIo>, max_packet_size: u8) -> Endpoint {
        Endpoint::new(
            io,
            DESCRIPTOR_LEN_ENDPOINT,
            DESCRIPTOR_TYPE_ENDPOINT,
            0,
            0,
            max_packet_size as u16,
            0,
            None,
        )
    }

    /// `bLength` of the endpoint descriptor.
    pub fn descriptor_length(&self) -> u8 {
        self.length
    }

    /// `bDescriptorType` of the endpoint descriptor.
    pub fn descriptor_type(&self) -> u8 {
        self.descriptor_type
    }

    /// `bEndpointAddress`: the endpoint number plus the direction bit.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Endpoint number, without the direction bit.
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    /// Direction of data transfer.
    ///
    /// For the control endpoint this is the direction of the configured setup.
    pub fn direction(&self) -> Direction {
        match &self.kind {
            EndpointKind::Control { setup } => setup.lock().unwrap().direction,
            _ => Direction::from_address(self.address),
        }
    }

    /// `true` if data moves from the device to the host.
    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    /// `bmAttributes` of the endpoint descriptor.
    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Transfer type from `bmAttributes`.
    pub fn transfer_type(&self) -> TransferType {
        self.kind.transfer_type()
    }

    /// Kind-specific state.
    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    /// Raw `wMaxPacketSize` of the endpoint descriptor.
    pub fn max_packet_size_raw(&self) -> u16 {
        self.max_packet_size_raw
    }

    /// Bytes per service interval, accounting for high-bandwidth transactions
    /// and SuperSpeed bursts.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// `bInterval` of the endpoint descriptor.
    pub fn interval(&self) -> u8 {
        self.interval
    }

    /// SuperSpeed companion fields, if the endpoint had a companion descriptor.
    pub fn companion(&self) -> Option<&SuperSpeedCompanion> {
        self.companion.as_ref()
    }

    /// `false` if the endpoint was built against an invalid device handle.
    pub fn is_valid(&self) -> bool {
        self.io.is_valid()
    }

    /// Time a transfer may take before it is aborted.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed) as u64)
    }

    /// Set the transfer timeout, with millisecond resolution.
    ///
    /// The control endpoint rounds the timeout down to whole seconds, with a
    /// minimum of one second.
    pub fn set_timeout(&self, timeout: Duration) {
        let ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// How data is handed to the driver.
    pub fn transfer_mode(&self) -> TransferMode {
        TransferMode::from_u8(self.transfer_mode.load(Ordering::Relaxed))
    }

    /// Select how data is handed to the driver.
    ///
    /// Control transfers are always buffered and ignore this setting.
    pub fn set_transfer_mode(&self, mode: TransferMode) {
        self.transfer_mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Outcome of the most recent transfer.
    pub fn last_status(&self) -> LastStatus {
        *self.last_status.lock().unwrap()
    }

    /// Current setup fields, if this is a control endpoint.
    pub fn control_setup(&self) -> Option<ControlSetup> {
        match &self.kind {
            EndpointKind::Control { setup } => Some(*setup.lock().unwrap()),
            _ => None,
        }
    }

    /// Replace the setup fields used by the next control transfer.
    ///
    /// Does nothing on non-control endpoints.
    pub fn set_control_setup(&self, new: ControlSetup) {
        match &self.kind {
            EndpointKind::Control { setup } => *setup.lock().unwrap() = new,
            _ => debug!(
                "endpoint 0x{:02X} is not a control endpoint, ignoring setup",
                self.address
            ),
        }
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&*self.io, self.address, self.timeout())
    }

    fn record(&self, completion: Completion) -> Completion {
        *self.last_status.lock().unwrap() = LastStatus {
            usbd_status: completion.usbd_status,
            nt_status: completion.nt_status,
            bytes_transferred: completion.actual_length,
            last_error: completion.error(),
        };
        completion
    }

    /// Transfer `buf` in the endpoint's direction.
    ///
    /// For IN endpoints, received data is written to the start of `buf`; for
    /// OUT endpoints, `buf` is sent. Control endpoints use the configured
    /// [`ControlSetup`], with `wLength` set to the length of `buf`.
    pub fn transfer(&self, buf: &mut [u8]) -> Completion {
        let completion = match &self.kind {
            EndpointKind::Control { setup } => {
                let setup = *setup.lock().unwrap();
                self.engine().control_transfer(&setup, buf)
            }
            EndpointKind::Isochronous => {
                let block = self.packet_block_size(buf.len());
                self.engine()
                    .data_transfer(buf, self.transfer_mode(), Some(block), false)
            }
            EndpointKind::Bulk | EndpointKind::Interrupt => {
                self.engine()
                    .data_transfer(buf, self.transfer_mode(), None, false)
            }
        };
        self.record(completion)
    }

    /// Read into `buf` one packet at a time, stopping at the first short packet.
    ///
    /// Succeeds if any data was received. Only bulk IN endpoints are chunked;
    /// every other endpoint falls back to a single [`transfer`][Self::transfer].
    pub fn transfer_packets(&self, buf: &mut [u8]) -> Completion {
        match &self.kind {
            EndpointKind::Bulk if self.is_in() => {
                let completion = self.engine().packet_transfer(
                    buf,
                    self.max_packet_size,
                    self.transfer_mode(),
                );
                self.record(completion)
            }
            _ => self.transfer(buf),
        }
    }

    /// Isochronous transfer that also returns the per-packet status records.
    pub fn transfer_iso(&self, buf: &mut [u8]) -> Completion {
        if !matches!(self.kind, EndpointKind::Isochronous) {
            debug!(
                "endpoint 0x{:02X} is not isochronous",
                self.address
            );
            return self.record(Completion::without_io(TransferStatus::InvalidArgument));
        }
        let block = self.packet_block_size(buf.len());
        let completion = self
            .engine()
            .data_transfer(buf, self.transfer_mode(), Some(block), true);
        self.record(completion)
    }

    fn control_direction(&self, direction: Direction, buf: &mut [u8]) -> Completion {
        match &self.kind {
            EndpointKind::Control { setup } => {
                let setup = {
                    let mut setup = setup.lock().unwrap();
                    setup.direction = direction;
                    *setup
                };
                let completion = self.engine().control_transfer(&setup, buf);
                self.record(completion)
            }
            _ => {
                debug!(
                    "endpoint 0x{:02X} is not a control endpoint",
                    self.address
                );
                self.record(Completion::without_io(TransferStatus::InvalidArgument))
            }
        }
    }

    /// Set the control direction to IN, then transfer.
    pub fn control_read(&self, buf: &mut [u8]) -> Completion {
        self.control_direction(Direction::In, buf)
    }

    /// Set the control direction to OUT, then transfer.
    pub fn control_write(&self, buf: &mut [u8]) -> Completion {
        self.control_direction(Direction::Out, buf)
    }

    /// Number of packets needed to move `len` bytes.
    pub fn packet_count(&self, len: usize) -> usize {
        if self.max_packet_size == 0 {
            return 0;
        }
        len.div_ceil(self.max_packet_size)
    }

    /// Size of the isochronous packet record block for `len` bytes.
    pub fn packet_block_size(&self, len: usize) -> usize {
        self.packet_count(len) * ISO_PACKET_INFO_LEN
    }

    fn pipe_request(&self, code: IoctlCode) -> Result<(), Error> {
        if !self.is_valid() {
            return Err(Error::new(ErrorKind::InvalidHandle, "device handle is invalid"));
        }
        self.io.ioctl(code, &[self.address], &mut [])?;
        Ok(())
    }

    /// Clear a halt condition on the endpoint.
    pub fn reset(&self) -> Result<(), Error> {
        self.pipe_request(IoctlCode::ResetPipe)
    }

    /// Cancel any request pending on the endpoint.
    pub fn abort(&self) -> Result<(), Error> {
        self.pipe_request(IoctlCode::AbortPipe)
    }

    /// The driver's transfer size for this endpoint, or 0 if it can't be read.
    pub fn transfer_size(&self) -> usize {
        if !self.is_valid() {
            return 0;
        }
        let input = transfer_size_info(self.address, 0);
        let mut output = [0; TRANSFER_SIZE_INFO_LEN];
        match self.io.ioctl(IoctlCode::GetTransferSize, &input, &mut output) {
            Ok(n) if n >= TRANSFER_SIZE_INFO_LEN => {
                u32::from_le_bytes(output[1..5].try_into().unwrap()) as usize
            }
            Ok(n) => {
                debug!("transfer size request returned {n} bytes");
                0
            }
            Err(e) => {
                debug!("transfer size request failed: {e}");
                0
            }
        }
    }

    /// Set the driver's transfer size for this endpoint, rounded up to a
    /// multiple of [`max_packet_size`][Self::max_packet_size].
    ///
    /// Returns the size requested. No request is made if the endpoint's
    /// packet size is zero.
    pub fn set_transfer_size(&self, size: usize) -> Result<usize, Error> {
        if !self.is_valid() {
            return Err(Error::new(ErrorKind::InvalidHandle, "device handle is invalid"));
        }
        if self.max_packet_size == 0 {
            return Ok(0);
        }
        let size = size.div_ceil(self.max_packet_size) * self.max_packet_size;
        let Ok(size32) = u32::try_from(size) else {
            return Err(Error::new(ErrorKind::Other, "transfer size too large"));
        };
        let input = transfer_size_info(self.address, size32);
        self.io
            .ioctl(IoctlCode::SetTransferSize, &input, &mut [])?;
        Ok(size)
    }
}

const TRANSFER_SIZE_INFO_LEN: usize = 5;

fn transfer_size_info(address: u8, size: u32) -> [u8; TRANSFER_SIZE_INFO_LEN] {
    let s = size.to_le_bytes();
    [address, s[0], s[1], s[2], s[3]]
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &format_args!("0x{:02X}", self.address))
            .field("attributes", &format_args!("0x{:02X}", self.attributes))
            .field("transfer_type", &self.transfer_type())
            .field("max_packet_size", &self.max_packet_size)
            .field("interval", &self.interval)
            .field("companion", &self.companion)
            .field("timeout", &self.timeout())
            .field("transfer_mode", &self.transfer_mode())
            .finish()
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ty = match self.transfer_type() {
            TransferType::Control => "Control",
            TransferType::Isochronous => "Isochronous",
            TransferType::Bulk => "Bulk",
            TransferType::Interrupt => "Interrupt",
        };
        let dir = match (self.transfer_type(), self.direction()) {
            (TransferType::Control, _) => "bidirectional",
            (_, Direction::In) => "IN",
            (_, Direction::Out) => "OUT",
        };
        writeln!(f, "{ty} {dir} endpoint 0x{:02X}", self.address)?;
        writeln!(f, "  attributes: 0x{:02X}", self.attributes)?;
        writeln!(f, "  max packet size: {}", self.max_packet_size)?;
        writeln!(f, "  descriptor type: {}", self.descriptor_type)?;
        writeln!(f, "  descriptor length: {}", self.length)?;
        writeln!(f, "  interval: {}", self.interval)?;
        if let Some(c) = &self.companion {
            writeln!(f, "  SuperSpeed endpoint companion")?;
            writeln!(f, "    max burst: {}", c.max_burst)?;
            writeln!(f, "    attributes: 0x{:02X}", c.attributes)?;
            writeln!(f, "    bytes per interval: {}", c.bytes_per_interval)?;
        }
        Ok(())
    }
}
