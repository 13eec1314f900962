//! Per-endpoint transfer state machine.
//!
//! ```text
//! Idle -> RequestSubmitted -> Completed -----------------------> Idle
//!                          \-> TimedOut -> Aborting -> (wait) -> Idle
//! ```
//!
//! A request buffer and the caller's data must outlive the in-flight I/O, so
//! after a timeout the engine aborts the pipe and then waits without bound for
//! the driver to give the buffers back before returning.

use std::{sync::Arc, time::Duration};

use log::{debug, error, trace, warn};

use crate::platform::{CompletionSignal, DeviceIo, IoRequest, IoStatus, IoctlCode, WaitStatus};

use super::{
    control_timeout_secs, Completion, ControlSetup, Direction, RequestBuffer, TransferMode,
    TransferStatus, REQUEST_HEADER_LEN,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    RequestSubmitted,
    Completed,
    TimedOut,
    Aborting,
}

struct Outcome {
    timed_out: bool,
    io: IoStatus,
}

pub(crate) struct Engine<'a> {
    io: &'a dyn DeviceIo,
    address: u8,
    timeout: Duration,
    state: State,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(io: &'a dyn DeviceIo, address: u8, timeout: Duration) -> Engine<'a> {
        Engine {
            io,
            address,
            timeout,
            state: State::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, to: State) {
        trace!(
            "endpoint 0x{:02X}: {:?} -> {:?}",
            self.address,
            self.state,
            to
        );
        self.state = to;
    }

    /// Submit `request` and block until it completes, aborting the pipe on
    /// timeout. `data` is the separate output buffer of a direct transfer.
    fn execute(
        &mut self,
        code: IoctlCode,
        request: &mut RequestBuffer,
        data: Option<&mut [u8]>,
    ) -> Outcome {
        debug_assert_eq!(self.state, State::Idle);

        let signal = Arc::new(CompletionSignal::new());
        let input_len = request.len();
        let input = request.as_mut_ptr();
        let (output, output_len) = match data {
            Some(d) => (d.as_mut_ptr(), d.len()),
            None => (input, input_len),
        };

        let io_request = IoRequest {
            code,
            input: input as *const u8,
            input_len,
            output,
            output_len,
        };

        // SAFETY: `request` and `data` are borrowed for this whole call, and
        // every path below waits for `signal` to complete before returning.
        let immediate = unsafe { self.io.submit(io_request, &signal) };
        self.transition(State::RequestSubmitted);
        if immediate > 0 {
            trace!("endpoint 0x{:02X}: {immediate} bytes completed on submit", self.address);
        }

        let timed_out = match self.io.wait(&signal, Some(self.timeout)) {
            WaitStatus::Signaled => {
                self.transition(State::Completed);
                false
            }
            WaitStatus::TimedOut => {
                self.transition(State::TimedOut);
                self.abort();
                self.transition(State::Aborting);
                self.io.wait(&signal, None);
                true
            }
        };

        let io = self.io.get_result(&signal);
        self.transition(State::Idle);
        Outcome { timed_out, io }
    }

    fn abort(&self) {
        debug!(
            "endpoint 0x{:02X}: no completion within {:?}, aborting pipe",
            self.address, self.timeout
        );
        if let Err(e) = self.io.ioctl(IoctlCode::AbortPipe, &[self.address], &mut []) {
            debug!("endpoint 0x{:02X}: abort failed: {e}", self.address);
        }
    }

    fn status(&self, outcome: &Outcome, request: &RequestBuffer) -> TransferStatus {
        let usbd = request.usbd_status();
        let nt = request.nt_status();
        if outcome.timed_out {
            TransferStatus::TimedOut
        } else if usbd != 0 || nt != 0 {
            debug!(
                "endpoint 0x{:02X}: USBD status 0x{usbd:08X}, NT status 0x{nt:08X}",
                self.address
            );
            TransferStatus::DeviceStatus
        } else if !outcome.io.success {
            error!(
                "endpoint 0x{:02X}: request failed without a driver status",
                self.address
            );
            TransferStatus::Failed
        } else {
            TransferStatus::Complete
        }
    }

    /// Bulk, interrupt, or isochronous transfer of `buf`.
    ///
    /// `iso_block` is the size of the isochronous packet block to reserve, and
    /// is `None` for other endpoint types. Packet records are only returned
    /// when `iso_packets` is set and data was moved.
    pub(crate) fn data_transfer(
        &mut self,
        buf: &mut [u8],
        mode: TransferMode,
        iso_block: Option<usize>,
        iso_packets: bool,
    ) -> Completion {
        if !self.io.is_valid() {
            return Completion::without_io(TransferStatus::InvalidHandle);
        }

        let len = buf.len();
        let Ok(len32) = u32::try_from(len) else {
            warn!("transfer of {len} bytes exceeds the driver's length field");
            return Completion::without_io(TransferStatus::InvalidArgument);
        };

        let block = iso_block.unwrap_or(0);
        let trailing = block
            + match mode {
                TransferMode::Buffered => len,
                TransferMode::Direct => 0,
            };

        let mut request = RequestBuffer::new(trailing);
        request.set_wait_forever(0);
        request.set_endpoint(self.address);
        if iso_block.is_some() {
            request.set_iso_offset(REQUEST_HEADER_LEN as u32);
            request.set_iso_length(block as u32);
        }

        let outcome = match mode {
            TransferMode::Buffered => {
                let offset = REQUEST_HEADER_LEN + block;
                request.set_buffer_offset(offset as u32);
                request.set_buffer_length(len32);
                request.tail_mut(offset, len).copy_from_slice(buf);
                self.execute(IoctlCode::BufferedTransfer, &mut request, None)
            }
            TransferMode::Direct => {
                request.set_buffer_offset(0);
                request.set_buffer_length(0);
                self.execute(IoctlCode::DirectTransfer, &mut request, Some(&mut *buf))
            }
        };

        let actual = (outcome.io.bytes_transferred as usize).min(len);
        if mode == TransferMode::Buffered
            && actual > 0
            && Direction::from_address(self.address) == Direction::In
        {
            let src = request.tail(request.buffer_offset() as usize, actual);
            buf[..src.len()].copy_from_slice(src);
        }

        Completion {
            status: self.status(&outcome, &request),
            actual_length: actual,
            usbd_status: request.usbd_status(),
            nt_status: request.nt_status(),
            iso_packets: if iso_packets && actual > 0 {
                request.iso_packets()
            } else {
                Vec::new()
            },
        }
    }

    /// Control transfer on endpoint zero. Always buffered.
    pub(crate) fn control_transfer(&mut self, setup: &ControlSetup, buf: &mut [u8]) -> Completion {
        if !self.io.is_valid() {
            return Completion::without_io(TransferStatus::InvalidHandle);
        }

        let len = buf.len();
        let Ok(len16) = u16::try_from(len) else {
            warn!("control transfer of {len} bytes exceeds wLength");
            return Completion::without_io(TransferStatus::InvalidArgument);
        };

        let mut request = RequestBuffer::new(len);
        request.set_setup_packet(&setup.setup_packet(len16));
        request.set_timeout_secs(control_timeout_secs(self.timeout));
        request.set_wait_forever(0);
        request.set_endpoint(0);
        request.set_buffer_offset(REQUEST_HEADER_LEN as u32);
        request.set_buffer_length(len as u32);
        if setup.direction == Direction::Out {
            request
                .tail_mut(REQUEST_HEADER_LEN, len)
                .copy_from_slice(buf);
        }

        let outcome = self.execute(IoctlCode::ControlTransfer, &mut request, None);

        // The byte count includes the header.
        let bytes = outcome.io.bytes_transferred as usize;
        let actual = if bytes > REQUEST_HEADER_LEN {
            bytes.saturating_sub(request.buffer_offset() as usize).min(len)
        } else {
            0
        };

        if setup.direction == Direction::In && actual > 0 {
            let src = request.tail(request.buffer_offset() as usize, actual);
            buf[..src.len()].copy_from_slice(src);
        }

        Completion {
            status: self.status(&outcome, &request),
            actual_length: actual,
            usbd_status: request.usbd_status(),
            nt_status: request.nt_status(),
            iso_packets: Vec::new(),
        }
    }

    /// Fill `buf` one packet at a time, stopping at the first short packet.
    ///
    /// Succeeds if any data was moved, even if the last request failed.
    pub(crate) fn packet_transfer(
        &mut self,
        buf: &mut [u8],
        max_packet_size: usize,
        mode: TransferMode,
    ) -> Completion {
        if max_packet_size == 0 {
            return self.data_transfer(buf, mode, None, false);
        }

        let len = buf.len();
        let mut scratch = vec![0; max_packet_size];
        let mut size = 0;
        let mut last = Completion::without_io(TransferStatus::Complete);

        while size < len {
            let chunk = (len - size).min(max_packet_size);
            let c = self.data_transfer(&mut scratch[..chunk], mode, None, false);
            if !c.is_complete() {
                last = c;
                break;
            }

            let n = c.actual_length;
            buf[size..size + n].copy_from_slice(&scratch[..n]);
            size += n;

            let short = n < max_packet_size;
            last = c;
            if short {
                trace!(
                    "endpoint 0x{:02X}: short packet of {n} bytes ends transfer",
                    self.address
                );
                break;
            }
        }

        Completion {
            status: if size > 0 {
                TransferStatus::Complete
            } else {
                last.status
            },
            actual_length: size,
            usbd_status: last.usbd_status,
            nt_status: last.nt_status,
            iso_packets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        platform::mock::{MockIo, Reply},
        transfer::{ControlType, IsoPacketInfo, Recipient, ISO_PACKET_INFO_LEN},
    };

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn header_u32(header: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(header[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_direct_in() {
        let io = MockIo::new();
        io.push(Reply::data([1, 2, 3]));

        let mut buf = [0; 64];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, None, false);

        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 3);
        assert_eq!(&buf[..4], &[1, 2, 3, 0]);
        assert_eq!(engine.state(), State::Idle);

        let s = io.submitted();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].code, IoctlCode::DirectTransfer);
        assert_eq!(s[0].header[13], 0x81);
        assert_eq!(s[0].output_len, 64);
        assert_eq!(io.waits(), vec![Some(TIMEOUT)]);
    }

    #[test]
    fn test_buffered_out() {
        let io = MockIo::new();
        let mut buf = [9, 8, 7, 6];
        let mut engine = Engine::new(&io, 0x02, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Buffered, None, false);

        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 4);

        let s = io.submitted();
        assert_eq!(s[0].code, IoctlCode::BufferedTransfer);
        assert_eq!(s[0].sent, vec![9, 8, 7, 6]);
        assert_eq!(s[0].output_len, REQUEST_HEADER_LEN + 4);
        assert_eq!(header_u32(&s[0].header, 30), REQUEST_HEADER_LEN as u32);
        assert_eq!(header_u32(&s[0].header, 34), 4);
    }

    #[test]
    fn test_buffered_in() {
        let io = MockIo::new();
        io.push(Reply::data([0xAA, 0xBB]));
        let mut buf = [0; 8];
        let mut engine = Engine::new(&io, 0x83, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Buffered, None, false);
        assert_eq!(c.actual_length, 2);
        assert_eq!(&buf[..2], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_device_status() {
        let io = MockIo::new();
        io.push(Reply::status(0xC000_0004, 0));
        let mut buf = [0; 8];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, None, false);
        assert_eq!(c.status, TransferStatus::DeviceStatus);
        assert_eq!(c.usbd_status, 0xC000_0004);
        assert_eq!(c.nt_status, 0);
    }

    #[test]
    fn test_io_failure() {
        let io = MockIo::new();
        io.push(Reply::failed());
        let mut buf = [0; 8];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, None, false);
        assert_eq!(c.status, TransferStatus::Failed);
    }

    #[test]
    fn test_timeout_aborts_then_waits() {
        let _ = env_logger::builder().is_test(true).try_init();
        let io = MockIo::new();
        io.push(Reply::Hang);

        let timeout = Duration::from_millis(20);
        let mut buf = [0; 512];
        let mut engine = Engine::new(&io, 0x81, timeout);
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, None, false);

        assert_eq!(c.status, TransferStatus::TimedOut);
        assert_eq!(c.actual_length, 0);
        assert_eq!(io.count_ioctls(IoctlCode::AbortPipe), 1);
        assert_eq!(io.ioctls()[0].1, vec![0x81]);
        assert_eq!(io.waits(), vec![Some(timeout), None]);
        assert_eq!(engine.state(), State::Idle);

        // The endpoint is usable again.
        io.push(Reply::data([5; 4]));
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, None, false);
        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 4);
    }

    #[test]
    fn test_invalid_handle() {
        let io = MockIo::invalid();
        let mut buf = [0; 8];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, None, false);
        assert_eq!(c.status, TransferStatus::InvalidHandle);
        let c = engine.control_transfer(&ControlSetup::default(), &mut buf);
        assert_eq!(c.status, TransferStatus::InvalidHandle);
        assert!(io.submitted().is_empty());
        assert!(io.waits().is_empty());
    }

    #[test]
    fn test_packet_mode_short_final_packet() {
        let io = MockIo::new();
        let mps = 64;
        for i in 0..3 {
            io.push(Reply::data(vec![i as u8; mps]));
        }
        io.push(Reply::data(vec![0xEE; 10]));

        let mut buf = vec![0; 3 * mps + 10];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.packet_transfer(&mut buf, mps, TransferMode::Direct);

        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 3 * mps + 10);
        assert_eq!(io.submitted().len(), 4);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[mps], 1);
        assert_eq!(buf[2 * mps], 2);
        assert_eq!(&buf[3 * mps..], &[0xEE; 10]);
    }

    #[test]
    fn test_packet_mode_stops_on_short_packet() {
        let io = MockIo::new();
        io.push(Reply::data(vec![1; 64]));
        io.push(Reply::data(vec![2; 5]));

        let mut buf = vec![0; 1024];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.packet_transfer(&mut buf, 64, TransferMode::Buffered);
        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 69);
        assert_eq!(io.submitted().len(), 2);
    }

    #[test]
    fn test_packet_mode_partial_failure() {
        let io = MockIo::new();
        io.push(Reply::data(vec![1; 64]));
        io.push(Reply::failed());

        let mut buf = vec![0; 256];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.packet_transfer(&mut buf, 64, TransferMode::Direct);
        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 64);

        io.push(Reply::failed());
        let c = engine.packet_transfer(&mut buf, 64, TransferMode::Direct);
        assert_eq!(c.status, TransferStatus::Failed);
        assert_eq!(c.actual_length, 0);
    }

    #[test]
    fn test_control_in() {
        let io = MockIo::new();
        io.push(Reply::data([0x12, 0x01, 0x00, 0x02]));

        let setup = ControlSetup {
            direction: Direction::In,
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request: 0x06,
            value: 0x0100,
            index: 0,
        };
        let mut buf = [0; 18];
        let mut engine = Engine::new(&io, 0, Duration::from_millis(500));
        let c = engine.control_transfer(&setup, &mut buf);

        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 4);
        assert_eq!(&buf[..4], &[0x12, 0x01, 0x00, 0x02]);

        let s = &io.submitted()[0];
        assert_eq!(s.code, IoctlCode::ControlTransfer);
        #[rustfmt::skip]
        assert_eq!(&s.header[..14], &[
            0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0x00,
            0x01, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ]);
        assert_eq!(header_u32(&s.header, 30), REQUEST_HEADER_LEN as u32);
        assert_eq!(header_u32(&s.header, 34), 18);
    }

    #[test]
    fn test_control_out_zero_length() {
        let io = MockIo::new();
        let mut engine = Engine::new(&io, 0, TIMEOUT);
        let c = engine.control_transfer(&ControlSetup::default(), &mut []);
        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 0);
        assert_eq!(io.submitted()[0].header[0], 0x40);
        assert_eq!(header_u32(&io.submitted()[0].header, 8), 10);
    }

    #[test]
    fn test_iso_packets() {
        let io = MockIo::new();
        io.push(Reply::Complete {
            data: vec![3; 100],
            usbd_status: 0,
            nt_status: 0,
            success: true,
            iso: vec![
                IsoPacketInfo {
                    status: 0,
                    length: 64,
                },
                IsoPacketInfo {
                    status: 0,
                    length: 36,
                },
            ],
        });

        let mut buf = [0; 128];
        let block = 2 * ISO_PACKET_INFO_LEN;
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Buffered, Some(block), true);

        assert_eq!(c.status, TransferStatus::Complete);
        assert_eq!(c.actual_length, 100);
        assert_eq!(c.iso_packets.len(), 2);
        assert_eq!(c.iso_packets[1].length, 36);

        let s = &io.submitted()[0];
        assert_eq!(header_u32(&s.header, 22), REQUEST_HEADER_LEN as u32);
        assert_eq!(header_u32(&s.header, 26), block as u32);
        assert_eq!(header_u32(&s.header, 30), (REQUEST_HEADER_LEN + block) as u32);
    }

    #[test]
    fn test_iso_packets_not_returned_without_data() {
        let io = MockIo::new();
        io.push(Reply::Complete {
            data: vec![],
            usbd_status: 0,
            nt_status: 0,
            success: true,
            iso: vec![IsoPacketInfo::default()],
        });
        let mut buf = [0; 64];
        let mut engine = Engine::new(&io, 0x81, TIMEOUT);
        let c = engine.data_transfer(&mut buf, TransferMode::Direct, Some(8), true);
        assert!(c.iso_packets.is_empty());
    }
}
