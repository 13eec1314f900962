//! Scripted [`DeviceIo`] for unit tests.
//!
//! Requests are answered from a queue of [`Reply`] values. Every submit,
//! wait, and synchronous request is recorded so tests can assert on the exact
//! sequence of I/O the engine performed.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    transfer::{
        request::{
            OFFSET_BUFFER_LENGTH, OFFSET_BUFFER_OFFSET, OFFSET_ENDPOINT, OFFSET_ISO_LENGTH,
            OFFSET_ISO_OFFSET, OFFSET_NT_STATUS, OFFSET_REQUEST_TYPE, OFFSET_USBD_STATUS,
        },
        IsoPacketInfo, ISO_PACKET_INFO_LEN, REQUEST_HEADER_LEN,
    },
    Error, ErrorKind,
};

use super::{CompletionSignal, DeviceIo, IoRequest, IoctlCode, RawHandle, WaitStatus};

/// How the mock answers the next submitted request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Complete immediately. For IN requests `data` is written to the
    /// request's data area; OUT requests report their full length.
    Complete {
        data: Vec<u8>,
        usbd_status: u32,
        nt_status: u32,
        success: bool,
        iso: Vec<IsoPacketInfo>,
    },

    /// Stay pending until the pipe is aborted, then complete with failure.
    Hang,
}

impl Reply {
    pub(crate) fn data(data: impl Into<Vec<u8>>) -> Reply {
        Reply::Complete {
            data: data.into(),
            usbd_status: 0,
            nt_status: 0,
            success: true,
            iso: Vec::new(),
        }
    }

    pub(crate) fn status(usbd_status: u32, nt_status: u32) -> Reply {
        Reply::Complete {
            data: Vec::new(),
            usbd_status,
            nt_status,
            success: true,
            iso: Vec::new(),
        }
    }

    pub(crate) fn failed() -> Reply {
        Reply::Complete {
            data: Vec::new(),
            usbd_status: 0,
            nt_status: 0,
            success: false,
            iso: Vec::new(),
        }
    }
}

/// A submitted request as the mock saw it.
#[derive(Debug, Clone)]
pub(crate) struct Submitted {
    pub code: IoctlCode,
    pub header: Vec<u8>,
    pub sent: Vec<u8>,
    pub output_len: usize,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<Reply>,
    submitted: Vec<Submitted>,
    waits: Vec<Option<Duration>>,
    ioctls: Vec<(IoctlCode, Vec<u8>)>,
    hanging: Vec<Arc<CompletionSignal>>,
    transfer_size: u32,
}

#[derive(Debug)]
pub(crate) struct MockIo {
    handle: RawHandle,
    state: Mutex<MockState>,
}

impl MockIo {
    pub(crate) fn new() -> MockIo {
        MockIo {
            handle: 0x1234,
            state: Mutex::new(MockState::default()),
        }
    }

    pub(crate) fn invalid() -> MockIo {
        MockIo {
            handle: super::INVALID_HANDLE,
            state: Mutex::new(MockState::default()),
        }
    }

    pub(crate) fn push(&self, reply: Reply) {
        self.state.lock().unwrap().replies.push_back(reply);
    }

    pub(crate) fn set_transfer_size(&self, size: u32) {
        self.state.lock().unwrap().transfer_size = size;
    }

    pub(crate) fn submitted(&self) -> Vec<Submitted> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub(crate) fn waits(&self) -> Vec<Option<Duration>> {
        self.state.lock().unwrap().waits.clone()
    }

    pub(crate) fn ioctls(&self) -> Vec<(IoctlCode, Vec<u8>)> {
        self.state.lock().unwrap().ioctls.clone()
    }

    pub(crate) fn count_ioctls(&self, code: IoctlCode) -> usize {
        self.ioctls().iter().filter(|(c, _)| *c == code).count()
    }
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

impl DeviceIo for MockIo {
    fn raw_handle(&self) -> RawHandle {
        self.handle
    }

    unsafe fn submit(&self, request: IoRequest, signal: &Arc<CompletionSignal>) -> u32 {
        let mut state = self.state.lock().unwrap();
        let reply = state.replies.pop_front().unwrap_or_else(|| Reply::data([]));

        // SAFETY: the engine passes the header as `input` with a mutable
        // origin, and keeps it alive until the signal completes. In buffered
        // modes `output` is the same memory, so it's only touched separately
        // in direct mode.
        let header =
            unsafe { std::slice::from_raw_parts_mut(request.input as *mut u8, request.input_len) };
        let buffered = request.input == request.output as *const u8;
        let direct_output =
            || unsafe { std::slice::from_raw_parts_mut(request.output, request.output_len) };

        let is_in = match request.code {
            IoctlCode::ControlTransfer => header[OFFSET_REQUEST_TYPE] & 0x80 != 0,
            _ => header[OFFSET_ENDPOINT] & 0x80 != 0,
        };

        let data_offset = get_u32(header, OFFSET_BUFFER_OFFSET) as usize;
        let data_len = get_u32(header, OFFSET_BUFFER_LENGTH) as usize;

        let sent = if is_in {
            Vec::new()
        } else if buffered {
            header[data_offset..data_offset + data_len].to_vec()
        } else {
            direct_output().to_vec()
        };

        state.submitted.push(Submitted {
            code: request.code,
            header: header[..REQUEST_HEADER_LEN].to_vec(),
            sent,
            output_len: request.output_len,
        });

        let (data, usbd_status, nt_status, success, iso) = match reply {
            Reply::Hang => {
                state.hanging.push(signal.clone());
                return 0;
            }
            Reply::Complete {
                data,
                usbd_status,
                nt_status,
                success,
                iso,
            } => (data, usbd_status, nt_status, success, iso),
        };

        put_u32(header, OFFSET_USBD_STATUS, usbd_status);
        put_u32(header, OFFSET_NT_STATUS, nt_status);

        let iso_offset = get_u32(header, OFFSET_ISO_OFFSET) as usize;
        let iso_len = get_u32(header, OFFSET_ISO_LENGTH) as usize;
        for (i, p) in iso.iter().enumerate().take(iso_len / ISO_PACKET_INFO_LEN) {
            let at = iso_offset + i * ISO_PACKET_INFO_LEN;
            put_u32(header, at, p.status);
            put_u32(header, at + 4, p.length);
        }

        let moved = if is_in {
            let area = if buffered {
                &mut header[data_offset..data_offset + data_len]
            } else {
                direct_output()
            };
            let n = data.len().min(area.len());
            area[..n].copy_from_slice(&data[..n]);
            n
        } else if buffered {
            data_len
        } else {
            request.output_len
        };

        let bytes = match request.code {
            IoctlCode::ControlTransfer => REQUEST_HEADER_LEN + moved,
            _ => moved,
        };

        signal.complete(bytes as u32, success);
        bytes as u32
    }

    fn wait(&self, signal: &CompletionSignal, timeout: Option<Duration>) -> WaitStatus {
        self.state.lock().unwrap().waits.push(timeout);
        signal.wait(timeout)
    }

    fn ioctl(&self, code: IoctlCode, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        if !self.is_valid() {
            return Err(Error::new(ErrorKind::InvalidHandle, "mock handle is invalid"));
        }

        let mut state = self.state.lock().unwrap();
        state.ioctls.push((code, input.to_vec()));

        match code {
            IoctlCode::AbortPipe => {
                for signal in state.hanging.drain(..) {
                    signal.complete(0, false);
                }
                Ok(0)
            }
            IoctlCode::GetTransferSize => {
                if output.len() < 5 {
                    return Err(Error::new(ErrorKind::Other, "short output buffer"));
                }
                output[0] = input.first().copied().unwrap_or(0);
                put_u32(output, 1, state.transfer_size);
                Ok(5)
            }
            IoctlCode::SetTransferSize => {
                if input.len() >= 5 {
                    state.transfer_size = get_u32(input, 1);
                }
                Ok(0)
            }
            _ => Ok(0),
        }
    }
}
