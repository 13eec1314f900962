use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
    task::{Context, Poll},
    thread::{self, Thread},
    time::{Duration, Instant},
};

use atomic_waker::AtomicWaker;

/// Outcome of one overlapped request, as reported by the I/O backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct IoStatus {
    /// Bytes the driver wrote into the output buffer.
    pub bytes_transferred: u32,

    /// Whether the OS reported the request as successful.
    pub success: bool,
}

impl IoStatus {
    /// Result reported for a request that never reached the driver.
    pub const FAILED: IoStatus = IoStatus {
        bytes_transferred: 0,
        success: false,
    };
}

/// Result of waiting on a [`CompletionSignal`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// The request completed.
    Signaled,

    /// The timeout elapsed first. The request may still be in flight.
    TimedOut,
}

/// The request has been submitted and its buffers belong to the driver.
const STATE_PENDING: u8 = 0;

/// The backend has called `complete`. The result is readable and the
/// buffers are back in the hands of the submitter.
const STATE_COMPLETED: u8 = 1;

/// Completion handle for a single in-flight request.
///
/// A fresh signal is created for every submission and handed to the
/// [`DeviceIo`][super::DeviceIo] backend, which must call
/// [`complete`][Self::complete] exactly once, even when the request fails
/// before reaching the driver. It can be waited on by blocking the calling
/// thread, or awaited as a [`Future`] through [`completion`][Self::completion].
pub struct CompletionSignal {
    state: AtomicU8,
    result: Mutex<IoStatus>,
    thread: Mutex<Option<Thread>>,
    waker: AtomicWaker,
}

impl CompletionSignal {
    pub fn new() -> CompletionSignal {
        CompletionSignal {
            state: AtomicU8::new(STATE_PENDING),
            result: Mutex::new(IoStatus::FAILED),
            thread: Mutex::new(None),
            waker: AtomicWaker::new(),
        }
    }

    /// Record the outcome of the request and wake whoever is waiting.
    pub fn complete(&self, bytes_transferred: u32, success: bool) {
        *self.result.lock().unwrap() = IoStatus {
            bytes_transferred,
            success,
        };

        let prev = self.state.swap(STATE_COMPLETED, Ordering::Release);
        if prev == STATE_COMPLETED {
            log::warn!("completion signal completed twice");
        }

        self.waker.wake();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            thread.unpark();
        }
    }

    /// `true` once [`complete`][Self::complete] has been called.
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPLETED
    }

    /// Get the recorded outcome, or `None` if the request is still pending.
    pub fn result(&self) -> Option<IoStatus> {
        self.is_complete().then(|| *self.result.lock().unwrap())
    }

    /// Block the calling thread until the request completes or `timeout`
    /// elapses. `None` waits without bound.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitStatus {
        *self.thread.lock().unwrap() = Some(thread::current());
        let start = Instant::now();
        let status = loop {
            if self.is_complete() {
                break WaitStatus::Signaled;
            }
            match timeout {
                None => thread::park(),
                Some(timeout) => match timeout.checked_sub(start.elapsed()) {
                    Some(remaining) => thread::park_timeout(remaining),
                    None => break WaitStatus::TimedOut,
                },
            }
        };
        self.thread.lock().unwrap().take();
        status
    }

    /// Poll for completion, registering the task's waker if still pending.
    pub fn poll_complete(&self, cx: &mut Context<'_>) -> Poll<IoStatus> {
        self.waker.register(cx.waker());
        match self.result() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }

    /// Get a [`Future`] that resolves to the outcome of the request.
    pub fn completion(&self) -> SignalFuture<'_> {
        SignalFuture { signal: self }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("result", &self.result())
            .finish()
    }
}

/// [`Future`] returned by [`CompletionSignal::completion`].
pub struct SignalFuture<'a> {
    signal: &'a CompletionSignal,
}

impl Future for SignalFuture<'_> {
    type Output = IoStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.signal.poll_complete(cx)
    }
}
