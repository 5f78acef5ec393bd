//! The channel surface the pipe server multiplexes over.
//!
//! A channel driver owns a growable set of half-duplex channel instances and
//! one blocking wait across all of their completion signals plus a stop
//! signal. Operations are issued without blocking and resolved later, on the
//! poll thread, when the wait wakes (the completion-queue pattern). Keeping
//! the surface a trait lets the connection state machine and the server loop
//! run against a scripted in-memory driver in tests; the overlapped
//! named-pipe driver is in [`windows`].

use std::io;

pub(crate) mod endpoint;
#[cfg(test)]
pub(crate) mod fake;
#[cfg(windows)]
pub mod windows;

/// Channel-level OS failure. Always handled by recycling the one affected
/// endpoint; never surfaced to event listeners.
#[derive(Debug, thiserror::Error)]
#[error("{op} failed: {source}")]
pub struct TransportError {
    op: &'static str,
    #[source]
    source: io::Error,
}

impl TransportError {
    pub fn new(op: &'static str, source: io::Error) -> Self {
        Self { op, source }
    }

    #[cfg(windows)]
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::new(op, io::Error::last_os_error())
    }
}

/// Progress of a freshly issued operation.
///
/// `Completed` is reported only when the operation finished inline *without*
/// raising the endpoint's completion signal (a client was already waiting on
/// a connect, say). Everything else resolves through [`ChannelIo::finish`]
/// after the wait wakes, even if the OS happened to finish the call
/// synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Completed(usize),
}

/// What a blocking wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Stop,
    Slot(usize),
}

/// One channel instance and the wait slot its pending operation signals.
///
/// At most one operation may be in flight at a time; issuing the next one is
/// allowed only once the previous one was resolved or the instance was
/// disconnected.
pub trait ChannelIo {
    /// Begin waiting for a client to connect to this instance.
    fn begin_accept(&mut self) -> Result<Progress, TransportError>;

    /// Begin reading one message of at most `len` bytes into the read buffer.
    fn begin_read(&mut self, len: usize) -> Result<Progress, TransportError>;

    /// Begin writing `data` as one message.
    fn begin_write(&mut self, data: &[u8]) -> Result<Progress, TransportError>;

    /// Resolve the operation whose completion signal fired; returns the
    /// number of bytes transferred.
    fn finish(&mut self) -> Result<usize, TransportError>;

    /// Bytes delivered by the last completed read.
    fn read_buf(&self) -> &[u8];

    /// Drop the current client association so the instance can accept again.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Rotating schedule over a wait list too large for one wait call.
///
/// Chunk `i` covers the endpoints in `bounds(i)`; every chunk's wait leads
/// with the reserved stop slot, so [`wake_at`] maps a fired index back to
/// stop-or-endpoint given the chunk's base.
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkPlan {
    total: usize,
    per_chunk: usize,
}

#[cfg_attr(not(windows), allow(dead_code))]
impl ChunkPlan {
    pub(crate) fn new(total: usize, per_chunk: usize) -> Self {
        Self { total, per_chunk }
    }

    pub(crate) fn count(&self) -> usize {
        self.total.div_ceil(self.per_chunk).max(1)
    }

    /// Endpoint range `[base, end)` of chunk `chunk`, wrapping past the last
    /// chunk so a rotating cursor never runs off the list.
    pub(crate) fn bounds(&self, chunk: usize) -> (usize, usize) {
        let base = (chunk % self.count()) * self.per_chunk;
        (base, (base + self.per_chunk).min(self.total))
    }
}

/// Map a fired wait-list index to its meaning: index zero is the reserved
/// stop slot, everything past it is the endpoint at the chunk's base plus
/// the offset.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn wake_at(index: usize, base: usize) -> Wake {
    if index == 0 {
        Wake::Stop
    } else {
        Wake::Slot(base + index - 1)
    }
}

/// Cross-thread trigger that wakes the poll loop with [`Wake::Stop`].
pub trait StopTrigger: Send + Sync + 'static {
    fn raise(&self);
}

/// Factory plus multiplexer for channel instances.
pub trait ChannelDriver: Send + 'static {
    type Io: ChannelIo;
    type Stop: StopTrigger;

    fn stop_trigger(&self) -> Self::Stop;

    /// Open a fresh channel instance. Its wait slot is appended to the wait
    /// list, so [`Wake::Slot`] indices follow `open` order, offset past the
    /// reserved stop slot.
    fn open(&mut self) -> Result<Self::Io, TransportError>;

    /// Block until the stop trigger or some instance's pending operation
    /// completes. Never returns "nothing happened".
    fn wait(&mut self) -> Result<Wake, TransportError>;
}
