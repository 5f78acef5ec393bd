//! Connection-slot state machine.
//!
//! One endpoint wraps one channel instance for its whole life: slots are
//! recycled across client connects and disconnects, never freed per client.
//! `Listening` means a pending accept is outstanding; `Active` covers the
//! connected client with either a pending event read or a pending response
//! write. A detected fault tears the client association down and puts the
//! slot straight back into `Listening` with a fresh accept issued.

use std::cell::Cell;

use winweave_common::event::EVENT_WIRE_SIZE;

use super::{ChannelIo, Progress, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndpointState {
    /// Waiting for a client; one pending accept.
    Listening,
    /// Client connected; one pending read of the next event record.
    Reading,
    /// Client connected; one pending response write.
    Writing,
}

/// What a resolved completion step means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Nothing to do until this slot signals again.
    Idle,
    /// A whole message of this many bytes is in the read buffer.
    Record(usize),
}

pub(crate) struct Endpoint<Io> {
    io: Io,
    state: EndpointState,
    write_len: usize,
}

impl<Io: ChannelIo> Endpoint<Io> {
    /// Wrap a fresh channel instance. The caller must call [`Self::listen`]
    /// before the slot can signal.
    pub(crate) fn new(io: Io) -> Self {
        Self {
            io,
            state: EndpointState::Listening,
            write_len: 0,
        }
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.state == EndpointState::Listening
    }

    fn is_active(&self) -> bool {
        matches!(self.state, EndpointState::Reading | EndpointState::Writing)
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        self.io.read_buf()
    }

    /// Put the slot into `Listening` and issue the accept. `free` must
    /// already count this endpoint as free; a synchronously connected client
    /// takes it straight to `Active`.
    pub(crate) fn listen(&mut self, free: &Cell<usize>) -> Result<Step, TransportError> {
        self.state = EndpointState::Listening;
        match self.io.begin_accept()? {
            Progress::Pending => Ok(Step::Idle),
            Progress::Completed(_) => self.connected(free),
        }
    }

    /// Resolve the pending operation after this slot's signal fired.
    pub(crate) fn resolve(&mut self, free: &Cell<usize>) -> Result<Step, TransportError> {
        match self.state {
            EndpointState::Listening => {
                self.io.finish()?;
                self.connected(free)
            }
            EndpointState::Reading => {
                let n = self.io.finish()?;
                Ok(Step::Record(n))
            }
            EndpointState::Writing => {
                let n = self.io.finish()?;
                if n != self.write_len {
                    return Err(TransportError::new(
                        "write",
                        std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            format!("wrote {n} of {} bytes", self.write_len),
                        ),
                    ));
                }
                self.issue_read()
            }
        }
    }

    /// Issue the read for the next event record.
    pub(crate) fn issue_read(&mut self) -> Result<Step, TransportError> {
        self.state = EndpointState::Reading;
        match self.io.begin_read(EVENT_WIRE_SIZE)? {
            Progress::Pending => Ok(Step::Idle),
            Progress::Completed(n) => Ok(Step::Record(n)),
        }
    }

    /// Issue a response write; the next record read follows its completion.
    pub(crate) fn issue_write(&mut self, data: &[u8]) -> Result<Step, TransportError> {
        self.state = EndpointState::Writing;
        self.write_len = data.len();
        match self.io.begin_write(data)? {
            Progress::Pending => Ok(Step::Idle),
            Progress::Completed(_) => self.issue_read(),
        }
    }

    /// Tear down the client association after a fault and return the slot to
    /// `Listening` with a fresh pending accept. An error here is terminal
    /// for the whole server.
    pub(crate) fn recycle(&mut self, free: &Cell<usize>) -> Result<Step, TransportError> {
        if self.is_active() {
            self.io.disconnect()?;
            free.set(free.get() + 1);
        }
        self.listen(free)
    }

    fn connected(&mut self, free: &Cell<usize>) -> Result<Step, TransportError> {
        free.set(free.get() - 1);
        self.issue_read()
    }

    /// Drop the client association during server teardown.
    pub(crate) fn shutdown(&mut self) {
        if self.is_active() {
            let _ = self.io.disconnect();
        }
    }
}
