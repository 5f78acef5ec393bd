//! Overlapped named pipe backend.
//!
//! Every instance is opened `PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED` in
//! message mode with one auto-reset event as its completion signal. The wait
//! is `WaitForMultipleObjects` over a manual-reset stop event at slot zero
//! followed by every instance event in open order. Past the 64 handle limit
//! of a single wait the handle list is split into chunks that each lead with
//! the stop event, polled round-robin with a short timeout.

use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;
use windows::{
    Win32::{
        Foundation::{
            CloseHandle, ERROR_IO_PENDING, ERROR_PIPE_CONNECTED, HANDLE, WAIT_FAILED,
            WAIT_OBJECT_0, WAIT_TIMEOUT,
        },
        Storage::FileSystem::{
            FILE_FLAG_OVERLAPPED, FlushFileBuffers, PIPE_ACCESS_DUPLEX, ReadFile, WriteFile,
        },
        System::{
            IO::{GetOverlappedResult, OVERLAPPED},
            Pipes::{
                ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_MESSAGE,
                PIPE_TYPE_MESSAGE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
            },
            Threading::{CreateEventW, INFINITE, ResetEvent, SetEvent, WaitForMultipleObjects},
        },
    },
    core::PCWSTR,
};

use super::{
    ChannelDriver, ChannelIo, ChunkPlan, Progress, StopTrigger, TransportError, Wake, wake_at,
};

/// `WaitForMultipleObjects` handle limit.
const MAX_WAIT_HANDLES: usize = 64;

/// Per-chunk timeout while rotating an oversized handle list.
const CHUNK_WAIT_MS: u32 = 25;

/// Per-instance buffer advised to the pipe; records are far smaller.
const PIPE_BUFFER: u32 = 512;

fn transport(op: &'static str, err: windows::core::Error) -> TransportError {
    TransportError::new(op, err.into())
}

/// An event handle detached from its lifetime so it can sit in the shared
/// wait list. The owning [`PipeIo`] closes it.
#[derive(Debug, Clone, Copy)]
struct RawEvent(isize);

impl RawEvent {
    fn from_handle(handle: HANDLE) -> Self {
        Self(handle.0 as isize)
    }

    fn handle(self) -> HANDLE {
        HANDLE(self.0 as *mut c_void)
    }
}

/// The manual-reset stop event, shared between the driver and every
/// [`PipeStop`]. The poll thread can die and drop the driver while stop
/// triggers are still live, so the last owner closes the handle.
struct StopEvent(RawEvent);

impl StopEvent {
    fn new() -> Result<Self, TransportError> {
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|err| transport("create stop event", err))?;
        Ok(Self(RawEvent::from_handle(handle)))
    }

    fn handle(&self) -> HANDLE {
        self.0.handle()
    }
}

impl Drop for StopEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle());
        }
    }
}

/// Raises the manual-reset stop event; the poll loop observes it on its next
/// wait no matter which chunk it is scanning.
pub struct PipeStop {
    event: Arc<StopEvent>,
}

impl StopTrigger for PipeStop {
    fn raise(&self) {
        unsafe {
            let _ = SetEvent(self.event.handle());
        }
    }
}

/// Overlapped named pipe driver for one pipe address.
pub struct NamedPipeDriver {
    /// Pipe address, wide encoded with its terminator.
    addr: Vec<u16>,
    stop: Arc<StopEvent>,
    events: Arc<Mutex<Vec<RawEvent>>>,
    /// First chunk scanned by the next oversized wait.
    next_chunk: usize,
}

impl NamedPipeDriver {
    /// Create the driver for `addr`, e.g. the result of
    /// [`winweave_common::ipc::pipe_addr`]. No instance is opened yet.
    pub fn new(addr: &str) -> Result<Self, TransportError> {
        Ok(Self {
            addr: addr.encode_utf16().chain(std::iter::once(0)).collect(),
            stop: Arc::new(StopEvent::new()?),
            events: Arc::new(Mutex::new(Vec::new())),
            next_chunk: 0,
        })
    }

    fn decode_wait(&self, fired: u32, waits: &[HANDLE], base: usize) -> Result<Wake, TransportError> {
        let index = (fired - WAIT_OBJECT_0.0) as usize;
        if index >= waits.len() {
            return Err(TransportError::new(
                "wait",
                std::io::Error::other("wait returned an out of range handle"),
            ));
        }
        Ok(wake_at(index, base))
    }
}

impl ChannelDriver for NamedPipeDriver {
    type Io = PipeIo;
    type Stop = PipeStop;

    fn stop_trigger(&self) -> PipeStop {
        PipeStop {
            event: self.stop.clone(),
        }
    }

    fn open(&mut self) -> Result<PipeIo, TransportError> {
        let pipe = unsafe {
            CreateNamedPipeW(
                PCWSTR::from_raw(self.addr.as_ptr()),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                PIPE_BUFFER,
                PIPE_BUFFER,
                0,
                None,
            )
        };
        if pipe.is_invalid() {
            return Err(TransportError::last_os("open pipe instance"));
        }
        let pipe = scopeguard::guard(pipe, |pipe| unsafe {
            let _ = CloseHandle(pipe);
        });
        let event = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map_err(|err| transport("create instance event", err))?;
        let pipe = scopeguard::ScopeGuard::into_inner(pipe);

        let mut events = self.events.lock();
        events.push(RawEvent::from_handle(event));
        trace!(slot = events.len() - 1, "opened pipe instance");

        let mut overlapped = Box::<OVERLAPPED>::default();
        overlapped.hEvent = event;
        Ok(PipeIo {
            pipe,
            event,
            overlapped,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
        })
    }

    fn wait(&mut self) -> Result<Wake, TransportError> {
        let events = self.events.lock().clone();
        if events.len() + 1 <= MAX_WAIT_HANDLES {
            let mut waits = Vec::with_capacity(events.len() + 1);
            waits.push(self.stop.handle());
            waits.extend(events.iter().map(|event| event.handle()));
            let fired = unsafe { WaitForMultipleObjects(&waits, false, INFINITE) };
            if fired == WAIT_FAILED {
                return Err(TransportError::last_os("wait"));
            }
            return self.decode_wait(fired.0, &waits, 0);
        }

        // Oversized pool: lead every chunk with the stop event and rotate.
        let plan = ChunkPlan::new(events.len(), MAX_WAIT_HANDLES - 1);
        loop {
            let chunk = self.next_chunk % plan.count();
            self.next_chunk = (chunk + 1) % plan.count();
            let (base, end) = plan.bounds(chunk);

            let mut waits = Vec::with_capacity(end - base + 1);
            waits.push(self.stop.handle());
            waits.extend(events[base..end].iter().map(|event| event.handle()));
            let fired = unsafe { WaitForMultipleObjects(&waits, false, CHUNK_WAIT_MS) };
            if fired == WAIT_FAILED {
                return Err(TransportError::last_os("wait"));
            }
            if fired == WAIT_TIMEOUT {
                continue;
            }
            return self.decode_wait(fired.0, &waits, base);
        }
    }
}

/// One overlapped pipe instance.
pub struct PipeIo {
    pipe: HANDLE,
    event: HANDLE,
    // Referenced by the kernel while an operation is pending; boxed so the
    // pointer stays put.
    overlapped: Box<OVERLAPPED>,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl PipeIo {
    fn rearm(&mut self) {
        let event = self.overlapped.hEvent;
        *self.overlapped = OVERLAPPED::default();
        self.overlapped.hEvent = event;
    }
}

impl ChannelIo for PipeIo {
    fn begin_accept(&mut self) -> Result<Progress, TransportError> {
        self.rearm();
        match unsafe { ConnectNamedPipe(self.pipe, Some(&mut *self.overlapped)) } {
            // A client connected between the disconnect and this call; the
            // event is not signalled, so report the completion inline.
            Err(err) if err.code() == ERROR_PIPE_CONNECTED.to_hresult() => {
                unsafe {
                    let _ = ResetEvent(self.event);
                }
                Ok(Progress::Completed(0))
            }
            Err(err) if err.code() == ERROR_IO_PENDING.to_hresult() => Ok(Progress::Pending),
            Err(err) => Err(transport("accept", err)),
            Ok(()) => {
                unsafe {
                    let _ = ResetEvent(self.event);
                }
                Ok(Progress::Completed(0))
            }
        }
    }

    fn begin_read(&mut self, len: usize) -> Result<Progress, TransportError> {
        self.rearm();
        self.read_buf.resize(len, 0);
        match unsafe {
            ReadFile(
                self.pipe,
                Some(&mut self.read_buf),
                None,
                Some(&mut *self.overlapped),
            )
        } {
            // Even a synchronous completion signals the event; resolve it
            // through the wait like any other.
            Ok(()) => Ok(Progress::Pending),
            Err(err) if err.code() == ERROR_IO_PENDING.to_hresult() => Ok(Progress::Pending),
            Err(err) => Err(transport("read", err)),
        }
    }

    fn begin_write(&mut self, data: &[u8]) -> Result<Progress, TransportError> {
        self.rearm();
        // The kernel reads from this buffer until the write completes, so
        // keep an owned copy for the duration.
        self.write_buf.clear();
        self.write_buf.extend_from_slice(data);
        match unsafe {
            WriteFile(
                self.pipe,
                Some(&self.write_buf),
                None,
                Some(&mut *self.overlapped),
            )
        } {
            Ok(()) => Ok(Progress::Pending),
            Err(err) if err.code() == ERROR_IO_PENDING.to_hresult() => Ok(Progress::Pending),
            Err(err) => Err(transport("write", err)),
        }
    }

    fn finish(&mut self) -> Result<usize, TransportError> {
        let mut transferred = 0u32;
        unsafe { GetOverlappedResult(self.pipe, &*self.overlapped, &mut transferred, false) }
            .map_err(|err| transport("finish", err))?;
        Ok(transferred as usize)
    }

    fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        unsafe {
            let _ = FlushFileBuffers(self.pipe);
            DisconnectNamedPipe(self.pipe).map_err(|err| transport("disconnect", err))?;
            let _ = ResetEvent(self.event);
        }
        Ok(())
    }
}

impl Drop for PipeIo {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.pipe);
            let _ = CloseHandle(self.event);
        }
    }
}
