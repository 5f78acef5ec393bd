//! Scripted in-memory channel driver.
//!
//! Tests play the client side through [`FakeNet`]: queueing connects,
//! sending records, completing or failing pending operations. Completions
//! fire the owning slot exactly the way the overlapped driver's event
//! objects do, so the state machine and the poll loop run unmodified.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::{ChannelDriver, ChannelIo, Progress, StopTrigger, TransportError, Wake};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Accept,
    Read(usize),
    Write(usize),
}

#[derive(Default)]
struct RemoteState {
    pending: Option<Op>,
    outcome: Option<io::Result<usize>>,
    inbox: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    read_buf: Vec<u8>,
    connect_queued: bool,
    connected: bool,
    fail_next_begin: bool,
    fail_disconnect: bool,
    manual_writes: bool,
    disconnects: usize,
}

#[derive(Default)]
struct WaitState {
    fired: VecDeque<usize>,
    stop: bool,
}

struct Shared {
    wait: Mutex<WaitState>,
    cond: Condvar,
    endpoints: Mutex<Vec<Arc<Mutex<RemoteState>>>>,
    refuse_open: AtomicBool,
    fail_wait: AtomicBool,
}

impl Shared {
    fn fire(&self, slot: usize) {
        self.wait.lock().fired.push_back(slot);
        self.cond.notify_all();
    }
}

pub(crate) struct FakeDriver {
    shared: Arc<Shared>,
}

/// Test-side handle onto the fake network.
#[derive(Clone)]
pub(crate) struct FakeNet {
    shared: Arc<Shared>,
}

/// Test-side handle onto one endpoint's remote peer.
pub(crate) struct FakeRemote {
    slot: usize,
    shared: Arc<Shared>,
    state: Arc<Mutex<RemoteState>>,
}

pub(crate) struct FakeIo {
    slot: usize,
    shared: Arc<Shared>,
    state: Arc<Mutex<RemoteState>>,
    local_read: Vec<u8>,
}

pub(crate) struct FakeStop {
    shared: Arc<Shared>,
}

pub(crate) fn fake_driver() -> (FakeDriver, FakeNet) {
    let shared = Arc::new(Shared {
        wait: Mutex::new(WaitState::default()),
        cond: Condvar::new(),
        endpoints: Mutex::new(Vec::new()),
        refuse_open: AtomicBool::new(false),
        fail_wait: AtomicBool::new(false),
    });
    (
        FakeDriver {
            shared: shared.clone(),
        },
        FakeNet { shared },
    )
}

impl ChannelDriver for FakeDriver {
    type Io = FakeIo;
    type Stop = FakeStop;

    fn stop_trigger(&self) -> FakeStop {
        FakeStop {
            shared: self.shared.clone(),
        }
    }

    fn open(&mut self) -> Result<FakeIo, TransportError> {
        if self.shared.refuse_open.load(Ordering::SeqCst) {
            return Err(TransportError::new(
                "open",
                io::Error::other("out of channel instances"),
            ));
        }
        let state = Arc::new(Mutex::new(RemoteState::default()));
        let mut endpoints = self.shared.endpoints.lock();
        endpoints.push(state.clone());
        Ok(FakeIo {
            slot: endpoints.len() - 1,
            shared: self.shared.clone(),
            state,
            local_read: Vec::new(),
        })
    }

    fn wait(&mut self) -> Result<Wake, TransportError> {
        if self.shared.fail_wait.load(Ordering::SeqCst) {
            return Err(TransportError::new("wait", io::Error::other("wait failed")));
        }
        let mut wait = self.shared.wait.lock();
        loop {
            if wait.stop {
                return Ok(Wake::Stop);
            }
            if let Some(slot) = wait.fired.pop_front() {
                return Ok(Wake::Slot(slot));
            }
            self.shared.cond.wait(&mut wait);
        }
    }
}

impl StopTrigger for FakeStop {
    fn raise(&self) {
        self.shared.wait.lock().stop = true;
        self.shared.cond.notify_all();
    }
}

impl ChannelIo for FakeIo {
    fn begin_accept(&mut self) -> Result<Progress, TransportError> {
        let mut st = self.state.lock();
        if std::mem::take(&mut st.fail_next_begin) {
            return Err(TransportError::new(
                "accept",
                io::Error::other("injected accept failure"),
            ));
        }
        if std::mem::take(&mut st.connect_queued) {
            st.connected = true;
            return Ok(Progress::Completed(0));
        }
        st.pending = Some(Op::Accept);
        Ok(Progress::Pending)
    }

    fn begin_read(&mut self, len: usize) -> Result<Progress, TransportError> {
        let mut st = self.state.lock();
        if std::mem::take(&mut st.fail_next_begin) {
            return Err(TransportError::new(
                "read",
                io::Error::other("injected read failure"),
            ));
        }
        if let Some(msg) = st.inbox.pop_front() {
            deliver(&mut st, msg, len);
            self.shared.fire(self.slot);
            st.pending = Some(Op::Read(len));
            return Ok(Progress::Pending);
        }
        st.pending = Some(Op::Read(len));
        Ok(Progress::Pending)
    }

    fn begin_write(&mut self, data: &[u8]) -> Result<Progress, TransportError> {
        let mut st = self.state.lock();
        if std::mem::take(&mut st.fail_next_begin) {
            return Err(TransportError::new(
                "write",
                io::Error::other("injected write failure"),
            ));
        }
        st.written.push(data.to_vec());
        st.pending = Some(Op::Write(data.len()));
        if !st.manual_writes {
            st.outcome = Some(Ok(data.len()));
            self.shared.fire(self.slot);
        }
        Ok(Progress::Pending)
    }

    fn finish(&mut self) -> Result<usize, TransportError> {
        let mut st = self.state.lock();
        let was_read = matches!(st.pending, Some(Op::Read(_)));
        st.pending = None;
        match st.outcome.take() {
            Some(Ok(n)) => {
                if was_read {
                    self.local_read = st.read_buf.clone();
                }
                Ok(n)
            }
            Some(Err(err)) => Err(TransportError::new("finish", err)),
            None => Err(TransportError::new(
                "finish",
                io::Error::other("completion signalled with no outcome"),
            )),
        }
    }

    fn read_buf(&self) -> &[u8] {
        &self.local_read
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        if st.fail_disconnect {
            return Err(TransportError::new(
                "disconnect",
                io::Error::other("injected disconnect failure"),
            ));
        }
        st.connected = false;
        st.pending = None;
        st.outcome = None;
        st.inbox.clear();
        st.disconnects += 1;
        Ok(())
    }
}

fn deliver(st: &mut RemoteState, msg: Vec<u8>, len: usize) {
    if msg.len() > len {
        st.outcome = Some(Err(io::Error::other("message larger than read buffer")));
    } else {
        st.outcome = Some(Ok(msg.len()));
        st.read_buf = msg;
    }
}

impl FakeNet {
    pub(crate) fn endpoints(&self) -> usize {
        self.shared.endpoints.lock().len()
    }

    pub(crate) fn remote(&self, slot: usize) -> FakeRemote {
        let state = self.shared.endpoints.lock()[slot].clone();
        FakeRemote {
            slot,
            shared: self.shared.clone(),
            state,
        }
    }

    /// Block until at least `n` endpoints were opened (threaded tests).
    pub(crate) fn wait_endpoints(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.endpoints() < n {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub(crate) fn refuse_open(&self, refuse: bool) {
        self.shared.refuse_open.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn fail_wait(&self) {
        self.shared.fail_wait.store(true, Ordering::SeqCst);
    }

    pub(crate) fn raise_stop(&self) {
        self.shared.wait.lock().stop = true;
        self.shared.cond.notify_all();
    }

    pub(crate) fn clear_stop(&self) {
        self.shared.wait.lock().stop = false;
    }

    pub(crate) fn stop_raised(&self) -> bool {
        self.shared.wait.lock().stop
    }

    pub(crate) fn pending_fires(&self) -> usize {
        self.shared.wait.lock().fired.len()
    }
}

impl FakeRemote {
    /// Connect as soon as the endpoint listens; completes a pending accept
    /// immediately.
    pub(crate) fn connect(&self) {
        let mut st = self.state.lock();
        if st.pending == Some(Op::Accept) {
            st.connected = true;
            st.outcome = Some(Ok(0));
            self.shared.fire(self.slot);
        } else {
            st.connect_queued = true;
        }
    }

    /// Send one message; completes a pending read, otherwise queues.
    pub(crate) fn send(&self, bytes: &[u8]) {
        let mut st = self.state.lock();
        match st.pending {
            Some(Op::Read(len)) => {
                deliver(&mut st, bytes.to_vec(), len);
                self.shared.fire(self.slot);
            }
            _ => st.inbox.push_back(bytes.to_vec()),
        }
    }

    /// Fail whatever operation is pending, as a broken connection would.
    pub(crate) fn fail_pending(&self) {
        let mut st = self.state.lock();
        st.connected = false;
        st.outcome = Some(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "client went away",
        )));
        self.shared.fire(self.slot);
    }

    /// Make the next issued operation fail synchronously.
    pub(crate) fn fail_next_begin(&self) {
        self.state.lock().fail_next_begin = true;
    }

    pub(crate) fn fail_disconnect(&self) {
        self.state.lock().fail_disconnect = true;
    }

    /// Stop auto-completing writes; tests finish them via `complete_write`.
    pub(crate) fn manual_writes(&self) {
        self.state.lock().manual_writes = true;
    }

    /// Complete the pending write, reporting `n` bytes transferred (or the
    /// full length when `None`).
    pub(crate) fn complete_write(&self, n: Option<usize>) {
        let mut st = self.state.lock();
        let Some(Op::Write(len)) = st.pending else {
            panic!("no pending write");
        };
        st.outcome = Some(Ok(n.unwrap_or(len)));
        self.shared.fire(self.slot);
    }

    pub(crate) fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().written)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn has_pending_accept(&self) -> bool {
        self.state.lock().pending == Some(Op::Accept)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }
}
