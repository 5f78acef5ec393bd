//! The channel server.
//!
//! One dedicated thread owns every endpoint and blocks in a single
//! multi-wait across the stop signal and each endpoint's pending operation.
//! Completions are dispatched synchronously on that thread: a completed read
//! is decoded, handed to the handler, and answered before the next read is
//! issued on that slot. The pool never pre-sizes; whenever the last
//! listening slot would be taken it grows by [`GROW_BATCH`], so any number
//! of clients can connect over the server's lifetime.

use std::{
    cell::Cell,
    rc::Rc,
    thread::{self, JoinHandle},
};

use tracing::{debug, error, trace, warn};
use winweave_common::event::{HookEvent, HookResponse};

use crate::channel::{
    ChannelDriver, StopTrigger, TransportError, Wake,
    endpoint::{Endpoint, Step},
};

/// Listening endpoints added whenever the pool runs out of free slots.
pub const GROW_BATCH: usize = 16;

/// Runs synchronously on the poll thread for every decoded event; returns
/// the response for response-capable events. Must not block.
pub type EventHandler = Box<dyn FnMut(&HookEvent) -> Option<HookResponse> + Send>;

/// Unrecoverable server failure. The hosting process should treat any of
/// these as fatal: the server can no longer guarantee connection capacity.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot grow connection pool: {0}")]
    Growth(#[source] TransportError),
    #[error("connection wait failed: {0}")]
    Wait(#[source] TransportError),
    #[error("endpoint could not be recycled: {0}")]
    Reconnect(#[source] TransportError),
}

#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Continue,
    Stopped,
}

struct Pool<D: ChannelDriver> {
    driver: D,
    endpoints: Vec<Endpoint<D::Io>>,
    // Count of endpoints in listening state. Owned by the poll thread;
    // shared with the endpoints only through `&Cell`.
    free: Rc<Cell<usize>>,
    handler: EventHandler,
}

impl<D: ChannelDriver> Pool<D> {
    fn new(driver: D, handler: EventHandler) -> Self {
        Self {
            driver,
            endpoints: Vec::new(),
            free: Rc::new(Cell::new(0)),
            handler,
        }
    }

    fn grow(&mut self, batch: usize) -> Result<(), ServerError> {
        debug!(
            batch,
            total = self.endpoints.len() + batch,
            "growing connection pool"
        );
        for _ in 0..batch {
            let io = self.driver.open().map_err(ServerError::Growth)?;
            let mut endpoint = Endpoint::new(io);
            let free = self.free.clone();
            free.set(free.get() + 1);
            endpoint.listen(&free).map_err(ServerError::Growth)?;
            self.endpoints.push(endpoint);
        }
        Ok(())
    }

    fn poll_once(&mut self) -> Result<PollOutcome, ServerError> {
        if self.free.get() == 0 {
            self.grow(GROW_BATCH)?;
        }
        match self.driver.wait().map_err(ServerError::Wait)? {
            Wake::Stop => Ok(PollOutcome::Stopped),
            Wake::Slot(slot) => {
                self.dispatch(slot)?;
                Ok(PollOutcome::Continue)
            }
        }
    }

    fn run(&mut self) -> Result<(), ServerError> {
        loop {
            if self.poll_once()? == PollOutcome::Stopped {
                debug!("channel server stopping");
                return Ok(());
            }
        }
    }

    /// Resolve the completion on `slot` and chase every step that finishes
    /// inline. A transport fault recycles the one endpoint; a failure to
    /// recycle is terminal.
    fn dispatch(&mut self, slot: usize) -> Result<(), ServerError> {
        let free = self.free.clone();
        let mut step = self.endpoints[slot].resolve(&free);
        loop {
            step = match step {
                Ok(Step::Idle) => return Ok(()),
                Ok(Step::Record(len)) => {
                    match HookEvent::decode(&self.endpoints[slot].read_buf()[..len]) {
                        Ok(event) => {
                            trace!(slot, ?event, "hook event");
                            let response = (self.handler)(&event);
                            let endpoint = &mut self.endpoints[slot];
                            match response {
                                Some(response) => endpoint.issue_write(&response.encode()),
                                None => endpoint.issue_read(),
                            }
                        }
                        Err(err) => {
                            warn!(slot, %err, "discarding malformed record");
                            self.endpoints[slot].issue_read()
                        }
                    }
                }
                Err(fault) => {
                    warn!(slot, %fault, "transport fault, recycling endpoint");
                    let recycled = self.endpoints[slot]
                        .recycle(&free)
                        .map_err(ServerError::Reconnect)?;
                    Ok(recycled)
                }
            };
        }
    }

    #[cfg(test)]
    fn listening(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|endpoint| endpoint.is_listening())
            .count()
    }
}

impl<D: ChannelDriver> Drop for Pool<D> {
    fn drop(&mut self) {
        for endpoint in &mut self.endpoints {
            endpoint.shutdown();
        }
    }
}

/// Handle onto the running channel server.
///
/// Dropping it raises the stop signal and joins the poll thread; nothing in
/// flight is aborted, the loop just returns after the current dispatch.
pub struct PipeServer<S: StopTrigger> {
    thread: Option<JoinHandle<()>>,
    stop: S,
}

impl<S: StopTrigger> PipeServer<S> {
    /// Start the poll thread over `driver`.
    ///
    /// `on_fail` fires at most once, from the poll thread, if the server
    /// dies of a [`ServerError`].
    pub fn spawn<D: ChannelDriver<Stop = S>>(
        driver: D,
        handler: impl FnMut(&HookEvent) -> Option<HookResponse> + Send + 'static,
        on_fail: impl FnOnce(ServerError) + Send + 'static,
    ) -> Self {
        let stop = driver.stop_trigger();
        let thread = thread::Builder::new()
            .name("winweave-channel".into())
            .spawn(move || {
                let mut pool = Pool::new(driver, Box::new(handler));
                if let Err(err) = pool.run() {
                    error!("channel server failed: {err}");
                    on_fail(err);
                }
            })
            .expect("spawning channel server thread");
        Self {
            thread: Some(thread),
            stop,
        }
    }
}

impl<S: StopTrigger> Drop for PipeServer<S> {
    fn drop(&mut self) {
        self.stop.raise();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        mpsc::{self, RecvTimeoutError},
    };
    use std::time::Duration;

    use winweave_common::event::{EVENT_WIRE_SIZE, Rect};
    use winweave_common::handle::WindowHandle;

    use super::*;
    use crate::channel::fake::{FakeDriver, FakeNet, fake_driver};

    fn noop_pool() -> (Pool<FakeDriver>, FakeNet) {
        let (driver, net) = fake_driver();
        (Pool::new(driver, Box::new(|_| None)), net)
    }

    fn recording_pool() -> (Pool<FakeDriver>, FakeNet, Arc<Mutex<Vec<HookEvent>>>) {
        let (driver, net) = fake_driver();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = Pool::new(
            driver,
            Box::new(move |event| {
                sink.lock().unwrap().push(*event);
                None
            }),
        );
        (pool, net, seen)
    }

    /// Grow the initial batch by letting `poll_once` hit the stop signal.
    fn prime(pool: &mut Pool<FakeDriver>, net: &FakeNet) {
        net.raise_stop();
        assert_eq!(pool.poll_once().unwrap(), PollOutcome::Stopped);
        net.clear_stop();
    }

    fn assert_invariant(pool: &Pool<FakeDriver>) {
        assert_eq!(
            pool.free.get(),
            pool.listening(),
            "free counter diverged from listening endpoints"
        );
    }

    fn sample_event() -> HookEvent {
        HookEvent::CreateWindow {
            hwnd: WindowHandle::from_wire(0x1234),
            rect: Rect::new(0, 0, 800, 600),
        }
    }

    #[test]
    fn first_poll_grows_by_batch() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);
        assert_eq!(net.endpoints(), GROW_BATCH);
        assert_eq!(pool.free.get(), GROW_BATCH);
        assert_invariant(&pool);
    }

    #[test]
    fn connect_takes_a_free_slot() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);

        net.remote(0).connect();
        assert_eq!(pool.poll_once().unwrap(), PollOutcome::Continue);
        assert_eq!(pool.free.get(), GROW_BATCH - 1);
        assert!(!pool.endpoints[0].is_listening());
        assert_invariant(&pool);
    }

    #[test]
    fn exhausted_pool_grows_before_waiting() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);

        for slot in 0..GROW_BATCH {
            net.remote(slot).connect();
            pool.poll_once().unwrap();
        }
        assert_eq!(pool.free.get(), 0);

        // The next iteration must grow before blocking.
        net.raise_stop();
        assert_eq!(pool.poll_once().unwrap(), PollOutcome::Stopped);
        assert_eq!(net.endpoints(), GROW_BATCH * 2);
        assert_eq!(pool.free.get(), GROW_BATCH);
        assert_invariant(&pool);
    }

    #[test]
    fn event_reaches_handler_and_read_is_reissued() {
        let (mut pool, net, seen) = recording_pool();
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        let event = HookEvent::DestroyWindow {
            hwnd: WindowHandle::from_wire(7),
        };
        remote.send(&event.encode());
        pool.poll_once().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![event]);
        // Slot went straight back to reading; a second event flows too.
        remote.send(&event.encode());
        pool.poll_once().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_invariant(&pool);
    }

    #[test]
    fn response_is_written_before_next_read() {
        let (driver, net) = fake_driver();
        let mut pool = Pool::new(
            driver,
            Box::new(|event| {
                event.wants_response().then_some(HookResponse {
                    rect: Rect::new(0, 0, 1024, 768),
                })
            }),
        );
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        remote.send(&sample_event().encode());
        pool.poll_once().unwrap(); // read completion -> handler -> write issued
        pool.poll_once().unwrap(); // write completion -> next read issued

        let written = remote.take_written();
        assert_eq!(
            written,
            vec![
                HookResponse {
                    rect: Rect::new(0, 0, 1024, 768),
                }
                .encode()
                .to_vec()
            ]
        );
        assert_invariant(&pool);
    }

    #[test]
    fn end_to_end_create_window_override_bytes() {
        // Byte for byte: client sends a create-window
        // record for (0,0,800,600) and gets back the override (0,0,1024,768).
        let (driver, net) = fake_driver();
        let mut pool = Pool::new(
            driver,
            Box::new(|_| {
                Some(HookResponse {
                    rect: Rect::new(0, 0, 1024, 768),
                })
            }),
        );
        prime(&mut pool, &net);

        let remote = net.remote(3);
        remote.connect();
        pool.poll_once().unwrap();

        #[rustfmt::skip]
        let request: [u8; EVENT_WIRE_SIZE] = [
            2,                      // create-window tag
            0x34, 0x12, 0, 0,       // hwnd 0x1234
            0, 0, 0, 0,             // left 0
            0, 0, 0, 0,             // top 0
            0x20, 0x03, 0, 0,       // right 800
            0x58, 0x02, 0, 0,       // bottom 600
        ];
        remote.send(&request);
        pool.poll_once().unwrap();
        pool.poll_once().unwrap();

        #[rustfmt::skip]
        let response: [u8; 16] = [
            0, 0, 0, 0,             // left 0
            0, 0, 0, 0,             // top 0
            0x00, 0x04, 0, 0,       // right 1024
            0x00, 0x03, 0, 0,       // bottom 768
        ];
        assert_eq!(remote.take_written(), vec![response.to_vec()]);

        let applied = HookResponse::decode(&response).unwrap();
        assert_eq!(applied.rect, Rect::new(0, 0, 1024, 768));
    }

    #[test]
    fn undersized_record_is_discarded_without_reconnect() {
        let (mut pool, net, seen) = recording_pool();
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        remote.send(&[1, 2, 3]);
        pool.poll_once().unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert!(remote.is_connected());
        assert_eq!(remote.disconnects(), 0);
        // The next valid record still flows.
        let event = HookEvent::ShowWindow {
            hwnd: WindowHandle::from_wire(2),
            shown: true,
        };
        remote.send(&event.encode());
        pool.poll_once().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![event]);
    }

    #[test]
    fn unknown_tag_is_discarded_without_reconnect() {
        let (mut pool, net, seen) = recording_pool();
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        let mut wire = [0u8; EVENT_WIRE_SIZE];
        wire[0] = 0xBB;
        remote.send(&wire);
        pool.poll_once().unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert!(remote.is_connected());
        assert_invariant(&pool);
    }

    #[test]
    fn faulted_endpoint_returns_to_listening() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();
        assert_eq!(pool.free.get(), GROW_BATCH - 1);

        remote.fail_pending();
        pool.poll_once().unwrap();

        assert!(pool.endpoints[0].is_listening());
        assert!(remote.has_pending_accept());
        assert_eq!(remote.disconnects(), 1);
        assert_eq!(pool.free.get(), GROW_BATCH);
        assert_invariant(&pool);
    }

    #[test]
    fn failed_issue_recycles_once() {
        let (driver, net) = fake_driver();
        let mut pool = Pool::new(
            driver,
            Box::new(|_| {
                Some(HookResponse {
                    rect: Rect::default(),
                })
            }),
        );
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        // The response write fails at issue time; the endpoint goes back to
        // listening without retrying the write.
        remote.fail_next_begin();
        remote.send(&sample_event().encode());
        pool.poll_once().unwrap();

        assert!(pool.endpoints[0].is_listening());
        assert!(remote.has_pending_accept());
        assert!(remote.take_written().is_empty());
        assert_invariant(&pool);
    }

    #[test]
    fn queued_reconnect_completes_synchronously() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        // Client dies and a new one is already waiting when the slot is
        // recycled: the accept completes inline.
        remote.connect();
        remote.fail_pending();
        pool.poll_once().unwrap();

        assert!(!pool.endpoints[0].is_listening());
        assert!(remote.is_connected());
        assert_eq!(pool.free.get(), GROW_BATCH - 1);
        assert_invariant(&pool);
    }

    #[test]
    fn recycle_failure_is_terminal() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        remote.fail_disconnect();
        remote.fail_pending();
        assert!(matches!(pool.poll_once(), Err(ServerError::Reconnect(_))));
    }

    #[test]
    fn growth_failure_is_terminal() {
        let (mut pool, net) = noop_pool();
        net.refuse_open(true);
        net.raise_stop();
        assert!(matches!(pool.poll_once(), Err(ServerError::Growth(_))));
    }

    #[test]
    fn wait_failure_is_terminal() {
        let (mut pool, net) = noop_pool();
        prime(&mut pool, &net);
        net.fail_wait();
        assert!(matches!(pool.poll_once(), Err(ServerError::Wait(_))));
    }

    #[test]
    fn short_response_write_faults_the_endpoint() {
        let (driver, net) = fake_driver();
        let mut pool = Pool::new(
            driver,
            Box::new(|_| {
                Some(HookResponse {
                    rect: Rect::default(),
                })
            }),
        );
        prime(&mut pool, &net);

        let remote = net.remote(0);
        remote.connect();
        pool.poll_once().unwrap();

        remote.manual_writes();
        remote.send(&sample_event().encode());
        pool.poll_once().unwrap();
        remote.complete_write(Some(4));
        pool.poll_once().unwrap();

        assert!(pool.endpoints[0].is_listening());
        assert_eq!(remote.disconnects(), 1);
        assert_invariant(&pool);
    }

    #[test]
    fn invariant_holds_under_random_traffic() {
        // Deterministic xorshift so failures reproduce.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let (mut pool, net, _seen) = recording_pool();
        prime(&mut pool, &net);
        assert_invariant(&pool);

        for _ in 0..300 {
            let slot = (next() as usize) % net.endpoints();
            let remote = net.remote(slot);
            if remote.has_pending_accept() {
                remote.connect();
            } else if remote.is_connected() {
                match next() % 3 {
                    0 => remote.send(&sample_event().encode()),
                    1 => remote.send(&[0xFF; 7]),
                    _ => remote.fail_pending(),
                }
            } else {
                // Between polls a slot is always either accepting or active.
                continue;
            }
            pool.poll_once().unwrap();
            assert_invariant(&pool);
        }

        while net.pending_fires() > 0 {
            pool.poll_once().unwrap();
            assert_invariant(&pool);
        }
    }

    #[test]
    fn stop_trigger_outlives_the_pool() {
        let (driver, net) = fake_driver();
        let stop = driver.stop_trigger();
        let mut pool = Pool::new(driver, Box::new(|_| None));
        prime(&mut pool, &net);

        // A fatal error drops the pool, and the driver with it, on the poll
        // thread while the server handle still holds the trigger.
        drop(pool);
        stop.raise();
        assert!(net.stop_raised());
    }

    #[test]
    fn threaded_server_round_trip() {
        let (driver, net) = fake_driver();
        let (event_tx, event_rx) = mpsc::channel();
        let (fail_tx, fail_rx) = mpsc::channel::<ServerError>();

        let server = PipeServer::spawn(
            driver,
            move |event: &HookEvent| {
                event_tx.send(*event).unwrap();
                None
            },
            move |err| fail_tx.send(err).unwrap(),
        );

        assert!(net.wait_endpoints(GROW_BATCH, Duration::from_secs(5)));
        let remote = net.remote(0);
        remote.connect();
        let event = HookEvent::Activate {
            hwnd: WindowHandle::from_wire(0xABCD),
            caused_by_mouse: true,
        };
        remote.send(&event.encode());

        assert_eq!(
            event_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            event
        );

        drop(server);
        assert!(matches!(
            fail_rx.recv_timeout(Duration::from_millis(200)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }
}
