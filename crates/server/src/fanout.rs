//! Event fan-out.
//!
//! The poll thread publishes every decoded event to all registered
//! listeners through bounded lock-free queues, one per listener, so a slow
//! listener can never block the server or starve the others: when its queue
//! is full, events are dropped for that listener alone.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use tracing::warn;
use winweave_common::event::HookEvent;

/// Events buffered per listener before new ones are dropped for it.
pub const QUEUE_CAPACITY: usize = 512;

/// One listener's bounded event queue. Any thread holding the broadcaster
/// may push (the poll thread and the control window's message loop both
/// do); the registered listener drains.
pub struct EventQueue {
    queue: ArrayQueue<HookEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(QUEUE_CAPACITY),
        }
    }

    fn push(&self, event: HookEvent) {
        if self.queue.push(event).is_err() {
            warn!(?event, "listener queue full, dropping event");
        }
    }

    pub fn pop(&self) -> Option<HookEvent> {
        self.queue.pop()
    }

    /// Drain everything currently queued through `visit`, in arrival order.
    pub fn drain(&self, mut visit: impl FnMut(HookEvent)) {
        while let Some(event) = self.queue.pop() {
            visit(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Fans each published event out to every registered queue.
#[derive(Default)]
pub struct Broadcaster {
    listeners: RwLock<Vec<Arc<EventQueue>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener and hand back its queue.
    pub fn register(&self) -> Arc<EventQueue> {
        let queue = Arc::new(EventQueue::new());
        self.listeners.write().push(queue.clone());
        queue
    }

    pub fn publish(&self, event: &HookEvent) {
        for listener in self.listeners.read().iter() {
            listener.push(*event);
        }
    }
}
