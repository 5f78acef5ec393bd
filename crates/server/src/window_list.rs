//! Window bookkeeping over the event stream.
//!
//! A [`WindowList`] is a fan-out listener that folds hook events into the
//! server's picture of the managed windows: which exist, where they are,
//! whether they are visible, and which one holds focus.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;
use winweave_common::event::{HookEvent, Rect};
use winweave_common::handle::WindowHandle;

use crate::fanout::{Broadcaster, EventQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowEntry {
    pub rect: Rect,
    pub shown: bool,
    /// Last requested show command, from the min-max hook.
    pub show_command: i32,
}

pub struct WindowList {
    queue: Arc<EventQueue>,
    windows: HashMap<WindowHandle, WindowEntry>,
    focused: Option<WindowHandle>,
}

impl WindowList {
    pub fn attach(broadcaster: &Broadcaster) -> Self {
        Self {
            queue: broadcaster.register(),
            windows: HashMap::new(),
            focused: None,
        }
    }

    /// Drain the queue and fold every pending event into the list.
    pub fn sync(&mut self) {
        while let Some(event) = self.queue.pop() {
            self.apply(&event);
        }
    }

    fn apply(&mut self, event: &HookEvent) {
        trace!(?event, "applying to window list");
        match *event {
            HookEvent::CreateWindow { hwnd, rect } => {
                self.windows.insert(
                    hwnd,
                    WindowEntry {
                        rect,
                        shown: true,
                        show_command: 0,
                    },
                );
            }
            HookEvent::DestroyWindow { hwnd } => {
                self.windows.remove(&hwnd);
                if self.focused == Some(hwnd) {
                    self.focused = None;
                }
            }
            HookEvent::MoveSize { hwnd, rect } => {
                if let Some(entry) = self.windows.get_mut(&hwnd) {
                    entry.rect = rect;
                }
            }
            HookEvent::ShowWindow { hwnd, shown } => {
                if let Some(entry) = self.windows.get_mut(&hwnd) {
                    entry.shown = shown;
                }
            }
            HookEvent::Activate { hwnd, .. } => {
                if hwnd.is_null() {
                    self.focused = None;
                } else {
                    self.focused = Some(hwnd);
                }
            }
            HookEvent::MinMax { hwnd, show_command } => {
                if let Some(entry) = self.windows.get_mut(&hwnd) {
                    entry.show_command = show_command;
                }
            }
        }
    }

    pub fn get(&self, hwnd: WindowHandle) -> Option<&WindowEntry> {
        self.windows.get(&hwnd)
    }

    pub fn focused(&self) -> Option<WindowHandle> {
        self.focused
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WindowHandle, &WindowEntry)> {
        self.windows.iter().map(|(hwnd, entry)| (*hwnd, entry))
    }
}
