//! Wire protocol and shared configuration used across the winweave server,
//! the hook host and the injected hook library.
//!
//! The hook library is loaded into every process that owns a window, 32-bit
//! and 64-bit alike, so everything defined here must have a layout that does
//! not depend on pointer width. This crate is not intended to be used
//! directly by end users.

pub mod event;
pub mod handle;
pub mod ipc;

pub use event::{HookEvent, HookResponse, ProtocolError, Rect};
pub use handle::WindowHandle;
