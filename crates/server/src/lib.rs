//! The winweave server library.
//!
//! Hook callbacks fire inside foreign processes; an injected library encodes
//! each one as a fixed-size record and writes it to this server over a named
//! channel. The pieces here are the channel multiplexer ([`server`] on top of
//! [`channel`]), the supervisor keeping the hook-carrier worker processes
//! alive ([`watchdog`]), and the per-listener fan-out of decoded events
//! ([`fanout`], consumed by e.g. [`window_list`]).
//!
//! Everything is written against injectable driver traits; the Windows
//! bindings live in the `windows`-gated submodules.

pub mod channel;
pub mod fanout;
pub mod server;
pub mod watchdog;
pub mod window_list;
#[cfg(windows)]
pub mod winloop;
