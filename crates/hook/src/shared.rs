//! The cross-process server pid cell.
//!
//! One 32 bit cell in a shared data section: every process that maps this
//! library sees the same value. The hook host writes it once before the
//! hooks go in; everything else only reads. Zero means no server is
//! configured and the hooks stay silent.

use core::sync::atomic::{AtomicU32, Ordering};

#[unsafe(no_mangle)]
#[unsafe(link_section = ".shared")]
static SERVER_PID: AtomicU32 = AtomicU32::new(0);

pub fn server_pid() -> u32 {
    SERVER_PID.load(Ordering::Acquire)
}

pub fn set_server_pid(pid: u32) {
    SERVER_PID.store(pid, Ordering::Release);
}
