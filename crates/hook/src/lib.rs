//! The winweave hook library.
//!
//! Loaded into every desktop process by the hook hosts. The exported hook
//! procedures watch window lifecycle messages and report them to the server
//! over its named pipe; create and move events block on the server's reply
//! and apply the rectangle it dictates before the window ever appears.
//!
//! The library stays passive while the shared server pid cell is zero, so a
//! load that only happens because some process received a hooked message
//! before the host configured anything costs nothing.

#![cfg(windows)]

mod dbg;
mod hooks;
mod pipe;
mod shared;

use windows::Win32::{Foundation::HINSTANCE, System::SystemServices::DLL_PROCESS_ATTACH};

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
/// # Safety
/// Can be called by loader only. Must not be called manually.
pub unsafe extern "system" fn DllMain(_module: HINSTANCE, fdw_reason: u32, _: *mut ()) -> bool {
    #[cfg(debug_assertions)]
    fn setup_tracing() {
        use tracing::level_filters::LevelFilter;

        use crate::dbg::WinDbgMakeWriter;

        tracing_subscriber::fmt::fmt()
            .with_ansi(false)
            .with_thread_ids(true)
            .with_max_level(LevelFilter::TRACE)
            .with_writer(WinDbgMakeWriter::new())
            .init();
    }

    if fdw_reason == DLL_PROCESS_ATTACH {
        #[cfg(debug_assertions)]
        setup_tracing();
    }
    true
}

/// Called by the hook host, exactly once, before installing any hook.
/// Every process the library is mapped into sees the pid through the
/// shared section from then on.
#[unsafe(no_mangle)]
pub extern "system" fn winweave_set_server_pid(pid: u32) {
    shared::set_server_pid(pid);
}
