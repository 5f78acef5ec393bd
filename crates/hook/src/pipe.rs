//! Client side of the server pipe.
//!
//! One connection per hooked process, opened lazily on the first reported
//! event and dropped on any pipe error so the next event reconnects. While
//! the pipe is unreachable, events are forwarded to the server's control
//! window instead so nothing is lost across a server restart.

use std::{ffi::c_void, io};

use parking_lot::Mutex;
use tracing::{debug, warn};
use windows::{
    Win32::{
        Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE, LPARAM, WPARAM},
        Storage::FileSystem::{
            CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE, OPEN_EXISTING, WriteFile,
        },
        System::{
            DataExchange::COPYDATASTRUCT,
            Pipes::{PIPE_READMODE_MESSAGE, SetNamedPipeHandleState, TransactNamedPipe},
        },
        UI::WindowsAndMessaging::{FindWindowExW, HWND_MESSAGE, SendMessageW, WM_COPYDATA},
    },
    core::{PCWSTR, w},
};
use winweave_common::{
    event::{EVENT_BLOB_SIGNATURE, HookEvent, HookResponse, RESPONSE_WIRE_SIZE},
    ipc::pipe_addr,
};

use crate::shared;

static PIPE: Mutex<Option<ServerPipe>> = Mutex::new(None);

/// Report `event` to the server. Returns the server's answer for
/// response-capable events, `None` otherwise or when no server is
/// reachable.
pub fn report(event: &HookEvent) -> Option<HookResponse> {
    let pid = shared::server_pid();
    if pid == 0 {
        return None;
    }

    let mut slot = PIPE.lock();
    if slot.as_ref().is_some_and(|pipe| pipe.server_pid != pid) {
        *slot = None;
    }
    if slot.is_none() {
        match ServerPipe::connect(pid) {
            Ok(pipe) => {
                debug!(pid, "connected to server pipe");
                *slot = Some(pipe);
            }
            Err(err) => {
                warn!(pid, %err, "cannot reach server pipe, forwarding via control window");
                forward_to_control_window(event);
                return None;
            }
        }
    }
    let Some(pipe) = slot.as_ref() else {
        return None;
    };

    let outcome = if event.wants_response() {
        pipe.transact(event).map(Some)
    } else {
        pipe.send(event).map(|()| None)
    };
    match outcome {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "server pipe failed, dropping connection");
            *slot = None;
            None
        }
    }
}

struct ServerPipe {
    handle: HANDLE,
    server_pid: u32,
}

// The handle is only used under the module mutex.
unsafe impl Send for ServerPipe {}

impl ServerPipe {
    fn connect(server_pid: u32) -> io::Result<Self> {
        let addr: Vec<u16> = pipe_addr(server_pid)
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR::from_raw(addr.as_ptr()),
                GENERIC_READ.0 | GENERIC_WRITE.0,
                FILE_SHARE_MODE(0),
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                None,
            )
        }
        .map_err(io::Error::from)?;

        let mode = PIPE_READMODE_MESSAGE;
        if let Err(err) = unsafe { SetNamedPipeHandleState(handle, Some(&mode), None, None) } {
            unsafe {
                let _ = CloseHandle(handle);
            }
            return Err(err.into());
        }
        Ok(Self { handle, server_pid })
    }

    /// Fire and forget; one message per event record.
    fn send(&self, event: &HookEvent) -> io::Result<()> {
        let wire = event.encode();
        let mut written = 0u32;
        unsafe { WriteFile(self.handle, Some(&wire), Some(&mut written), None) }
            .map_err(io::Error::from)?;
        if written as usize != wire.len() {
            return Err(io::Error::other("short pipe write"));
        }
        Ok(())
    }

    /// Send the record and block for the server's response in one round
    /// trip. The hooked thread stalls here until the server answers, which
    /// is what lets the answer take effect before the window changes.
    fn transact(&self, event: &HookEvent) -> io::Result<HookResponse> {
        let wire = event.encode();
        let mut reply = [0u8; RESPONSE_WIRE_SIZE];
        let mut got = 0u32;
        unsafe {
            TransactNamedPipe(
                self.handle,
                Some(wire.as_ptr() as *const c_void),
                wire.len() as u32,
                Some(reply.as_mut_ptr() as *mut c_void),
                reply.len() as u32,
                &mut got,
                None,
            )
        }
        .map_err(io::Error::from)?;
        HookResponse::decode(&reply[..got as usize]).map_err(io::Error::other)
    }
}

impl Drop for ServerPipe {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

/// Last resort delivery: hand the encoded record to the server's control
/// window as tagged copy-data. Response-capable events lose their response
/// this way, but the server still observes the change.
fn forward_to_control_window(event: &HookEvent) {
    // The control window is message-only, so the search has to start under
    // HWND_MESSAGE; top level enumeration never sees it.
    let Ok(hwnd) = (unsafe {
        FindWindowExW(
            Some(HWND_MESSAGE),
            None,
            w!("winweave-control"),
            PCWSTR::null(),
        )
    }) else {
        return;
    };
    let wire = event.encode();
    let data = COPYDATASTRUCT {
        dwData: EVENT_BLOB_SIGNATURE,
        cbData: wire.len() as u32,
        lpData: wire.as_ptr() as *mut c_void,
    };
    unsafe {
        SendMessageW(
            hwnd,
            WM_COPYDATA,
            Some(WPARAM(0)),
            Some(LPARAM(&data as *const COPYDATASTRUCT as isize)),
        );
    }
}
