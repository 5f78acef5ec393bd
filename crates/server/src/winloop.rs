//! Control window and message loop.
//!
//! Hook hosts cannot always reach the pipe (events raised while their own
//! pipe endpoint is being recycled, or before it ever connected); those are
//! forwarded as tagged data blobs to a message-only control window owned by
//! the server's main thread. The window validates each blob and publishes
//! the decoded event to the fan-out, then the loop goes back to sleep in
//! `GetMessageW`.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{debug, warn};
use windows::{
    Win32::{
        Foundation::{HWND, LPARAM, LRESULT, WPARAM},
        System::{DataExchange::COPYDATASTRUCT, LibraryLoader::GetModuleHandleW},
        UI::WindowsAndMessaging::{
            CreateWindowExW, DefWindowProcW, DispatchMessageW, GWLP_USERDATA, GetMessageW,
            GetWindowLongPtrW, HWND_MESSAGE, MSG, PostMessageW, PostQuitMessage, RegisterClassW,
            SetWindowLongPtrW, TranslateMessage, WINDOW_EX_STYLE, WM_CLOSE, WM_COPYDATA,
            WM_DESTROY, WM_NCDESTROY, WNDCLASSW, WS_POPUP,
        },
    },
    core::{PCWSTR, w},
};
use winweave_common::event::decode_event_blob;

use crate::fanout::Broadcaster;

const CLASS_NAME: PCWSTR = w!("winweave-control");

/// The server's message-only control window.
///
/// Owned by the thread that created it; other threads stop the loop through
/// a [`ControlHandle`].
pub struct ControlWindow {
    hwnd: HWND,
}

/// Cross-thread handle that can close the control window.
#[derive(Clone, Copy)]
pub struct ControlHandle {
    hwnd: isize,
}

// A window handle is a thread-agnostic kernel reference; only posting to it
// happens off the owning thread.
unsafe impl Send for ControlHandle {}
unsafe impl Sync for ControlHandle {}

impl ControlHandle {
    /// Ask the loop to exit; safe from any thread.
    pub fn close(&self) {
        unsafe {
            let _ = PostMessageW(
                Some(HWND(self.hwnd as _)),
                WM_CLOSE,
                WPARAM(0),
                LPARAM(0),
            );
        }
    }
}

impl ControlWindow {
    /// Create the window and wire incoming event blobs to `broadcaster`.
    pub fn create(broadcaster: Arc<Broadcaster>) -> anyhow::Result<Self> {
        unsafe {
            let hinstance = GetModuleHandleW(None).context("resolving module handle")?;

            // Re-registration after a previous window is fine; the failure
            // is reported on create instead.
            let _ = RegisterClassW(&WNDCLASSW {
                hInstance: hinstance.into(),
                lpszClassName: CLASS_NAME,
                lpfnWndProc: Some(control_proc),
                ..Default::default()
            });

            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE(0),
                CLASS_NAME,
                w!("winweave control"),
                WS_POPUP,
                0,
                0,
                0,
                0,
                Some(HWND_MESSAGE),
                None,
                Some(hinstance.into()),
                None,
            )
            .context("creating control window")?;

            SetWindowLongPtrW(hwnd, GWLP_USERDATA, Arc::into_raw(broadcaster) as isize);
            debug!(hwnd = ?hwnd.0, "control window created");
            Ok(Self { hwnd })
        }
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            hwnd: self.hwnd.0 as isize,
        }
    }

    /// Pump messages until the window is closed.
    pub fn run(&self) -> anyhow::Result<()> {
        let mut msg = MSG::default();
        loop {
            let ret = unsafe { GetMessageW(&mut msg, None, 0, 0) };
            match ret.0 {
                0 => return Ok(()),
                -1 => bail!("GetMessageW failed: {}", std::io::Error::last_os_error()),
                _ => unsafe {
                    let _ = TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                },
            }
        }
    }
}

fn broadcaster_of(hwnd: HWND) -> Option<&'static Broadcaster> {
    let raw = unsafe { GetWindowLongPtrW(hwnd, GWLP_USERDATA) };
    if raw == 0 {
        return None;
    }
    Some(unsafe { &*(raw as *const Broadcaster) })
}

extern "system" fn control_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    match msg {
        WM_COPYDATA => {
            // The sender is an arbitrary process; nothing about the payload
            // can be trusted, including the pointers themselves.
            let Some(data) = (unsafe { (lparam.0 as *const COPYDATASTRUCT).as_ref() }) else {
                return LRESULT(0);
            };
            if data.lpData.is_null() {
                warn!("rejected event blob with no payload");
                return LRESULT(0);
            }
            let bytes = unsafe {
                std::slice::from_raw_parts(data.lpData as *const u8, data.cbData as usize)
            };
            let Some(broadcaster) = broadcaster_of(hwnd) else {
                return LRESULT(0);
            };
            match decode_event_blob(data.dwData, bytes) {
                Ok(event) => {
                    broadcaster.publish(&event);
                    LRESULT(1)
                }
                Err(err) => {
                    warn!(%err, "rejected forwarded event blob");
                    LRESULT(0)
                }
            }
        }
        WM_DESTROY => {
            unsafe { PostQuitMessage(0) };
            LRESULT(0)
        }
        WM_NCDESTROY => {
            let raw = unsafe { SetWindowLongPtrW(hwnd, GWLP_USERDATA, 0) };
            if raw != 0 {
                drop(unsafe { Arc::from_raw(raw as *const Broadcaster) });
            }
            unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
        }
        _ => unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) },
    }
}
