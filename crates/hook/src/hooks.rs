//! The exported hook procedures.
//!
//! A CBT hook covers create, destroy, activate, min-max and move-size; a
//! call-window-procedure hook covers show and hide. Both run on the hooked
//! thread, so the filter has to be cheap: only unowned, captioned top
//! level windows are reported. Create and move-size apply the server's rectangle in
//! place, before the window system acts on the original one.

use std::ffi::c_void;

use tracing::trace;
use windows::Win32::{
    Foundation::{HWND, LPARAM, LRESULT, RECT, WPARAM},
    UI::WindowsAndMessaging::{
        CBT_CREATEWNDW, CBTACTIVATESTRUCT, CWPSTRUCT, CallNextHookEx, GW_OWNER, GWL_EXSTYLE,
        GWL_STYLE, GetWindow, GetWindowLongW, HCBT_ACTIVATE, HCBT_CREATEWND, HCBT_DESTROYWND,
        HCBT_MINMAX, HCBT_MOVESIZE, WM_SHOWWINDOW, WS_CAPTION, WS_CHILD, WS_EX_TOOLWINDOW,
    },
};
use winweave_common::{
    event::{HookEvent, Rect},
    handle::WindowHandle,
};

use crate::pipe;

fn handle_of(hwnd: HWND) -> WindowHandle {
    WindowHandle::from_raw(hwnd.0 as usize)
}

fn hwnd_of(wparam: WPARAM) -> HWND {
    HWND(wparam.0 as *mut c_void)
}

/// Style portion of the worthiness check: top level, captioned, not a
/// tool window. Visibility is deliberately not part of it; at
/// `HCBT_CREATEWND` the window has not been shown yet, so a visibility
/// test there would reject everything.
fn worthy_style(style: u32, ex_style: u32) -> bool {
    if style & WS_CHILD.0 != 0 {
        return false;
    }
    if style & WS_CAPTION.0 != WS_CAPTION.0 {
        return false;
    }
    ex_style & WS_EX_TOOLWINDOW.0 == 0
}

/// Unowned, captioned top level windows are the ones a tiling layout
/// manages.
fn manageable(hwnd: HWND) -> bool {
    let style = unsafe { GetWindowLongW(hwnd, GWL_STYLE) } as u32;
    let ex_style = unsafe { GetWindowLongW(hwnd, GWL_EXSTYLE) } as u32;
    if !worthy_style(style, ex_style) {
        return false;
    }
    unsafe { GetWindow(hwnd, GW_OWNER) }.is_err()
}

/// # Safety
/// Installed through `SetWindowsHookExW` only.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn winweave_cbt_proc(
    code: i32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if code >= 0 {
        match code as u32 {
            HCBT_CREATEWND => unsafe { on_create(wparam, lparam) },
            HCBT_DESTROYWND => {
                let hwnd = hwnd_of(wparam);
                if manageable(hwnd) {
                    let _ = pipe::report(&HookEvent::DestroyWindow {
                        hwnd: handle_of(hwnd),
                    });
                }
            }
            HCBT_ACTIVATE => {
                let hwnd = hwnd_of(wparam);
                if manageable(hwnd) {
                    let activate = unsafe { &*(lparam.0 as *const CBTACTIVATESTRUCT) };
                    let _ = pipe::report(&HookEvent::Activate {
                        hwnd: handle_of(hwnd),
                        caused_by_mouse: activate.fMouse.as_bool(),
                    });
                }
            }
            HCBT_MINMAX => {
                let hwnd = hwnd_of(wparam);
                if manageable(hwnd) {
                    let _ = pipe::report(&HookEvent::MinMax {
                        hwnd: handle_of(hwnd),
                        show_command: lparam.0 as i32,
                    });
                }
            }
            HCBT_MOVESIZE => unsafe { on_move_size(wparam, lparam) },
            _ => {}
        }
    }
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

/// # Safety
/// Installed through `SetWindowsHookExW` only.
#[unsafe(no_mangle)]
pub unsafe extern "system" fn winweave_callwndproc_proc(
    code: i32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if code >= 0 {
        let cwp = unsafe { &*(lparam.0 as *const CWPSTRUCT) };
        if cwp.message == WM_SHOWWINDOW && manageable(cwp.hwnd) {
            let _ = pipe::report(&HookEvent::ShowWindow {
                hwnd: handle_of(cwp.hwnd),
                shown: cwp.wParam.0 != 0,
            });
        }
    }
    unsafe { CallNextHookEx(None, code, wparam, lparam) }
}

unsafe fn on_create(wparam: WPARAM, lparam: LPARAM) {
    let create = unsafe { &*(lparam.0 as *const CBT_CREATEWNDW) };
    let cs = unsafe { &mut *create.lpcs };
    if !worthy_style(cs.style as u32, cs.dwExStyle) {
        return;
    }

    let hwnd = handle_of(hwnd_of(wparam));
    let rect = Rect::new(cs.x, cs.y, cs.x + cs.cx, cs.y + cs.cy);
    trace!(%hwnd, ?rect, "window creating");
    if let Some(response) = pipe::report(&HookEvent::CreateWindow { hwnd, rect }) {
        cs.x = response.rect.left;
        cs.y = response.rect.top;
        cs.cx = response.rect.width();
        cs.cy = response.rect.height();
    }
}

unsafe fn on_move_size(wparam: WPARAM, lparam: LPARAM) {
    let hwnd = hwnd_of(wparam);
    if !manageable(hwnd) {
        return;
    }
    let bounds = unsafe { &mut *(lparam.0 as *mut RECT) };
    let rect = Rect::new(bounds.left, bounds.top, bounds.right, bounds.bottom);
    if let Some(response) = pipe::report(&HookEvent::MoveSize {
        hwnd: handle_of(hwnd),
        rect,
    }) {
        bounds.left = response.rect.left;
        bounds.top = response.rect.top;
        bounds.right = response.rect.right;
        bounds.bottom = response.rect.bottom;
    }
}
