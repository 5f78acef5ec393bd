//! The hook host.
//!
//! One instance runs per architecture, spawned and supervised by the
//! server's watchdog with the server pid as its only argument. It loads the
//! hook library of its own bitness, publishes the server pid through the
//! library's shared cell, installs the hooks and then pumps messages so
//! they stay installed. A hidden top level window gives the watchdog a
//! graceful way to shut it down, and a monitor thread closes that window
//! itself when the server disappears.

#[cfg(not(windows))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("the winweave hook host only runs on Windows");
}

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    win::run()
}

#[cfg(windows)]
mod win {
    use std::{ffi::c_void, mem, thread};

    use anyhow::{Context, bail};
    use tracing::{debug, info, level_filters::LevelFilter, warn};
    use windows::{
        Win32::{
            Foundation::{CloseHandle, HMODULE, HWND, LPARAM, LRESULT, WAIT_OBJECT_0, WPARAM},
            System::{
                LibraryLoader::{GetModuleHandleW, GetProcAddress, LoadLibraryW},
                Threading::{OpenProcess, PROCESS_SYNCHRONIZE, WaitForSingleObject},
            },
            UI::WindowsAndMessaging::{
                CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
                HHOOK, HWND_DESKTOP, MSG, PostMessageW, PostQuitMessage, RegisterClassW,
                SetWindowsHookExW, TranslateMessage, UnhookWindowsHookEx, WH_CALLWNDPROC, WH_CBT,
                WINDOW_EX_STYLE, WM_CLOSE, WM_DESTROY, WNDCLASSW, WS_POPUP,
            },
        },
        core::{PCSTR, PCWSTR, w},
    };

    /// How often the server process is checked for liveness.
    const SERVER_POLL_MS: u32 = 500;

    #[cfg(target_pointer_width = "64")]
    const HOOK_DLL: &str = "winweave-hook64.dll";
    #[cfg(target_pointer_width = "32")]
    const HOOK_DLL: &str = "winweave-hook32.dll";

    type SetServerPid = unsafe extern "system" fn(u32);
    type HookFn = unsafe extern "system" fn(i32, WPARAM, LPARAM) -> LRESULT;

    pub fn run() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .init();

        let server_pid: u32 = std::env::args()
            .nth(1)
            .context("missing server pid argument")?
            .parse()
            .context("server pid argument is not a pid")?;
        info!(server_pid, dll = HOOK_DLL, "hook host starting");

        let hooks = Hooks::install(server_pid)?;
        let window = create_host_window()?;
        spawn_server_monitor(server_pid, window);

        pump_messages()?;

        info!("hook host shutting down");
        hooks.remove();
        Ok(())
    }

    struct Hooks {
        cbt: HHOOK,
        call_wnd_proc: HHOOK,
        set_server_pid: SetServerPid,
    }

    impl Hooks {
        /// Load the hook library, publish the server pid through it and
        /// install both global hooks.
        fn install(server_pid: u32) -> anyhow::Result<Self> {
            let dll_path = {
                let exe = std::env::current_exe().context("resolving own path")?;
                let dir = exe.parent().context("executable has no parent directory")?;
                dir.join(HOOK_DLL)
            };
            let wide: Vec<u16> = dll_path
                .as_os_str()
                .to_string_lossy()
                .encode_utf16()
                .chain(std::iter::once(0))
                .collect();
            let module = unsafe { LoadLibraryW(PCWSTR::from_raw(wide.as_ptr())) }
                .with_context(|| format!("loading {}", dll_path.display()))?;

            let set_server_pid: SetServerPid =
                unsafe { mem::transmute(export(module, "winweave_set_server_pid")?) };
            let cbt_proc: HookFn =
                unsafe { mem::transmute(export(module, "winweave_cbt_proc")?) };
            let call_proc: HookFn =
                unsafe { mem::transmute(export(module, "winweave_callwndproc_proc")?) };

            // The pid must be visible before any hook can fire.
            unsafe { set_server_pid(server_pid) };

            let cbt = unsafe { SetWindowsHookExW(WH_CBT, Some(cbt_proc), Some(module.into()), 0) }
                .context("installing CBT hook")?;
            let call_wnd_proc = match unsafe {
                SetWindowsHookExW(WH_CALLWNDPROC, Some(call_proc), Some(module.into()), 0)
            } {
                Ok(hook) => hook,
                Err(err) => {
                    unsafe {
                        let _ = UnhookWindowsHookEx(cbt);
                        set_server_pid(0);
                    }
                    return Err(err).context("installing call-window-procedure hook");
                }
            };
            debug!("hooks installed");
            Ok(Self {
                cbt,
                call_wnd_proc,
                set_server_pid,
            })
        }

        /// Uninstall both hooks and zero the shared pid so processes that
        /// still have the library mapped fall silent.
        fn remove(self) {
            unsafe {
                let _ = UnhookWindowsHookEx(self.cbt);
                let _ = UnhookWindowsHookEx(self.call_wnd_proc);
                (self.set_server_pid)(0);
            }
        }
    }

    fn export(
        module: HMODULE,
        name: &str,
    ) -> anyhow::Result<unsafe extern "system" fn() -> isize> {
        let symbol = format!("{name}\0");
        unsafe { GetProcAddress(module, PCSTR(symbol.as_ptr())) }
            .with_context(|| format!("hook library is missing export {name}"))
    }

    /// Hidden but enumerable top level window; the watchdog closes it to
    /// shut this host down.
    fn create_host_window() -> anyhow::Result<HWND> {
        extern "system" fn host_proc(
            hwnd: HWND,
            msg: u32,
            wparam: WPARAM,
            lparam: LPARAM,
        ) -> LRESULT {
            match msg {
                WM_CLOSE => {
                    unsafe {
                        let _ = DestroyWindow(hwnd);
                    }
                    LRESULT(0)
                }
                WM_DESTROY => {
                    unsafe { PostQuitMessage(0) };
                    LRESULT(0)
                }
                _ => unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) },
            }
        }

        const CLASS_NAME: PCWSTR = w!("winweave-hook-host");
        unsafe {
            let hinstance = GetModuleHandleW(None).context("resolving module handle")?;
            let _ = RegisterClassW(&WNDCLASSW {
                hInstance: hinstance.into(),
                lpszClassName: CLASS_NAME,
                lpfnWndProc: Some(host_proc),
                ..Default::default()
            });
            let hwnd = CreateWindowExW(
                WINDOW_EX_STYLE(0),
                CLASS_NAME,
                w!("winweave hook host"),
                WS_POPUP,
                0,
                0,
                0,
                0,
                Some(HWND_DESKTOP),
                None,
                Some(hinstance.into()),
                None,
            )
            .context("creating host window")?;
            Ok(hwnd)
        }
    }

    /// Watch the server process and close our window when it exits, which
    /// unwinds the message loop and uninstalls the hooks.
    fn spawn_server_monitor(server_pid: u32, window: HWND) {
        let target = window.0 as isize;
        thread::spawn(move || {
            let close = |reason: &str| {
                warn!(server_pid, "{reason}, closing");
                unsafe {
                    let _ = PostMessageW(
                        Some(HWND(target as *mut c_void)),
                        WM_CLOSE,
                        WPARAM(0),
                        LPARAM(0),
                    );
                }
            };

            let Ok(server) = (unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, server_pid) })
            else {
                close("server process not found");
                return;
            };
            loop {
                let fired = unsafe { WaitForSingleObject(server, SERVER_POLL_MS) };
                if fired == WAIT_OBJECT_0 {
                    close("server process exited");
                    break;
                }
            }
            unsafe {
                let _ = CloseHandle(server);
            }
        });
    }

    fn pump_messages() -> anyhow::Result<()> {
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
