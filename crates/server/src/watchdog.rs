//! Hook host supervision.
//!
//! The server does not install hooks itself; one helper process per
//! architecture loads the hook library and keeps it installed. The watchdog
//! keeps those helpers alive, respawning any that die within one tick, and
//! tears them down in two phases on shutdown: ask nicely by closing their
//! windows, then terminate whatever is still around when the grace period
//! runs out.

use std::{
    io,
    path::PathBuf,
    process::{Child, Command},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

/// Liveness poll period; a dead hook host is replaced within one tick.
pub const WORKER_TICK: Duration = Duration::from_secs(1);

/// How long a hook host gets to exit after its windows are closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(8);

/// Hook injection only works into processes of the same bitness, so one
/// host runs per architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerArch {
    X86,
    X64,
}

impl WorkerArch {
    pub const ALL: [WorkerArch; 2] = [WorkerArch::X86, WorkerArch::X64];

    pub fn exe_name(self) -> &'static str {
        match self {
            WorkerArch::X86 => "winweave-hook-host32.exe",
            WorkerArch::X64 => "winweave-hook-host64.exe",
        }
    }
}

/// A spawned hook host process.
pub trait WorkerHandle {
    fn pid(&self) -> u32;

    fn is_alive(&mut self) -> bool;

    /// Wait up to `timeout` for the process to exit; true when it did.
    fn wait_exit(&mut self, timeout: Duration) -> bool;

    /// Forcibly terminate; the process is reaped before returning.
    fn kill(&mut self);
}

/// Spawns and closes hook host processes. Abstracted so the supervisor logic
/// runs against scripted processes in tests.
pub trait WorkerHost: Send + 'static {
    type Worker: WorkerHandle + Send;

    fn spawn(&mut self, arch: WorkerArch, server_pid: u32) -> io::Result<Self::Worker>;

    /// Ask the given processes to exit by closing their top level windows.
    fn request_close(&mut self, pids: &[u32]);
}

/// Keeps one live worker per architecture.
pub struct Supervisor<H: WorkerHost> {
    host: H,
    server_pid: u32,
    workers: Vec<(WorkerArch, Option<H::Worker>)>,
}

impl<H: WorkerHost> Supervisor<H> {
    pub fn new(host: H, server_pid: u32) -> Self {
        Self {
            host,
            server_pid,
            workers: WorkerArch::ALL.map(|arch| (arch, None)).into(),
        }
    }

    /// Replace every dead or missing worker. A spawn failure leaves the slot
    /// empty; the next tick retries.
    pub fn tick(&mut self) {
        let Self {
            host,
            server_pid,
            workers,
        } = self;
        for (arch, slot) in workers.iter_mut() {
            if slot.as_mut().is_some_and(|worker| worker.is_alive()) {
                continue;
            }
            if let Some(dead) = slot.take() {
                warn!(pid = dead.pid(), ?arch, "hook host exited, respawning");
            }
            match host.spawn(*arch, *server_pid) {
                Ok(worker) => {
                    debug!(pid = worker.pid(), ?arch, "hook host running");
                    *slot = Some(worker);
                }
                Err(err) => warn!(?arch, %err, "failed to spawn hook host"),
            }
        }
    }

    /// Two phase teardown: close the workers' windows, give them
    /// [`SHUTDOWN_GRACE`] to unhook and exit, then terminate stragglers.
    pub fn shutdown(mut self) {
        let mut live = Vec::new();
        for (_, slot) in &mut self.workers {
            if let Some(worker) = slot.as_mut() {
                if worker.is_alive() {
                    live.push(worker.pid());
                }
            }
        }
        if live.is_empty() {
            return;
        }

        debug!(pids = ?live, "closing hook hosts");
        self.host.request_close(&live);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for (arch, slot) in &mut self.workers {
            let Some(worker) = slot.as_mut() else {
                continue;
            };
            let left = deadline.saturating_duration_since(Instant::now());
            if !worker.wait_exit(left) {
                warn!(pid = worker.pid(), ?arch, "hook host ignored close, terminating");
                worker.kill();
            }
        }
    }
}

/// Background thread driving a [`Supervisor`]. Dropping it runs the two
/// phase shutdown before returning.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn<H: WorkerHost>(host: H, server_pid: u32) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name("winweave-watchdog".into())
            .spawn(move || {
                let mut supervisor = Supervisor::new(host, server_pid);
                while !flag.load(Ordering::Relaxed) {
                    supervisor.tick();
                    let deadline = Instant::now() + WORKER_TICK;
                    while Instant::now() < deadline && !flag.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(50));
                    }
                }
                supervisor.shutdown();
            })
            .expect("spawning watchdog thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Real host: workers are executables next to the server binary, invoked
/// with the server pid as their only argument.
pub struct ProcessHost {
    dir: PathBuf,
}

impl ProcessHost {
    pub fn new() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| io::Error::other("executable has no parent directory"))?
            .to_path_buf();
        Ok(Self { dir })
    }
}

impl WorkerHost for ProcessHost {
    type Worker = ProcessWorker;

    fn spawn(&mut self, arch: WorkerArch, server_pid: u32) -> io::Result<ProcessWorker> {
        let path = self.dir.join(arch.exe_name());
        let child = Command::new(&path)
            .arg(server_pid.to_string())
            .current_dir(&self.dir)
            .spawn()?;
        Ok(ProcessWorker { child })
    }

    fn request_close(&mut self, pids: &[u32]) {
        #[cfg(windows)]
        close_windows_of(pids);
        #[cfg(not(windows))]
        let _ = pids;
    }
}

pub struct ProcessWorker {
    child: Child,
}

impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Post `WM_CLOSE` to every top level window owned by one of `pids`.
#[cfg(windows)]
fn close_windows_of(pids: &[u32]) {
    use windows::{
        Win32::{
            Foundation::{HWND, LPARAM, WPARAM},
            UI::WindowsAndMessaging::{
                EnumWindows, GetWindowThreadProcessId, PostMessageW, WM_CLOSE,
            },
        },
        core::BOOL,
    };

    unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let pids: &[u32] = unsafe { *(lparam.0 as *const &[u32]) };
        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid)) };
        if pids.contains(&pid) {
            unsafe {
                let _ = PostMessageW(Some(hwnd), WM_CLOSE, WPARAM(0), LPARAM(0));
            }
        }
        true.into()
    }

    let ctx: &[u32] = pids;
    let _ = unsafe { EnumWindows(Some(enum_proc), LPARAM(&ctx as *const &[u32] as isize)) };
}
