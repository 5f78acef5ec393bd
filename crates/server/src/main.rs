//! The winweave server binary.
//!
//! Hosts the pipe server, the hook host watchdog and the control window
//! message loop in one process. Hook libraries in other processes find the
//! pipe through this process id, so everything is keyed off `process::id()`.

#[cfg(not(windows))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("the winweave server only runs on Windows");
}

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    win::run()
}

#[cfg(windows)]
mod win {
    use std::{sync::Arc, thread, time::Duration};

    use anyhow::Context;
    use tracing::{debug, error, info, level_filters::LevelFilter};
    use winweave_common::{
        event::{HookEvent, HookResponse},
        ipc::pipe_addr,
    };
    use winweave_server::{
        channel::windows::NamedPipeDriver,
        fanout::Broadcaster,
        server::PipeServer,
        watchdog::{ProcessHost, Watchdog},
        window_list::WindowList,
        winloop::ControlWindow,
    };

    pub fn run() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_thread_ids(true)
            .with_max_level(LevelFilter::DEBUG)
            .init();

        let pid = std::process::id();
        info!(pid, "winweave server starting");

        let broadcaster = Arc::new(Broadcaster::new());
        let window = ControlWindow::create(broadcaster.clone())?;
        let control = window.handle();

        spawn_window_tracker(&broadcaster);

        let driver =
            NamedPipeDriver::new(&pipe_addr(pid)).context("creating named pipe driver")?;
        let publish = broadcaster.clone();
        let _server = PipeServer::spawn(
            driver,
            move |event| {
                publish.publish(event);
                respond(event)
            },
            move |err| {
                error!("channel server died: {err}");
                control.close();
            },
        );

        let _watchdog = Watchdog::spawn(ProcessHost::new()?, pid);

        window.run()?;
        info!("winweave server shutting down");
        Ok(())
    }

    /// Default placement policy: hand the source process its own rectangle
    /// back. A layout engine layered on top replaces this.
    fn respond(event: &HookEvent) -> Option<HookResponse> {
        match *event {
            HookEvent::CreateWindow { rect, .. } | HookEvent::MoveSize { rect, .. } => {
                Some(HookResponse { rect })
            }
            _ => None,
        }
    }

    fn spawn_window_tracker(broadcaster: &Arc<Broadcaster>) {
        let mut list = WindowList::attach(broadcaster);
        thread::Builder::new()
            .name("winweave-windows".into())
            .spawn(move || {
                let mut known = 0;
                loop {
                    list.sync();
                    if list.len() != known {
                        known = list.len();
                        debug!(windows = known, focused = ?list.focused(), "window set changed");
                    }
                    thread::sleep(Duration::from_millis(250));
                }
            })
            .expect("spawning window tracker thread");
    }
}
