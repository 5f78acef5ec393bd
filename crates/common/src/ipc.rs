//! Channel addressing.

/// Name of the server's event channel.
///
/// The name is derived from the server's process id so a hook carrier
/// started with that pid as its sole argument, and every injected copy of
/// the hook library, can locate the right server without any discovery step.
/// One server per machine; the hook library's shared pid cell carries the
/// pid into injected processes.
pub fn pipe_addr(server_pid: u32) -> String {
    format!(r"\\.\pipe\winweave-{server_pid}")
}
