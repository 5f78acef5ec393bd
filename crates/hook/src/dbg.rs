//! `tracing` output for processes without a console.
//!
//! The library ends up inside arbitrary GUI applications, so log lines go
//! to the debugger output stream (`OutputDebugStringW`), readable with
//! DebugView or an attached debugger.

use std::io::{self, Write};

use parking_lot::{Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use windows::{Win32::System::Diagnostics::Debug::OutputDebugStringW, core::PCWSTR};

pub struct WinDbgMakeWriter {
    line: Mutex<Vec<u8>>,
}

impl WinDbgMakeWriter {
    pub fn new() -> Self {
        Self {
            line: Mutex::new(Vec::new()),
        }
    }
}

impl<'a> MakeWriter<'a> for WinDbgMakeWriter {
    type Writer = WinDbgWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        WinDbgWriter {
            line: self.line.lock(),
        }
    }
}

pub struct WinDbgWriter<'a> {
    line: MutexGuard<'a, Vec<u8>>,
}

impl Write for WinDbgWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for WinDbgWriter<'_> {
    fn drop(&mut self) {
        let mut wide: Vec<u16> = String::from_utf8_lossy(&self.line).encode_utf16().collect();
        wide.push(0);
        unsafe {
            OutputDebugStringW(PCWSTR(wide.as_ptr()));
        }
        self.line.clear();
    }
}
