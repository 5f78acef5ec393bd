use core::fmt;

/// Window handle in wire form.
///
/// Native window handles are pointer sized, but the process a hook fires in
/// and the server may not share a pointer width. Handles therefore always
/// travel as unsigned 32-bit values: truncated when captured, zero-extended
/// when turned back into a native handle. Window handles only ever carry
/// 32 significant bits, so the truncation loses nothing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(u32);

impl WindowHandle {
    pub const NULL: Self = Self(0);

    /// Truncate a native pointer-sized handle into wire form.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw as u32)
    }

    /// Wrap an already-truncated wire value.
    pub const fn from_wire(value: u32) -> Self {
        Self(value)
    }

    /// Reconstruct the native handle by zero extension.
    pub const fn to_raw(self) -> usize {
        self.0 as usize
    }

    pub const fn to_wire(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
