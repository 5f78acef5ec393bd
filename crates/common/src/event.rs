//! Fixed-layout encoding of hook events and their responses.
//!
//! Every record is packed little-endian with no padding between fields and a
//! size that is identical in 32-bit and 64-bit processes. There is no length
//! prefix and no version field; both ends of the channel are built from the
//! same crate and a taxonomy change is a breaking protocol change that
//! requires restarting every hook carrier.

use thiserror::Error;

use crate::handle::WindowHandle;

/// Rectangle in wire form: four signed 32-bit coordinates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub(crate) const WIRE_SIZE: usize = 16;

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    fn put(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.left.to_le_bytes());
        out[4..8].copy_from_slice(&self.top.to_le_bytes());
        out[8..12].copy_from_slice(&self.right.to_le_bytes());
        out[12..16].copy_from_slice(&self.bottom.to_le_bytes());
    }

    fn take(bytes: &[u8]) -> Self {
        let word = |at: usize| i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        Self {
            left: word(0),
            top: word(4),
            right: word(8),
            bottom: word(12),
        }
    }
}

const TAG_SHOW_WINDOW: u8 = 0;
const TAG_ACTIVATE: u8 = 1;
const TAG_CREATE_WINDOW: u8 = 2;
const TAG_DESTROY_WINDOW: u8 = 3;
const TAG_MIN_MAX: u8 = 4;
const TAG_MOVE_SIZE: u8 = 5;

/// On-wire size of every event record: one tag byte plus the largest payload
/// (a window handle followed by a rectangle). Smaller kinds are zero padded
/// up to this size so both ends always exchange whole records of one length.
pub const EVENT_WIRE_SIZE: usize = 1 + 4 + Rect::WIRE_SIZE;

/// On-wire size of a [`HookResponse`].
pub const RESPONSE_WIRE_SIZE: usize = Rect::WIRE_SIZE;

/// Signature tag accompanying raw event blobs handed to the server's control
/// window by the in-process relay path.
pub const EVENT_BLOB_SIGNATURE: usize = 0xDEAD_BEEF;

/// One observed window lifecycle event, as captured by a hook callback.
///
/// Constructed at the instant a hook fires, immutable afterwards, consumed
/// exactly once by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    /// The window was shown or hidden through a show-window call.
    ShowWindow { hwnd: WindowHandle, shown: bool },
    /// The window is about to be activated.
    Activate {
        hwnd: WindowHandle,
        caused_by_mouse: bool,
    },
    /// The window is about to be created with the given bounding rectangle.
    /// The server may answer with an overriding rectangle.
    CreateWindow { hwnd: WindowHandle, rect: Rect },
    /// The window is about to be destroyed.
    DestroyWindow { hwnd: WindowHandle },
    /// The window is about to be minimized, maximized or restored.
    MinMax {
        hwnd: WindowHandle,
        show_command: i32,
    },
    /// The window is about to be moved or resized to the given rectangle.
    /// The server may answer with an overriding rectangle.
    MoveSize { hwnd: WindowHandle, rect: Rect },
}

/// Decode failure. The offending record is dropped; the connection it
/// arrived over stays up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("record is {actual} bytes, expected {expected}")]
    MalformedRecord { expected: usize, actual: usize },
    #[error("unknown event kind tag {0}")]
    UnknownKind(u8),
    #[error("event blob signature {0:#x} does not match")]
    BadSignature(usize),
}

impl HookEvent {
    pub const fn hwnd(&self) -> WindowHandle {
        match *self {
            Self::ShowWindow { hwnd, .. }
            | Self::Activate { hwnd, .. }
            | Self::CreateWindow { hwnd, .. }
            | Self::DestroyWindow { hwnd }
            | Self::MinMax { hwnd, .. }
            | Self::MoveSize { hwnd, .. } => hwnd,
        }
    }

    /// Whether the source process blocks on a [`HookResponse`] to this event.
    pub const fn wants_response(&self) -> bool {
        matches!(self, Self::CreateWindow { .. } | Self::MoveSize { .. })
    }

    pub const fn kind_tag(&self) -> u8 {
        match self {
            Self::ShowWindow { .. } => TAG_SHOW_WINDOW,
            Self::Activate { .. } => TAG_ACTIVATE,
            Self::CreateWindow { .. } => TAG_CREATE_WINDOW,
            Self::DestroyWindow { .. } => TAG_DESTROY_WINDOW,
            Self::MinMax { .. } => TAG_MIN_MAX,
            Self::MoveSize { .. } => TAG_MOVE_SIZE,
        }
    }

    /// Encode into the fixed wire record. Total for every event kind.
    pub fn encode(&self) -> [u8; EVENT_WIRE_SIZE] {
        let mut out = [0u8; EVENT_WIRE_SIZE];
        out[0] = self.kind_tag();
        out[1..5].copy_from_slice(&self.hwnd().to_wire().to_le_bytes());
        match *self {
            Self::ShowWindow { shown, .. } => out[5] = shown as u8,
            Self::Activate {
                caused_by_mouse, ..
            } => out[5] = caused_by_mouse as u8,
            Self::CreateWindow { rect, .. } | Self::MoveSize { rect, .. } => {
                rect.put(&mut out[5..21]);
            }
            Self::DestroyWindow { .. } => {}
            Self::MinMax { show_command, .. } => {
                out[5..9].copy_from_slice(&show_command.to_le_bytes());
            }
        }
        out
    }

    /// Decode a whole wire record.
    ///
    /// The transport is message oriented, so `bytes` is always a complete
    /// message; anything that is not exactly [`EVENT_WIRE_SIZE`] long is
    /// malformed, and bytes past a kind's payload are padding and ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != EVENT_WIRE_SIZE {
            return Err(ProtocolError::MalformedRecord {
                expected: EVENT_WIRE_SIZE,
                actual: bytes.len(),
            });
        }

        let hwnd = WindowHandle::from_wire(u32::from_le_bytes(bytes[1..5].try_into().unwrap()));
        Ok(match bytes[0] {
            TAG_SHOW_WINDOW => Self::ShowWindow {
                hwnd,
                shown: bytes[5] != 0,
            },
            TAG_ACTIVATE => Self::Activate {
                hwnd,
                caused_by_mouse: bytes[5] != 0,
            },
            TAG_CREATE_WINDOW => Self::CreateWindow {
                hwnd,
                rect: Rect::take(&bytes[5..21]),
            },
            TAG_DESTROY_WINDOW => Self::DestroyWindow { hwnd },
            TAG_MIN_MAX => Self::MinMax {
                hwnd,
                show_command: i32::from_le_bytes(bytes[5..9].try_into().unwrap()),
            },
            TAG_MOVE_SIZE => Self::MoveSize {
                hwnd,
                rect: Rect::take(&bytes[5..21]),
            },
            tag => return Err(ProtocolError::UnknownKind(tag)),
        })
    }
}

/// Synchronous answer to a response-capable event, carrying the rectangle
/// the source process must apply instead of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookResponse {
    pub rect: Rect,
}

impl HookResponse {
    pub fn encode(&self) -> [u8; RESPONSE_WIRE_SIZE] {
        let mut out = [0u8; RESPONSE_WIRE_SIZE];
        self.rect.put(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != RESPONSE_WIRE_SIZE {
            return Err(ProtocolError::MalformedRecord {
                expected: RESPONSE_WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            rect: Rect::take(bytes),
        })
    }
}

/// Validate and decode a raw event blob delivered through the control
/// window's custom-data message.
///
/// The blob is accepted only when its signature matches
/// [`EVENT_BLOB_SIGNATURE`] and it is exactly one event record long.
pub fn decode_event_blob(signature: usize, bytes: &[u8]) -> Result<HookEvent, ProtocolError> {
    if signature != EVENT_BLOB_SIGNATURE {
        return Err(ProtocolError::BadSignature(signature));
    }
    HookEvent::decode(bytes)
}
