//! Overlay Protocol
//!
//! Types shared between the producer process (window enumeration, frame
//! rendering into shared memory) and the in-process sprite compositor.

pub mod frame_buffer;

pub use frame_buffer::{encode_frame, FrameBufferHeader, BYTES_PER_PIXEL};

use serde::{Deserialize, Serialize};

/// Stable identity of an overlay window
pub type WindowId = u32;

/// Integer rectangle in host-surface pixel coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Right edge (exclusive)
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width.min(i32::MAX as u32) as i32)
    }

    /// Bottom edge (exclusive)
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height.min(i32::MAX as u32) as i32)
    }
}

/// Descriptor of a live overlay window, as published by the producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub window_id: WindowId,
    pub name: String,
    /// Name of the shared-memory segment currently holding the window's pixels
    pub buffer_name: String,
    pub rect: Rect,
}

// ============================================================================
// Producer → Compositor Events
// ============================================================================

/// Structural changes posted by the producer and drained once per frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// A window appeared and needs a sprite
    WindowAdded { id: WindowId },

    /// A window closed; its sprite must be evicted
    WindowClosed { id: WindowId },

    /// A window moved without changing content
    WindowMoved { id: WindowId, x: i32, y: i32 },

    /// The window's backing segment was renamed and must be re-bound
    FrameBufferRenamed { id: WindowId },

    /// The window's pixels changed and must be copied this frame
    FrameBufferDirty { id: WindowId },

    /// Focus moved to a window (or was cleared)
    Focus { id: Option<WindowId> },
}

impl SyncEvent {
    /// Window the event refers to, if any
    pub fn window_id(&self) -> Option<WindowId> {
        match *self {
            SyncEvent::WindowAdded { id }
            | SyncEvent::WindowClosed { id }
            | SyncEvent::WindowMoved { id, .. }
            | SyncEvent::FrameBufferRenamed { id }
            | SyncEvent::FrameBufferDirty { id } => Some(id),
            SyncEvent::Focus { id } => id,
        }
    }
}
