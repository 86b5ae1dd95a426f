//! Live window registry
//!
//! The authoritative list of overlay windows, maintained by the producer side
//! (window enumeration / IPC) and read by the compositor during
//! reconciliation. Every producer mutation also posts the matching
//! `SyncEvent`, so the compositor picks the change up on its next frame.
//!
//! Two locks guard the registry:
//! - the windows lock, held by the compositor while it looks windows up
//! - the share-mem lock, held only around byte copies out of frame segments
//!
//! Lock order is windows before share-mem.

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use overlay_proto::{SyncEvent, WindowId, WindowInfo};

use crate::compositor::sync::SyncSender;

/// Find a window by id in a locked window list
pub fn find_window(windows: &[WindowInfo], window_id: WindowId) -> Option<&WindowInfo> {
    windows.iter().find(|w| w.window_id == window_id)
}

pub struct WindowRegistry {
    windows: Mutex<Vec<WindowInfo>>,
    share_mem: Mutex<()>,
    events: SyncSender,
}

impl WindowRegistry {
    pub fn new(events: SyncSender) -> Self {
        Self {
            windows: Mutex::new(Vec::new()),
            share_mem: Mutex::new(()),
            events,
        }
    }

    /// Exclusive access to the live window list
    pub fn lock_windows(&self) -> MutexGuard<'_, Vec<WindowInfo>> {
        self.windows.lock()
    }

    /// Exclusive access to frame segment contents
    pub fn lock_share_mem(&self) -> MutexGuard<'_, ()> {
        self.share_mem.lock()
    }

    #[cfg(test)]
    pub(crate) fn share_mem_locked(&self) -> bool {
        self.share_mem.is_locked()
    }

    /// Snapshot of one window
    pub fn window(&self, window_id: WindowId) -> Option<WindowInfo> {
        find_window(&self.lock_windows(), window_id).cloned()
    }

    /// Number of live windows
    pub fn len(&self) -> usize {
        self.lock_windows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_windows().is_empty()
    }

    /// A window appeared (or was re-announced with new metadata)
    pub fn window_opened(&self, window: WindowInfo) {
        let id = window.window_id;
        {
            let mut windows = self.lock_windows();
            match windows.iter_mut().find(|w| w.window_id == id) {
                Some(existing) => *existing = window,
                None => {
                    info!("Window {} opened ({})", id, window.name);
                    windows.push(window);
                }
            }
        }
        self.events.post(SyncEvent::WindowAdded { id });
    }

    /// A window closed
    pub fn window_closed(&self, window_id: WindowId) {
        let removed = {
            let mut windows = self.lock_windows();
            let before = windows.len();
            windows.retain(|w| w.window_id != window_id);
            before != windows.len()
        };
        if removed {
            info!("Window {} closed", window_id);
        } else {
            debug!("Close for unknown window {}", window_id);
        }
        self.events.post(SyncEvent::WindowClosed { id: window_id });
    }

    /// A window moved; content is untouched
    pub fn window_moved(&self, window_id: WindowId, x: i32, y: i32) {
        if let Some(window) = self.lock_windows().iter_mut().find(|w| w.window_id == window_id) {
            window.rect.x = x;
            window.rect.y = y;
        }
        self.events.post(SyncEvent::WindowMoved { id: window_id, x, y });
    }

    /// The window's frame segment now lives under a new name
    pub fn buffer_renamed(&self, window_id: WindowId, buffer_name: impl Into<String>) {
        let buffer_name = buffer_name.into();
        if let Some(window) = self.lock_windows().iter_mut().find(|w| w.window_id == window_id) {
            debug!("Window {} buffer renamed to {}", window_id, buffer_name);
            window.buffer_name = buffer_name;
        }
        self.events.post(SyncEvent::FrameBufferRenamed { id: window_id });
    }

    /// New pixels were written to the window's frame segment
    pub fn frame_buffer_changed(&self, window_id: WindowId) {
        self.events.post(SyncEvent::FrameBufferDirty { id: window_id });
    }

    /// Focus moved to a window, or was cleared
    pub fn window_focused(&self, window_id: Option<WindowId>) {
        self.events.post(SyncEvent::Focus { id: window_id });
    }
}
