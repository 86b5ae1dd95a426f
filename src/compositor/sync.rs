//! Sync mailbox
//!
//! Producers post `SyncEvent`s from any thread. Once per frame the compositor
//! drains everything that was pending when the drain started into a
//! `SyncBatch` and reconciles it without holding any producer-visible lock.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use overlay_proto::{SyncEvent, WindowId};

/// Placement-only update for one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub window_id: WindowId,
    pub x: i32,
    pub y: i32,
}

/// Pending structural changes, coalesced from one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBatch {
    /// Windows that need a new sprite
    pub added: Vec<WindowId>,
    /// Windows whose sprite must be evicted
    pub closed: Vec<WindowId>,
    /// Windows closed and added again within the batch; their old sprite is replaced
    pub reopened: Vec<WindowId>,
    pub positions: Vec<PositionUpdate>,
    /// Windows whose backing segment must be re-bound
    pub rebinds: Vec<WindowId>,
    /// Windows whose pixels must be re-copied
    pub dirty: Vec<WindowId>,
    /// Window that must end up topmost
    pub focus: Option<WindowId>,
    focus_changed: bool,
}

fn push_unique(ids: &mut Vec<WindowId>, id: WindowId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

impl SyncBatch {
    /// Fold one event into the batch
    pub fn push(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::WindowAdded { id } => {
                if let Some(index) = self.closed.iter().position(|&closed| closed == id) {
                    self.closed.remove(index);
                    push_unique(&mut self.reopened, id);
                }
                push_unique(&mut self.added, id);
            }
            SyncEvent::WindowClosed { id } => push_unique(&mut self.closed, id),
            SyncEvent::WindowMoved { id, x, y } => {
                match self.positions.iter_mut().find(|p| p.window_id == id) {
                    Some(position) => {
                        position.x = x;
                        position.y = y;
                    }
                    None => self.positions.push(PositionUpdate { window_id: id, x, y }),
                }
            }
            SyncEvent::FrameBufferRenamed { id } => push_unique(&mut self.rebinds, id),
            SyncEvent::FrameBufferDirty { id } => push_unique(&mut self.dirty, id),
            SyncEvent::Focus { id } => {
                self.focus = id;
                self.focus_changed = true;
            }
        }
    }

    /// Nothing to reconcile this frame
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.closed.is_empty()
            && self.positions.is_empty()
            && self.rebinds.is_empty()
            && self.dirty.is_empty()
            && !self.focus_changed
    }

    /// Whether any stage has to consult the live window list
    pub fn needs_window_list(&self) -> bool {
        !self.added.is_empty()
            || !self.positions.is_empty()
            || !self.rebinds.is_empty()
            || !self.dirty.is_empty()
    }

    /// Whether a focus event arrived in this batch
    pub fn focus_changed(&self) -> bool {
        self.focus_changed
    }
}

impl FromIterator<SyncEvent> for SyncBatch {
    fn from_iter<I: IntoIterator<Item = SyncEvent>>(iter: I) -> Self {
        let mut batch = SyncBatch::default();
        for event in iter {
            batch.push(event);
        }
        batch
    }
}

/// Producer handle of the mailbox
#[derive(Debug, Clone)]
pub struct SyncSender {
    tx: Sender<SyncEvent>,
}

impl SyncSender {
    /// Post an event for the next frame
    pub fn post(&self, event: SyncEvent) {
        trace!("Posting sync event {:?}", event);
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Disconnected(event)) => {
                debug!("Compositor gone, dropping sync event {:?}", event);
            }
            Err(TrySendError::Full(event)) => {
                debug!("Sync mailbox full, dropping sync event {:?}", event);
            }
        }
    }
}

/// Compositor end of the mailbox
#[derive(Debug)]
pub struct SyncMailbox {
    rx: Receiver<SyncEvent>,
    focus: Option<WindowId>,
}

/// Create a connected producer/compositor mailbox pair
pub fn sync_channel() -> (SyncSender, SyncMailbox) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (SyncSender { tx }, SyncMailbox { rx, focus: None })
}

impl SyncMailbox {
    /// Drain the events pending right now into one batch.
    ///
    /// Events posted while draining land in the next batch. The last focus
    /// seen stays in effect for later batches until a new focus event.
    pub fn drain(&mut self) -> SyncBatch {
        let pending = self.rx.len();
        let mut batch: SyncBatch = self.rx.try_iter().take(pending).collect();

        if batch.focus_changed {
            self.focus = batch.focus;
        }
        batch.focus = self.focus;
        batch
    }

    /// Focus currently in effect
    pub fn focus(&self) -> Option<WindowId> {
        self.focus
    }
}
