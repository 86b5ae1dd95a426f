//! Reconciliation
//!
//! Applies one drained `SyncBatch` to the sprite cache as a fixed sequence of
//! stages:
//!
//! 1. additions  - new sprites are appended on top
//! 2. positions  - placement only, no content touched
//! 3. bindings   - re-open renamed frame segments
//! 4. content    - copy dirty frames (needs current bindings)
//! 5. removals   - evict closed windows (after any work that still names them)
//! 6. focus      - raise the focused sprite (last, so additions cannot cover it)
//!
//! Stages 1-4 run under the registry's windows lock when the batch has work
//! for them.

use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use overlay_proto::{WindowId, WindowInfo};

use super::backend::TextureDevice;
use super::frame_reader::{self, CopyOutcome, FrameError};
use super::sprite::{create_window_sprite, SpriteCache};
use super::sync::{PositionUpdate, SyncBatch};
use crate::shared::{find_window, WindowRegistry};
use crate::shm::SegmentOpener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Additions,
    Positions,
    Bindings,
    Content,
    Removals,
    Focus,
}

impl Stage {
    /// Execution order
    pub const ORDER: [Stage; 6] = [
        Stage::Additions,
        Stage::Positions,
        Stage::Bindings,
        Stage::Content,
        Stage::Removals,
        Stage::Focus,
    ];

    /// Whether the stage runs under the windows lock
    pub fn needs_window_list(self) -> bool {
        matches!(
            self,
            Stage::Additions | Stage::Positions | Stage::Bindings | Stage::Content
        )
    }
}

/// What one reconciliation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub moved: usize,
    pub rebound: usize,
    pub refreshed: usize,
    pub removed: usize,
    pub raised: usize,
    /// Operations dropped because their window or sprite was gone, or failed
    pub skipped: usize,
}

/// Everything a stage may touch
pub struct Reconciler<'a, D: TextureDevice, O: SegmentOpener> {
    pub cache: &'a mut SpriteCache<D::Texture, O::Segment>,
    pub device: &'a mut D,
    pub opener: &'a O,
    pub registry: &'a WindowRegistry,
    pub report: ReconcileReport,
}

impl<'a, D: TextureDevice, O: SegmentOpener> Reconciler<'a, D, O> {
    pub fn new(
        cache: &'a mut SpriteCache<D::Texture, O::Segment>,
        device: &'a mut D,
        opener: &'a O,
        registry: &'a WindowRegistry,
    ) -> Self {
        Self {
            cache,
            device,
            opener,
            registry,
            report: ReconcileReport::default(),
        }
    }

    /// Run every stage in order
    pub fn run(mut self, batch: &SyncBatch) -> ReconcileReport {
        let registry = self.registry;
        let mut windows: Option<MutexGuard<'_, Vec<WindowInfo>>> = None;

        for stage in Stage::ORDER {
            if stage.needs_window_list() {
                if !batch.needs_window_list() {
                    continue;
                }
                if windows.is_none() {
                    windows = Some(registry.lock_windows());
                }
            } else {
                windows = None;
            }
            let live = windows.as_deref().map_or(&[][..], Vec::as_slice);
            self.run_stage(stage, batch, live);
        }

        debug!("Reconciled sync batch: {:?}", self.report);
        self.report
    }

    pub fn run_stage(&mut self, stage: Stage, batch: &SyncBatch, live: &[WindowInfo]) {
        trace!("Reconcile stage {:?}", stage);
        match stage {
            Stage::Additions => self.add_windows(&batch.added, &batch.reopened, live),
            Stage::Positions => self.move_windows(&batch.positions),
            Stage::Bindings => self.rebind_windows(&batch.rebinds, live),
            Stage::Content => self.refresh_windows(&batch.dirty),
            Stage::Removals => self.remove_windows(&batch.closed),
            Stage::Focus => self.raise_focus(batch.focus),
        }
    }

    fn add_windows(&mut self, ids: &[WindowId], reopened: &[WindowId], live: &[WindowInfo]) {
        for &window_id in ids {
            if reopened.contains(&window_id) && self.cache.remove(window_id).is_some() {
                debug!("Window {} reopened, replacing its sprite", window_id);
                self.report.removed += 1;
            }
            if self.cache.contains(window_id) {
                debug!("Window {} already has a sprite", window_id);
                self.report.skipped += 1;
                continue;
            }
            // created and closed again before this sync
            let Some(window) = find_window(live, window_id) else {
                self.report.skipped += 1;
                continue;
            };

            match create_window_sprite(self.device, self.opener, self.registry, window) {
                Ok(sprite) => {
                    if self.cache.push(sprite).is_ok() {
                        self.report.created += 1;
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!("Window {} not yet available: {}", window_id, e);
                    self.report.skipped += 1;
                }
                Err(e) => {
                    warn!("Cannot create sprite for window {}: {}", window_id, e);
                    self.report.skipped += 1;
                }
            }
        }
    }

    fn move_windows(&mut self, positions: &[PositionUpdate]) {
        for position in positions {
            match self.cache.get_mut(position.window_id) {
                Some(sprite) => {
                    sprite.rect.x = position.x;
                    sprite.rect.y = position.y;
                    self.report.moved += 1;
                }
                None => self.report.skipped += 1,
            }
        }
    }

    fn rebind_windows(&mut self, ids: &[WindowId], live: &[WindowInfo]) {
        for &window_id in ids {
            let (Some(sprite), Some(window)) =
                (self.cache.get_mut(window_id), find_window(live, window_id))
            else {
                self.report.skipped += 1;
                continue;
            };

            sprite.buffer_name = window.buffer_name.clone();
            match self.opener.open_read_only(&sprite.buffer_name) {
                Ok(binding) => {
                    sprite.binding = Some(binding);
                    self.report.rebound += 1;
                }
                Err(e) => {
                    // keep the stale binding
                    debug!("Rebinding window {} to {} failed: {}", window_id, sprite.buffer_name, e);
                    self.report.skipped += 1;
                }
            }
        }
    }

    fn refresh_windows(&mut self, ids: &[WindowId]) {
        for &window_id in ids {
            let Some(sprite) = self.cache.get_mut(window_id) else {
                self.report.skipped += 1;
                continue;
            };

            match frame_reader::refresh_sprite(self.device, sprite, self.registry) {
                Ok(CopyOutcome::Copied { .. }) => self.report.refreshed += 1,
                Ok(CopyOutcome::Skipped) => self.report.skipped += 1,
                Err(FrameError::MissingBinding) => self.report.skipped += 1,
                Err(e) => {
                    warn!("Update sprite for window {} failed: {}", window_id, e);
                    self.report.skipped += 1;
                }
            }
        }
    }

    fn remove_windows(&mut self, ids: &[WindowId]) {
        for &window_id in ids {
            match self.cache.remove(window_id) {
                Some(_) => self.report.removed += 1,
                None => self.report.skipped += 1,
            }
        }
    }

    fn raise_focus(&mut self, focus: Option<WindowId>) {
        if let Some(window_id) = focus {
            if self.cache.raise_to_top(window_id) {
                self.report.raised += 1;
            }
        }
    }
}

/// Apply `batch` to `cache`
pub fn reconcile<D, O>(
    batch: &SyncBatch,
    cache: &mut SpriteCache<D::Texture, O::Segment>,
    device: &mut D,
    opener: &O,
    registry: &WindowRegistry,
) -> ReconcileReport
where
    D: TextureDevice,
    O: SegmentOpener,
{
    Reconciler::new(cache, device, opener, registry).run(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::backend::TextureSize;
    use crate::compositor::sync::{sync_channel, SyncMailbox};
    use crate::compositor::testing::{window, MemorySegment, MemorySegments, MockBackend, MockTexture};
    use overlay_proto::{Rect, SyncEvent};

    struct Fixture {
        registry: WindowRegistry,
        mailbox: SyncMailbox,
        segments: MemorySegments,
        backend: MockBackend,
        cache: SpriteCache<MockTexture, MemorySegment>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, mailbox) = sync_channel();
            Self {
                registry: WindowRegistry::new(tx),
                mailbox,
                segments: MemorySegments::new(),
                backend: MockBackend::new(1920, 1080),
                cache: SpriteCache::new(),
            }
        }

        fn open(&self, id: WindowId, x: i32, y: i32, w: u32, h: u32) {
            let info = window(id, x, y, w, h);
            self.segments.put_frame(&info.buffer_name, x, y, w, h, id);
            self.registry.window_opened(info);
        }

        fn sync(&mut self) -> ReconcileReport {
            let batch = self.mailbox.drain();
            reconcile(&batch, &mut self.cache, &mut self.backend, &self.segments, &self.registry)
        }
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(
            Stage::ORDER,
            [
                Stage::Additions,
                Stage::Positions,
                Stage::Bindings,
                Stage::Content,
                Stage::Removals,
                Stage::Focus
            ]
        );
        assert!(!Stage::Removals.needs_window_list());
        assert!(!Stage::Focus.needs_window_list());
    }

    #[test]
    fn test_add_and_close_leave_one_sprite_per_window() {
        let mut fx = Fixture::new();
        for id in [1, 2, 3, 4] {
            fx.open(id, 0, 0, 50, 50);
        }
        fx.registry.window_opened(window(2, 0, 0, 50, 50));
        fx.registry.window_closed(3);

        let report = fx.sync();
        assert_eq!(fx.cache.ids(), vec![1, 2, 4]);
        assert_eq!(report.created, 3);
        assert_eq!(report.removed, 0);

        fx.registry.window_opened(window(1, 0, 0, 50, 50));
        fx.registry.window_closed(4);
        let report = fx.sync();
        assert_eq!(fx.cache.ids(), vec![1, 2]);
        assert_eq!(report.removed, 1);
    }

    #[test]
    fn test_window_closed_before_sync_is_skipped() {
        let mut fx = Fixture::new();
        fx.registry.window_opened(window(5, 0, 0, 10, 10));
        {
            fx.registry.lock_windows().clear();
        }

        let report = fx.sync();
        assert!(fx.cache.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_missing_segment_is_retried_on_next_add() {
        let mut fx = Fixture::new();
        fx.registry.window_opened(window(1, 0, 0, 10, 10));
        fx.sync();
        assert!(fx.cache.is_empty());
        assert_eq!(fx.backend.live_textures(), 0);

        fx.open(1, 0, 0, 10, 10);
        fx.sync();
        assert_eq!(fx.cache.ids(), vec![1]);
    }

    #[test]
    fn test_move_touches_placement_only() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 10, 300, 200);
        fx.sync();
        let maps = fx.backend.maps;

        fx.registry.window_moved(1, 400, 20);
        let report = fx.sync();

        assert_eq!(report.moved, 1);
        assert_eq!(fx.cache.get(1).unwrap().rect, Rect::new(400, 20, 300, 200));
        assert_eq!(fx.backend.maps, maps);
    }

    #[test]
    fn test_rebind_then_refresh_reads_new_segment() {
        let mut fx = Fixture::new();
        fx.open(1, 0, 0, 8, 8);
        fx.sync();

        fx.segments.put_frame("overlay-1-b", 0, 0, 8, 8, 0xabcd);
        fx.registry.buffer_renamed(1, "overlay-1-b");
        fx.registry.frame_buffer_changed(1);
        let report = fx.sync();

        assert_eq!(report.rebound, 1);
        assert_eq!(report.refreshed, 1);
        let sprite = fx.cache.get(1).unwrap();
        assert_eq!(sprite.buffer_name, "overlay-1-b");
        assert_eq!(fx.backend.pixel(sprite.texture().unwrap(), 7, 7), 0xabcd);
    }

    #[test]
    fn test_failed_rebind_keeps_stale_binding() {
        let mut fx = Fixture::new();
        fx.open(1, 0, 0, 8, 8);
        fx.sync();

        fx.segments.break_segment("overlay-1-c");
        fx.registry.buffer_renamed(1, "overlay-1-c");
        fx.segments.put_frame("overlay-1", 0, 0, 8, 8, 0x1234);
        fx.registry.frame_buffer_changed(1);
        let report = fx.sync();

        assert_eq!(report.rebound, 0);
        assert_eq!(report.refreshed, 1);
        let sprite = fx.cache.get(1).unwrap();
        assert_eq!(sprite.buffer_name, "overlay-1-c");
        assert!(sprite.binding().is_some());
        assert_eq!(fx.backend.pixel(sprite.texture().unwrap(), 0, 0), 0x1234);
    }

    #[test]
    fn test_dirty_refresh_grows_texture() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 10, 300, 200);
        fx.sync();
        assert_eq!(
            fx.backend.texture_size(fx.cache.get(1).unwrap().texture().unwrap()),
            TextureSize::new(512, 512)
        );

        fx.segments.put_frame("overlay-1", 10, 10, 600, 700, 1);
        fx.registry.frame_buffer_changed(1);
        fx.sync();

        let sprite = fx.cache.get(1).unwrap();
        assert_eq!(sprite.rect, Rect::new(10, 10, 600, 700));
        assert_eq!(
            fx.backend.texture_size(sprite.texture().unwrap()),
            TextureSize::new(1024, 1024)
        );
    }

    #[test]
    fn test_close_releases_texture() {
        let mut fx = Fixture::new();
        fx.open(1, 10, 10, 300, 200);
        fx.sync();
        assert_eq!(fx.backend.live_textures(), 1);

        fx.registry.window_closed(1);
        let report = fx.sync();

        assert_eq!(report.removed, 1);
        assert!(fx.cache.is_empty());
        assert_eq!(fx.backend.live_textures(), 0);
    }

    #[test]
    fn test_close_then_reopen_in_one_batch_replaces_sprite() {
        let mut fx = Fixture::new();
        fx.open(1, 0, 0, 40, 40);
        fx.open(2, 0, 0, 40, 40);
        fx.sync();
        let old_texture = fx.cache.get(1).and_then(|s| s.texture()).map(|t| t.id);

        fx.registry.window_closed(1);
        fx.open(1, 5, 5, 700, 40);
        let report = fx.sync();
        for _ in 0..3 {
            fx.sync();
        }

        assert_eq!(report.created, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(fx.cache.ids(), vec![2, 1]);
        let sprite = fx.cache.get(1).unwrap();
        assert_eq!(sprite.rect, Rect::new(5, 5, 700, 40));
        assert_ne!(sprite.texture().map(|t| t.id), old_texture);
        assert_eq!(fx.backend.live_textures(), 2);
    }

    #[test]
    fn test_dirty_and_close_in_same_batch() {
        let mut fx = Fixture::new();
        fx.open(1, 0, 0, 8, 8);
        fx.sync();

        fx.registry.frame_buffer_changed(1);
        fx.registry.window_closed(1);
        let report = fx.sync();

        assert_eq!(report.refreshed, 1);
        assert_eq!(report.removed, 1);
        assert!(fx.cache.is_empty());
    }

    #[test]
    fn test_focus_moves_sprite_to_top() {
        let mut fx = Fixture::new();
        for id in [1, 3, 2, 4] {
            fx.open(id, 0, 0, 20, 20);
        }
        fx.sync();
        assert_eq!(fx.cache.ids(), vec![1, 3, 2, 4]);

        fx.registry.window_focused(Some(2));
        let report = fx.sync();

        assert_eq!(report.raised, 1);
        assert_eq!(fx.cache.ids(), vec![1, 3, 4, 2]);
    }

    #[test]
    fn test_focus_unknown_or_empty_is_noop() {
        let mut fx = Fixture::new();
        fx.registry.window_focused(Some(9));
        let report = fx.sync();
        assert_eq!(report, ReconcileReport::default());

        fx.open(1, 0, 0, 20, 20);
        fx.open(2, 0, 0, 20, 20);
        fx.sync();
        assert_eq!(fx.cache.ids(), vec![1, 2]);
    }

    #[test]
    fn test_focus_stays_above_new_windows() {
        let mut fx = Fixture::new();
        fx.open(1, 0, 0, 20, 20);
        fx.open(2, 0, 0, 20, 20);
        fx.registry.window_focused(Some(1));
        fx.sync();
        assert_eq!(fx.cache.ids(), vec![2, 1]);

        fx.open(3, 0, 0, 20, 20);
        fx.sync();
        assert_eq!(fx.cache.ids(), vec![2, 3, 1]);
    }

    #[test]
    fn test_single_stage_in_isolation() {
        let mut fx = Fixture::new();
        let batch: SyncBatch = [SyncEvent::WindowAdded { id: 1 }].into_iter().collect();
        let live = vec![window(1, 0, 0, 8, 8)];
        fx.segments.put_frame("overlay-1", 0, 0, 8, 8, 1);

        let mut reconciler =
            Reconciler::new(&mut fx.cache, &mut fx.backend, &fx.segments, &fx.registry);
        reconciler.run_stage(Stage::Additions, &batch, &live);
        assert_eq!(reconciler.report.created, 1);
        assert_eq!(fx.cache.ids(), vec![1]);
    }
}
