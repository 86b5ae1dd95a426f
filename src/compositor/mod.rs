//! Compositor Module
//!
//! Keeps one GPU sprite per overlay window in sync with the live window list
//! and draws them on top of the host's frame.

pub mod backend;
pub mod frame_reader;
pub mod pipeline;
pub mod reconcile;
pub mod sprite;
pub mod stats;
pub mod sync;
pub mod texture;

#[cfg(windows)]
pub mod d3d11;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use overlay_proto::WindowId;

use crate::config::CompositorConfig;
use crate::shared::WindowRegistry;
use crate::shm::SegmentOpener;
use backend::{GraphicsBackend, OverlayPipelineDesc, SpriteDrawer, SurfaceInfo};
use pipeline::PipelineStateGuard;
use reconcile::{reconcile, ReconcileReport};
use sprite::{create_window_sprite, SpriteCache};
use stats::FrameStats;
use texture::create_block_texture;
use sync::SyncMailbox;

/// Outcome of one `render_frame`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSummary {
    pub report: ReconcileReport,
    /// Sprites blitted this frame
    pub drawn: usize,
}

/// Sprite compositor bound to one presentation surface.
///
/// Fields drop in declaration order: sprites and the block texture, then the
/// backend's pipeline objects, then the surface binding itself.
pub struct SpriteCompositor<B: GraphicsBackend, O: SegmentOpener> {
    sprites: SpriteCache<B::Texture, O::Segment>,
    block: Option<B::Texture>,
    backend: B,
    opener: O,
    registry: Arc<WindowRegistry>,
    mailbox: SyncMailbox,
    surface: SurfaceInfo,
    overlay_state: OverlayPipelineDesc,
    config: CompositorConfig,
    stats: FrameStats,
}

impl<B: GraphicsBackend, O: SegmentOpener> SpriteCompositor<B, O> {
    /// Bind to a surface and create sprites for every window already open
    pub fn bind(
        mut backend: B,
        opener: O,
        registry: Arc<WindowRegistry>,
        mailbox: SyncMailbox,
        config: CompositorConfig,
    ) -> Self {
        let surface = backend.surface();
        info!(
            "Binding compositor to {}x{} surface, format {:?}, srgb {}, windowed {}",
            surface.width, surface.height, surface.format, surface.srgb, surface.windowed
        );

        let block = match create_block_texture(&mut backend, &surface) {
            Ok(texture) => Some(texture),
            Err(e) => {
                warn!("Cannot create block texture: {}", e);
                None
            }
        };

        let mut compositor = Self {
            sprites: SpriteCache::new(),
            block,
            backend,
            opener,
            registry,
            mailbox,
            surface,
            overlay_state: OverlayPipelineDesc::for_surface(&surface),
            stats: FrameStats::new(config.stats_interval()),
            config,
        };
        compositor.populate();
        compositor
    }

    fn populate(&mut self) {
        let windows = self.registry.lock_windows();
        for window in windows.iter() {
            if self.sprites.contains(window.window_id) {
                continue;
            }
            match create_window_sprite(&mut self.backend, &self.opener, &self.registry, window) {
                Ok(sprite) => {
                    let _ = self.sprites.push(sprite);
                }
                Err(e) => debug!("Skipping window {} on bind: {}", window.window_id, e),
            }
        }
        info!("Compositor bound with {} sprites", self.sprites.len());
    }

    /// Apply pending sync events and draw every sprite.
    ///
    /// Runs on the host's render thread once per presented frame. The host's
    /// pipeline state is restored on every exit path.
    pub fn render_frame(&mut self) -> FrameSummary {
        let started = Instant::now();
        let batch = self.mailbox.drain();
        let mut summary = FrameSummary::default();

        if self.config.enabled {
            let mut guard = PipelineStateGuard::new(&mut self.backend, &self.overlay_state);
            summary.report =
                reconcile(&batch, &mut self.sprites, &mut *guard, &self.opener, &self.registry);
            if guard.is_prepared() {
                summary.drawn = draw_sprites(&mut *guard, &self.sprites);
            }
        } else {
            summary.report =
                reconcile(&batch, &mut self.sprites, &mut self.backend, &self.opener, &self.registry);
        }

        let cost = started.elapsed();
        if cost > self.config.frame_budget() {
            warn!(
                "Compositing took {:?} (budget {:?}) for {} sprites",
                cost,
                self.config.frame_budget(),
                self.sprites.len()
            );
        }
        if let Some(report) = self.stats.tick(cost) {
            debug!("Compositor {:.1} fps, slowest pass {:?}", report.fps, report.slowest);
        }

        summary
    }

    /// Tear down the sprites and hand back the surface binding
    pub fn unbind(self) -> B {
        let Self {
            mut sprites,
            block,
            backend,
            ..
        } = self;
        sprites.clear();
        drop(block);
        info!("Compositor unbound");
        backend
    }

    pub fn sprites(&self) -> &SpriteCache<B::Texture, O::Segment> {
        &self.sprites
    }

    /// Opaque full-surface texture made at bind, if the device could create it
    pub fn block_texture(&self) -> Option<&B::Texture> {
        self.block.as_ref()
    }

    /// Window ids in draw order, bottom first
    pub fn sprite_ids(&self) -> Vec<WindowId> {
        self.sprites.ids()
    }

    pub fn surface(&self) -> SurfaceInfo {
        self.surface
    }

    pub fn registry(&self) -> &Arc<WindowRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Focus currently in effect
    pub fn focus(&self) -> Option<WindowId> {
        self.mailbox.focus()
    }

    /// Get current FPS
    pub fn fps(&self) -> f64 {
        self.stats.fps()
    }
}

/// Blit every sprite with a texture in cache order
pub fn draw_sprites<D, S>(drawer: &mut D, sprites: &SpriteCache<D::Texture, S>) -> usize
where
    D: SpriteDrawer,
{
    let mut drawn = 0;
    for sprite in sprites.iter() {
        if let Some(texture) = sprite.texture() {
            drawer.draw_unscaled(texture, sprite.draw_rect());
            drawn += 1;
        }
    }
    drawn
}
