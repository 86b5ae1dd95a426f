use thiserror::Error;
use tracing::{info, warn};

use overlay_proto::{Rect, WindowId, WindowInfo};

use super::backend::{DrawRect, GraphicsError, TextureDevice};
use super::frame_reader;
use super::texture::allocate_dynamic_texture;
use crate::shared::WindowRegistry;
use crate::shm::{BindError, SegmentOpener};

/// Why a sprite could not be created
#[derive(Debug, Error)]
pub enum SpriteError {
    #[error(transparent)]
    Texture(#[from] GraphicsError),

    #[error(transparent)]
    Binding(#[from] BindError),
}

impl SpriteError {
    /// Whether a later sync may succeed for the same window
    pub fn is_retryable(&self) -> bool {
        match self {
            SpriteError::Texture(_) => true,
            SpriteError::Binding(e) => e.is_retryable(),
        }
    }
}

/// Compositor sprite state
/// Represents one overlay window being drawn onto the host surface
#[derive(Debug)]
pub struct WindowSprite<T, S> {
    /// ID of the overlay window
    pub window_id: WindowId,

    pub name: String,

    /// Name of the shared-memory segment backing this sprite
    pub buffer_name: String,

    /// Placement and logical size on the host surface
    pub rect: Rect,

    /// Sprite texture; at least as large as `rect` whenever present
    pub(crate) texture: Option<T>,

    /// Open read-only mapping of `buffer_name`
    pub(crate) binding: Option<S>,
}

impl<T, S> WindowSprite<T, S> {
    pub fn new(window: &WindowInfo, texture: Option<T>, binding: Option<S>) -> Self {
        Self {
            window_id: window.window_id,
            name: window.name.clone(),
            buffer_name: window.buffer_name.clone(),
            rect: window.rect,
            texture,
            binding,
        }
    }

    pub fn texture(&self) -> Option<&T> {
        self.texture.as_ref()
    }

    pub fn binding(&self) -> Option<&S> {
        self.binding.as_ref()
    }

    /// Destination of this sprite's unscaled blit
    pub fn draw_rect(&self) -> DrawRect {
        DrawRect::from(self.rect)
    }
}

/// Build a sprite for a live window: allocate its texture, bind its frame
/// segment and copy the current frame.
///
/// Texture and binding failures abort creation; the window is picked up again
/// the next time it is announced. A failed first copy only leaves the sprite
/// blank until its next content refresh.
pub fn create_window_sprite<D, O>(
    device: &mut D,
    opener: &O,
    registry: &WindowRegistry,
    window: &WindowInfo,
) -> Result<WindowSprite<D::Texture, O::Segment>, SpriteError>
where
    D: TextureDevice,
    O: SegmentOpener,
{
    info!(
        "Creating sprite {}x{} at {},{} buffer name: {}",
        window.rect.width, window.rect.height, window.rect.x, window.rect.y, window.buffer_name
    );

    let texture = allocate_dynamic_texture(device, window.rect.width, window.rect.height)?;
    let binding = opener.open_read_only(&window.buffer_name)?;

    let mut sprite = WindowSprite::new(window, Some(texture), Some(binding));
    if let Err(e) = frame_reader::refresh_sprite(device, &mut sprite, registry) {
        warn!("Initial frame copy for window {} failed: {}", window.window_id, e);
    }
    Ok(sprite)
}

/// Ordered sprite collection. Order is draw order: index 0 is drawn first
/// (bottom), the last sprite is drawn last (top).
#[derive(Debug)]
pub struct SpriteCache<T, S> {
    sprites: Vec<WindowSprite<T, S>>,
}

impl<T, S> Default for SpriteCache<T, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> SpriteCache<T, S> {
    pub fn new() -> Self {
        Self {
            sprites: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sprites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sprites.is_empty()
    }

    pub fn position(&self, window_id: WindowId) -> Option<usize> {
        self.sprites.iter().position(|s| s.window_id == window_id)
    }

    pub fn contains(&self, window_id: WindowId) -> bool {
        self.position(window_id).is_some()
    }

    pub fn get(&self, window_id: WindowId) -> Option<&WindowSprite<T, S>> {
        self.sprites.iter().find(|s| s.window_id == window_id)
    }

    pub fn get_mut(&mut self, window_id: WindowId) -> Option<&mut WindowSprite<T, S>> {
        self.sprites.iter_mut().find(|s| s.window_id == window_id)
    }

    /// Append a sprite on top. Refused if the window already has a sprite.
    pub fn push(&mut self, sprite: WindowSprite<T, S>) -> Result<(), WindowSprite<T, S>> {
        if self.contains(sprite.window_id) {
            return Err(sprite);
        }
        self.sprites.push(sprite);
        Ok(())
    }

    /// Evict a window's sprite, releasing its texture and binding
    pub fn remove(&mut self, window_id: WindowId) -> Option<WindowSprite<T, S>> {
        let index = self.position(window_id)?;
        Some(self.sprites.remove(index))
    }

    /// Move a sprite to the top of the draw order.
    ///
    /// Returns `true` if the order changed. Unknown ids and an empty cache are
    /// no-ops.
    pub fn raise_to_top(&mut self, window_id: WindowId) -> bool {
        match self.position(window_id) {
            Some(index) if index + 1 != self.sprites.len() => {
                let sprite = self.sprites.remove(index);
                self.sprites.push(sprite);
                true
            }
            _ => false,
        }
    }

    /// Topmost sprite
    pub fn top(&self) -> Option<&WindowSprite<T, S>> {
        self.sprites.last()
    }

    /// Sprites in draw order
    pub fn iter(&self) -> impl Iterator<Item = &WindowSprite<T, S>> {
        self.sprites.iter()
    }

    /// Window ids in draw order
    pub fn ids(&self) -> Vec<WindowId> {
        self.sprites.iter().map(|s| s.window_id).collect()
    }

    /// Drop every sprite
    pub fn clear(&mut self) {
        self.sprites.clear();
    }
}
