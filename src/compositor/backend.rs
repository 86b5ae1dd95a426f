//! Graphics backend seams
//!
//! The compositor core never talks to a GPU API directly. A backend provides
//! dynamic textures with scoped write mappings, snapshot/restore of the host's
//! pipeline state, and the unscaled sprite blit.

use overlay_proto::Rect;
use thiserror::Error;

/// Errors reported by a graphics backend
#[derive(Debug, Error)]
pub enum GraphicsError {
    #[error("failed to allocate {width}x{height} texture: {reason}")]
    TextureAllocation {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("failed to map texture for writing: {reason}")]
    Mapping { reason: String },

    #[error("graphics device error: {reason}")]
    Device { reason: String },
}

/// Allocated texture dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
}

impl TextureSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether a `width` x `height` image fits in this texture
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.width >= width && self.height >= height
    }
}

/// Destination rectangle of a blit, in surface coordinates (right/bottom exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl From<Rect> for DrawRect {
    fn from(rect: Rect) -> Self {
        Self {
            left: rect.x,
            top: rect.y,
            right: rect.right(),
            bottom: rect.bottom(),
        }
    }
}

/// Pixel format of the presentation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    Bgra8Unorm,
    Rgba8Unorm,
    Rgb10A2Unorm,
    Rgba16Float,
    /// Any other native format code
    Other(u32),
}

/// Properties of the bound presentation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub width: u32,
    pub height: u32,
    /// Copy-compatible format of the back buffer
    pub format: SurfaceFormat,
    /// Back buffer was created with an sRGB format
    pub srgb: bool,
    pub windowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    InvSrcAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    Solid,
    Wireframe,
}

/// Blend equation for render target 0 (additive op for both color and alpha)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendDesc {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub write_mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

/// Fixed pipeline state installed for the transparent overlay draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayPipelineDesc {
    pub depth_test: bool,
    pub blend: BlendDesc,
    pub blend_factor: [f32; 4],
    pub sample_mask: u32,
    pub fill: FillMode,
    pub cull: CullMode,
    pub depth_clip: bool,
    pub viewport: Viewport,
}

impl OverlayPipelineDesc {
    /// Standard "over" compositing onto the whole surface
    pub fn for_surface(surface: &SurfaceInfo) -> Self {
        Self {
            depth_test: false,
            blend: BlendDesc {
                enabled: true,
                src_color: BlendFactor::SrcAlpha,
                dst_color: BlendFactor::InvSrcAlpha,
                src_alpha: BlendFactor::One,
                dst_alpha: BlendFactor::Zero,
                write_mask: 0x0f,
            },
            blend_factor: [0.0; 4],
            sample_mask: 0xffff_ffff,
            fill: FillMode::Solid,
            cull: CullMode::Back,
            depth_clip: true,
            viewport: Viewport {
                x: 0.0,
                y: 0.0,
                width: surface.width as f32,
                height: surface.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        }
    }
}

/// Write access to a mapped texture. Dropping the value unmaps the texture.
pub trait TextureWrite {
    /// Bytes between the starts of consecutive rows in the mapping
    fn row_pitch(&self) -> usize;

    /// Mapped bytes, or `None` if the backend produced no pointer
    fn bytes_mut(&mut self) -> Option<&mut [u8]>;
}

/// Dynamic BGRA texture allocation and CPU write access
pub trait TextureDevice {
    type Texture;
    type Mapping<'a>: TextureWrite
    where
        Self: 'a;

    /// Create a write-only, GPU-sampled BGRA8 texture of exactly `size`
    fn create_dynamic_texture(&mut self, size: TextureSize) -> Result<Self::Texture, GraphicsError>;

    fn texture_size(&self, texture: &Self::Texture) -> TextureSize;

    /// Map the texture for writing, discarding previous content
    fn map_write<'a>(
        &'a mut self,
        texture: &'a Self::Texture,
    ) -> Result<Self::Mapping<'a>, GraphicsError>;
}

/// Save/restore of the host pipeline state touched by the overlay draw
pub trait PipelineContext {
    /// Captured bindings. Owns one reference to every captured native object;
    /// dropping it releases them.
    type Snapshot;

    fn save_state(&mut self) -> Self::Snapshot;

    fn install_overlay_state(&mut self, desc: &OverlayPipelineDesc) -> Result<(), GraphicsError>;

    /// Re-install every captured binding, then release the snapshot's references
    fn restore_state(&mut self, snapshot: Self::Snapshot);
}

/// The sprite-quad draw primitive
pub trait SpriteDrawer: TextureDevice {
    /// Draw `texture` unscaled into `dest` on the current render target
    fn draw_unscaled(&mut self, texture: &Self::Texture, dest: DrawRect);
}

/// Everything the compositor needs from a bound presentation surface
pub trait GraphicsBackend: PipelineContext + SpriteDrawer {
    fn surface(&self) -> SurfaceInfo;
}
