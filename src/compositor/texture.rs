//! Dynamic texture allocation
//!
//! Sprite textures are sized in 512-pixel steps so that small resizes of the
//! source window do not force a reallocation. Textures are only ever replaced
//! by larger ones, never shrunk.

use tracing::{debug, warn};

use super::backend::{GraphicsError, SurfaceInfo, TextureDevice, TextureSize, TextureWrite};

/// Allocation step (and minimum) for both texture axes
pub const TEXTURE_GRANULARITY: u32 = 512;

/// Round `requested` up to the next multiple of the granularity, minimum one
/// step. `None` if the rounded extent does not fit in a `u32`.
pub fn dynamic_extent(requested: u32) -> Option<u32> {
    requested
        .div_ceil(TEXTURE_GRANULARITY)
        .max(1)
        .checked_mul(TEXTURE_GRANULARITY)
}

/// Texture size to allocate for a sprite of at least `min_width` x `min_height`
pub fn dynamic_texture_size(min_width: u32, min_height: u32) -> Option<TextureSize> {
    Some(TextureSize::new(
        dynamic_extent(min_width)?,
        dynamic_extent(min_height)?,
    ))
}

/// Whether a texture of `current` size must be replaced to hold `width` x `height`
pub fn needs_growth(current: TextureSize, width: u32, height: u32) -> bool {
    !current.covers(width, height)
}

/// Allocate a dynamic sprite texture large enough for `min_width` x `min_height`
pub fn allocate_dynamic_texture<D: TextureDevice>(
    device: &mut D,
    min_width: u32,
    min_height: u32,
) -> Result<D::Texture, GraphicsError> {
    let size = dynamic_texture_size(min_width, min_height).ok_or_else(|| {
        warn!("Texture for {}x{} exceeds the addressable size", min_width, min_height);
        GraphicsError::TextureAllocation {
            width: min_width,
            height: min_height,
            reason: "requested size overflows the allocation step".into(),
        }
    })?;
    debug!(
        "Creating texture {}x{} ({}x{})",
        size.width, size.height, min_width, min_height
    );

    device.create_dynamic_texture(size).map_err(|e| {
        warn!("CreateTexture {}x{} failed: {}", size.width, size.height, e);
        e
    })
}

/// Opaque white texture covering the whole surface, every byte `0xff`
pub fn create_block_texture<D: TextureDevice>(
    device: &mut D,
    surface: &SurfaceInfo,
) -> Result<D::Texture, GraphicsError> {
    let size = TextureSize::new(surface.width.max(1), surface.height.max(1));
    let texture = device.create_dynamic_texture(size)?;
    {
        let mut mapping = device.map_write(&texture)?;
        match mapping.bytes_mut() {
            Some(bytes) => bytes.fill(0xff),
            None => warn!("Block texture mapping returned no data"),
        }
    }
    debug!("Created {}x{} block texture", size.width, size.height);
    Ok(texture)
}
