//! Shared frame reader
//!
//! Copies a window's current frame out of its shared-memory segment into the
//! sprite texture. The segment header is authoritative for the sprite's size
//! and position; the texture is grown (never shrunk) when the window outgrows
//! it.

use thiserror::Error;
use tracing::{debug, trace, warn};

use overlay_proto::FrameBufferHeader;

use super::backend::{GraphicsError, TextureDevice, TextureWrite};
use super::sprite::WindowSprite;
use super::texture::{allocate_dynamic_texture, needs_growth};
use crate::shared::WindowRegistry;
use crate::shm::FrameSegment;

/// Why a frame could not be copied
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("sprite has no shared memory binding")]
    MissingBinding,

    #[error("segment too short for a frame header ({len} bytes)")]
    TruncatedHeader { len: usize },

    #[error("segment holds {actual} bytes, frame needs {expected}")]
    TruncatedPixels { expected: usize, actual: usize },

    #[error("mapped texture too small: pitch {row_pitch}, {rows} rows, {len} bytes")]
    MappingTooSmall {
        row_pitch: usize,
        rows: usize,
        len: usize,
    },

    #[error(transparent)]
    Graphics(#[from] GraphicsError),
}

/// Result of a content refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// `rows` rows were written; `reallocated` if the texture was replaced
    Copied { rows: u32, reallocated: bool },
    /// The mapping yielded no pointer; previous content is kept
    Skipped,
}

/// Refresh a sprite from its bound segment.
///
/// The share-mem lock is taken twice: once to read the header, and once around
/// the byte copy into the already mapped texture. Texture growth and `Map` run
/// without it so producers are never blocked on the GPU. The texture mapping is
/// released before returning on every path.
pub fn refresh_sprite<D, S>(
    device: &mut D,
    sprite: &mut WindowSprite<D::Texture, S>,
    registry: &WindowRegistry,
) -> Result<CopyOutcome, FrameError>
where
    D: TextureDevice,
    S: FrameSegment,
{
    let window_id = sprite.window_id;
    let segment = sprite.binding.as_ref().ok_or(FrameError::MissingBinding)?;

    let header = {
        let _share_mem = registry.lock_share_mem();
        segment.with_bytes(|bytes| read_frame_header(bytes).map(|(header, _)| header))?
    };
    sprite.rect = header.rect();

    let current = sprite.texture.as_ref().map(|t| device.texture_size(t));
    let grow = current.map_or(true, |size| needs_growth(size, header.width, header.height));
    if grow {
        // each axis keeps at least its current extent
        let (width, height) = match current {
            Some(size) => (size.width.max(header.width), size.height.max(header.height)),
            None => (header.width, header.height),
        };
        trace!(
            "Texture of window {} smaller than {}x{}, growing",
            window_id, header.width, header.height
        );
        sprite.texture = None;
        sprite.texture = Some(allocate_dynamic_texture(device, width, height)?);
    }

    let Some(target) = sprite.texture.as_ref() else {
        return Ok(CopyOutcome::Skipped);
    };
    let size = device.texture_size(target);
    let mut mapping = device.map_write(target)?;

    let copied = {
        let _share_mem = registry.lock_share_mem();
        segment.with_bytes(|bytes| -> Result<Option<(FrameBufferHeader, CopyOutcome)>, FrameError> {
            let (header, frame_len) = read_frame_header(bytes)?;
            if !size.covers(header.width, header.height) {
                debug!(
                    "Window {} grew to {}x{} while mapping, skipping frame",
                    window_id, header.width, header.height
                );
                return Ok(None);
            }
            let pixels = &bytes[FrameBufferHeader::size()..frame_len];
            copy_rows(&mut mapping, &header, pixels).map(|outcome| Some((header, outcome)))
        })?
    };

    Ok(match copied {
        Some((header, CopyOutcome::Copied { rows, .. })) => {
            sprite.rect = header.rect();
            CopyOutcome::Copied {
                rows,
                reallocated: grow,
            }
        }
        Some((_, CopyOutcome::Skipped)) | None => CopyOutcome::Skipped,
    })
}

/// Parse and validate the header; returns it with the byte length of the whole frame
fn read_frame_header(bytes: &[u8]) -> Result<(FrameBufferHeader, usize), FrameError> {
    let header =
        FrameBufferHeader::read(bytes).ok_or(FrameError::TruncatedHeader { len: bytes.len() })?;
    let frame_len = header.frame_len().ok_or(FrameError::TruncatedPixels {
        expected: usize::MAX,
        actual: bytes.len(),
    })?;
    if bytes.len() < frame_len {
        return Err(FrameError::TruncatedPixels {
            expected: frame_len,
            actual: bytes.len(),
        });
    }
    Ok((header, frame_len))
}

/// Copy `header.height` dense source rows into the mapped texture, placing
/// row `i` at `i * row_pitch` of the destination.
fn copy_rows<M: TextureWrite>(
    mapping: &mut M,
    header: &FrameBufferHeader,
    pixels: &[u8],
) -> Result<CopyOutcome, FrameError> {
    let row_pitch = mapping.row_pitch();
    let rows = header.height as usize;
    let row_bytes = header.row_bytes().unwrap_or(usize::MAX);

    let Some(dst) = mapping.bytes_mut() else {
        warn!("Texture mapping returned no data, skipping frame");
        return Ok(CopyOutcome::Skipped);
    };

    if rows == 0 || row_bytes == 0 {
        return Ok(CopyOutcome::Copied {
            rows: 0,
            reallocated: false,
        });
    }

    let required = (rows - 1)
        .checked_mul(row_pitch)
        .and_then(|n| n.checked_add(row_bytes));
    if row_bytes > row_pitch || required.map_or(true, |n| n > dst.len()) {
        return Err(FrameError::MappingTooSmall {
            row_pitch,
            rows,
            len: dst.len(),
        });
    }

    for (i, src_row) in pixels.chunks_exact(row_bytes).take(rows).enumerate() {
        let start = i * row_pitch;
        dst[start..start + row_bytes].copy_from_slice(src_row);
    }

    Ok(CopyOutcome::Copied {
        rows: header.height,
        reallocated: false,
    })
}
