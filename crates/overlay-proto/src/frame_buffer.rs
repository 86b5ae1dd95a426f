//! Shared-memory frame buffer layout.
//!
//! The producer process owns one named segment per window. The segment starts
//! with a `FrameBufferHeader` and is immediately followed by the window's
//! pixels:
//!
//! - Header: `FrameBufferHeader` (16 bytes, native endian)
//! - Payload: `[u32; width * height]` packed BGRA, row-major, no row padding
//!
//! The compositor only ever reads these segments.

use bytemuck::{Pod, Zeroable};
use std::mem;

use crate::Rect;

/// Bytes per pixel in the payload (BGRA8).
pub const BYTES_PER_PIXEL: usize = 4;

/// Header at the start of every window frame segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameBufferHeader {
    /// Current width of the source window in pixels
    pub width: u32,
    /// Current height of the source window in pixels
    pub height: u32,
    /// Current position of the source window on the host surface
    pub x: i32,
    pub y: i32,
}

impl FrameBufferHeader {
    /// Size of the header in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }

    /// Read the header from the start of a segment.
    ///
    /// Returns `None` if the segment is shorter than the header. The segment
    /// carries no alignment guarantee, so the read is unaligned.
    pub fn read(segment: &[u8]) -> Option<Self> {
        segment
            .get(..Self::size())
            .map(bytemuck::pod_read_unaligned::<Self>)
    }

    /// Write the header to the start of `segment`.
    ///
    /// Returns `false` if the segment cannot hold the header.
    pub fn write(&self, segment: &mut [u8]) -> bool {
        match segment.get_mut(..Self::size()) {
            Some(dst) => {
                dst.copy_from_slice(bytemuck::bytes_of(self));
                true
            }
            None => false,
        }
    }

    /// Bytes of one source row
    pub fn row_bytes(&self) -> Option<usize> {
        (self.width as usize).checked_mul(BYTES_PER_PIXEL)
    }

    /// Bytes of the pixel payload following the header
    pub fn pixel_bytes(&self) -> Option<usize> {
        self.row_bytes()?.checked_mul(self.height as usize)
    }

    /// Total segment length needed for this header and its payload
    pub fn frame_len(&self) -> Option<usize> {
        self.pixel_bytes()?.checked_add(Self::size())
    }

    /// Placement described by the header
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// Build a complete segment image (header followed by pixels).
///
/// Used by producers that stage a frame before copying it into the shared
/// segment. Pixels beyond `width * height` are ignored; missing pixels are zero.
pub fn encode_frame(header: &FrameBufferHeader, pixels: &[u32]) -> Vec<u8> {
    let len = header.frame_len().unwrap_or(FrameBufferHeader::size());
    let mut segment = vec![0u8; len];
    header.write(&mut segment);

    let payload = &mut segment[FrameBufferHeader::size()..];
    let count = (payload.len() / BYTES_PER_PIXEL).min(pixels.len());
    payload[..count * BYTES_PER_PIXEL].copy_from_slice(bytemuck::cast_slice(&pixels[..count]));
    segment
}
