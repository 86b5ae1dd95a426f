//! In-memory backend and segments for unit tests

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use overlay_proto::{encode_frame, FrameBufferHeader, Rect, WindowId, WindowInfo};

use super::backend::{
    DrawRect, GraphicsBackend, GraphicsError, OverlayPipelineDesc, PipelineContext, SpriteDrawer,
    SurfaceFormat, SurfaceInfo, TextureDevice, TextureSize, TextureWrite, Viewport,
};
use crate::shared::WindowRegistry;
use crate::shm::{BindError, FrameSegment, SegmentOpener};

pub fn window(id: WindowId, x: i32, y: i32, width: u32, height: u32) -> WindowInfo {
    WindowInfo {
        window_id: id,
        name: format!("window-{id}"),
        buffer_name: format!("overlay-{id}"),
        rect: Rect::new(x, y, width, height),
    }
}

/// Texture handle; counts itself in the backend's live total until dropped
#[derive(Debug)]
pub struct MockTexture {
    pub id: usize,
    pub size: TextureSize,
    live: Rc<Cell<usize>>,
}

impl Drop for MockTexture {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

pub struct MockMapping<'a> {
    bytes: &'a mut Vec<u8>,
    row_pitch: usize,
    null: bool,
    unmaps: &'a mut usize,
}

impl TextureWrite for MockMapping<'_> {
    fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.null {
            None
        } else {
            Some(self.bytes.as_mut_slice())
        }
    }
}

impl Drop for MockMapping<'_> {
    fn drop(&mut self) {
        *self.unmaps += 1;
    }
}

/// Pipeline bindings, modelled after the slots the overlay draw touches.
/// Handles are reference counted so tests can check release counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSlots {
    pub input_layout: Option<Rc<u32>>,
    pub vertex_buffer: Option<Rc<u32>>,
    pub vertex_stride: u32,
    pub vertex_offset: u32,
    pub topology: u32,
    pub vertex_shader: Option<Rc<u32>>,
    pub pixel_shader: Option<Rc<u32>>,
    pub constant_buffer: Option<Rc<u32>>,
    pub shader_resource: Option<Rc<u32>>,
    pub depth_stencil_state: Option<Rc<u32>>,
    pub stencil_ref: u32,
    pub blend_state: Option<Rc<u32>>,
    pub blend_factor: [f32; 4],
    pub sample_mask: u32,
    pub render_target: Option<Rc<u32>>,
    pub depth_stencil_view: Option<Rc<u32>>,
    pub viewports: Vec<Viewport>,
    pub rasterizer: Option<Rc<u32>>,
    pub sampler: Option<Rc<u32>>,
    /// Overlay state currently installed, if any
    pub overlay: Option<OverlayPipelineDesc>,
}

impl PipelineSlots {
    fn handles(&self) -> [&Option<Rc<u32>>; 12] {
        [
            &self.input_layout,
            &self.vertex_buffer,
            &self.vertex_shader,
            &self.pixel_shader,
            &self.constant_buffer,
            &self.shader_resource,
            &self.depth_stencil_state,
            &self.blend_state,
            &self.render_target,
            &self.depth_stencil_view,
            &self.rasterizer,
            &self.sampler,
        ]
    }

    /// Every slot refers to the very same object as in `other`
    pub fn same_handles(&self, other: &PipelineSlots) -> bool {
        self.handles()
            .iter()
            .zip(other.handles().iter())
            .all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            })
    }

    pub fn ref_counts(&self) -> Vec<usize> {
        self.handles()
            .iter()
            .map(|h| h.as_ref().map_or(0, Rc::strong_count))
            .collect()
    }
}

/// One recorded blit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub texture: usize,
    pub dest: DrawRect,
    pub with_overlay_state: bool,
}

pub struct MockBackend {
    pub surface: SurfaceInfo,
    storage: Vec<Vec<u8>>,
    pitches: Vec<usize>,
    live: Rc<Cell<usize>>,
    /// Extra bytes of GPU row padding per texture row
    pub pitch_padding: usize,
    /// Fail this many upcoming allocations
    pub fail_allocations: usize,
    pub fail_mapping: bool,
    pub null_mapping: bool,
    pub fail_prepare: bool,
    pub allocations: usize,
    pub maps: usize,
    pub unmaps: usize,
    pub restores: usize,
    pub pipeline: PipelineSlots,
    pub draws: Vec<Draw>,
    /// Registry whose share-mem lock is checked on every allocation and map
    pub watched_registry: Option<Arc<WindowRegistry>>,
    /// Allocations and maps issued while the watched share-mem lock was held
    pub gpu_calls_under_share_mem: usize,
    overlay_objects: [Rc<u32>; 4],
    sprite_objects: [Rc<u32>; 7],
}

impl MockBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: SurfaceInfo {
                width,
                height,
                format: SurfaceFormat::Bgra8Unorm,
                srgb: false,
                windowed: true,
            },
            storage: Vec::new(),
            pitches: Vec::new(),
            live: Rc::new(Cell::new(0)),
            pitch_padding: 0,
            fail_allocations: 0,
            fail_mapping: false,
            null_mapping: false,
            fail_prepare: false,
            allocations: 0,
            maps: 0,
            unmaps: 0,
            restores: 0,
            pipeline: PipelineSlots::default(),
            draws: Vec::new(),
            watched_registry: None,
            gpu_calls_under_share_mem: 0,
            overlay_objects: [1000, 1001, 1002, 1003].map(Rc::new),
            sprite_objects: [2000, 2001, 2002, 2003, 2004, 2005, 2006].map(Rc::new),
        }
    }

    /// Bind a distinct host object in every slot
    pub fn install_host_state(&mut self) {
        self.pipeline = PipelineSlots {
            input_layout: Some(Rc::new(1)),
            vertex_buffer: Some(Rc::new(2)),
            vertex_stride: 32,
            vertex_offset: 4,
            topology: 5,
            vertex_shader: Some(Rc::new(3)),
            pixel_shader: Some(Rc::new(4)),
            constant_buffer: Some(Rc::new(5)),
            shader_resource: Some(Rc::new(6)),
            depth_stencil_state: Some(Rc::new(7)),
            stencil_ref: 3,
            blend_state: Some(Rc::new(8)),
            blend_factor: [0.5, 0.25, 1.0, 0.0],
            sample_mask: 0x0f0f,
            render_target: Some(Rc::new(9)),
            depth_stencil_view: Some(Rc::new(10)),
            viewports: vec![
                Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: 640.0,
                    height: 360.0,
                    min_depth: 0.0,
                    max_depth: 1.0,
                },
                Viewport {
                    x: 640.0,
                    y: 0.0,
                    width: 640.0,
                    height: 360.0,
                    min_depth: 0.5,
                    max_depth: 1.0,
                },
            ],
            rasterizer: Some(Rc::new(11)),
            sampler: Some(Rc::new(12)),
            overlay: None,
        };
    }

    fn note_gpu_call(&mut self) {
        if self
            .watched_registry
            .as_ref()
            .is_some_and(|registry| registry.share_mem_locked())
        {
            self.gpu_calls_under_share_mem += 1;
        }
    }

    /// Textures currently alive
    pub fn live_textures(&self) -> usize {
        self.live.get()
    }

    pub fn row_pitch(&self, texture: &MockTexture) -> usize {
        self.pitches[texture.id]
    }

    /// Read back one BGRA pixel
    pub fn pixel(&self, texture: &MockTexture, x: u32, y: u32) -> u32 {
        let offset = y as usize * self.pitches[texture.id] + x as usize * 4;
        let bytes = &self.storage[texture.id][offset..offset + 4];
        u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl TextureDevice for MockBackend {
    type Texture = MockTexture;
    type Mapping<'a> = MockMapping<'a>;

    fn create_dynamic_texture(&mut self, size: TextureSize) -> Result<MockTexture, GraphicsError> {
        self.note_gpu_call();
        if self.fail_allocations > 0 {
            self.fail_allocations -= 1;
            return Err(GraphicsError::TextureAllocation {
                width: size.width,
                height: size.height,
                reason: "injected failure".into(),
            });
        }
        let pitch = size.width as usize * 4 + self.pitch_padding;
        self.storage.push(vec![0; pitch * size.height as usize]);
        self.pitches.push(pitch);
        self.allocations += 1;
        self.live.set(self.live.get() + 1);
        Ok(MockTexture {
            id: self.storage.len() - 1,
            size,
            live: self.live.clone(),
        })
    }

    fn texture_size(&self, texture: &MockTexture) -> TextureSize {
        texture.size
    }

    fn map_write<'a>(&'a mut self, texture: &'a MockTexture) -> Result<MockMapping<'a>, GraphicsError> {
        self.note_gpu_call();
        self.maps += 1;
        if self.fail_mapping {
            return Err(GraphicsError::Mapping {
                reason: "injected failure".into(),
            });
        }
        let MockBackend {
            storage,
            pitches,
            null_mapping,
            unmaps,
            ..
        } = self;
        Ok(MockMapping {
            bytes: &mut storage[texture.id],
            row_pitch: pitches[texture.id],
            null: *null_mapping,
            unmaps,
        })
    }
}

impl PipelineContext for MockBackend {
    type Snapshot = PipelineSlots;

    fn save_state(&mut self) -> PipelineSlots {
        self.pipeline.clone()
    }

    fn install_overlay_state(&mut self, desc: &OverlayPipelineDesc) -> Result<(), GraphicsError> {
        if self.fail_prepare {
            return Err(GraphicsError::Device {
                reason: "injected failure".into(),
            });
        }
        let [depth, blend, target, raster] = &self.overlay_objects;
        self.pipeline.depth_stencil_state = Some(depth.clone());
        self.pipeline.stencil_ref = 0;
        self.pipeline.blend_state = Some(blend.clone());
        self.pipeline.blend_factor = desc.blend_factor;
        self.pipeline.sample_mask = desc.sample_mask;
        self.pipeline.render_target = Some(target.clone());
        self.pipeline.depth_stencil_view = None;
        self.pipeline.rasterizer = Some(raster.clone());
        self.pipeline.viewports = vec![desc.viewport];
        self.pipeline.overlay = Some(*desc);
        Ok(())
    }

    fn restore_state(&mut self, snapshot: PipelineSlots) {
        self.restores += 1;
        self.pipeline = snapshot;
    }
}

impl SpriteDrawer for MockBackend {
    fn draw_unscaled(&mut self, texture: &MockTexture, dest: DrawRect) {
        // the quad drawer binds its own shaders, buffers and sampler
        let [layout, buffer, vs, ps, constants, view, sampler] = &self.sprite_objects;
        self.pipeline.input_layout = Some(layout.clone());
        self.pipeline.vertex_buffer = Some(buffer.clone());
        self.pipeline.vertex_stride = 16;
        self.pipeline.vertex_offset = 0;
        self.pipeline.topology = 4;
        self.pipeline.vertex_shader = Some(vs.clone());
        self.pipeline.pixel_shader = Some(ps.clone());
        self.pipeline.constant_buffer = Some(constants.clone());
        self.pipeline.shader_resource = Some(view.clone());
        self.pipeline.sampler = Some(sampler.clone());

        self.draws.push(Draw {
            texture: texture.id,
            dest,
            with_overlay_state: self.pipeline.overlay.is_some(),
        });
    }
}

impl GraphicsBackend for MockBackend {
    fn surface(&self) -> SurfaceInfo {
        self.surface
    }
}

/// A segment shared with the test, which may rewrite it at any time
#[derive(Debug, Clone)]
pub struct MemorySegment(Rc<RefCell<Vec<u8>>>);

impl FrameSegment for MemorySegment {
    fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0.borrow())
    }
}

/// Named in-memory segments; clones share the same namespace
#[derive(Debug, Clone, Default)]
pub struct MemorySegments {
    segments: Rc<RefCell<HashMap<String, Rc<RefCell<Vec<u8>>>>>>,
    broken: Rc<RefCell<HashSet<String>>>,
}

impl MemorySegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a segment; open bindings see the new bytes
    pub fn put(&self, name: &str, bytes: Vec<u8>) {
        let mut segments = self.segments.borrow_mut();
        match segments.get(name) {
            Some(existing) => *existing.borrow_mut() = bytes,
            None => {
                segments.insert(name.to_string(), Rc::new(RefCell::new(bytes)));
            }
        }
    }

    /// Write a frame filled with one pixel value
    pub fn put_frame(&self, name: &str, x: i32, y: i32, width: u32, height: u32, fill: u32) {
        let header = FrameBufferHeader { width, height, x, y };
        let pixels = vec![fill; width as usize * height as usize];
        self.put(name, encode_frame(&header, &pixels));
    }

    /// Make opening `name` fail with an I/O error
    pub fn break_segment(&self, name: &str) {
        self.broken.borrow_mut().insert(name.to_string());
    }
}

impl SegmentOpener for MemorySegments {
    type Segment = MemorySegment;

    fn open_read_only(&self, name: &str) -> Result<MemorySegment, BindError> {
        if self.broken.borrow().contains(name) {
            return Err(BindError::Io {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"),
            });
        }
        self.segments
            .borrow()
            .get(name)
            .map(|bytes| MemorySegment(bytes.clone()))
            .ok_or_else(|| BindError::NotFound {
                name: name.to_string(),
            })
    }
}
