//! Direct3D 11 backend
//!
//! Binds to the host's swap chain. Every COM pointer is owned by a Rust value,
//! so captured pipeline objects are released exactly once when the snapshot
//! holding them is dropped.

use anyhow::{Context, Result};
use std::slice;
use tracing::{debug, info};

use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::IDXGISwapChain;

use super::backend::{
    BlendFactor, CullMode, DrawRect, FillMode, GraphicsBackend, GraphicsError,
    OverlayPipelineDesc, PipelineContext, SpriteDrawer, SurfaceFormat, SurfaceInfo, TextureDevice,
    TextureSize, TextureWrite,
};

/// The sprite-quad drawer. Binds its own shaders, buffers and sampler and
/// draws `view` into `dest` on the context's current render target.
pub trait QuadRenderer {
    fn draw_quad(
        &mut self,
        context: &ID3D11DeviceContext,
        view: &ID3D11ShaderResourceView,
        dest: DrawRect,
    );
}

pub struct D3d11Texture {
    texture: ID3D11Texture2D,
    view: ID3D11ShaderResourceView,
    size: TextureSize,
}

impl D3d11Texture {
    pub fn view(&self) -> &ID3D11ShaderResourceView {
        &self.view
    }
}

/// A `Map(WRITE_DISCARD)` of a sprite texture; unmapped on drop
pub struct D3d11Mapping<'a> {
    context: &'a ID3D11DeviceContext,
    texture: &'a ID3D11Texture2D,
    data: *mut u8,
    row_pitch: usize,
    len: usize,
}

impl TextureWrite for D3d11Mapping<'_> {
    fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.data.is_null() {
            return None;
        }
        // The mapping covers row_pitch * height bytes until Unmap
        Some(unsafe { slice::from_raw_parts_mut(self.data, self.len) })
    }
}

impl Drop for D3d11Mapping<'_> {
    fn drop(&mut self) {
        unsafe { self.context.Unmap(self.texture, 0) };
    }
}

/// Host pipeline bindings captured before the overlay draw
#[derive(Default)]
pub struct SavedPipelineState {
    input_layout: Option<ID3D11InputLayout>,
    vertex_buffer: Option<ID3D11Buffer>,
    vertex_stride: u32,
    vertex_offset: u32,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    vertex_shader: Option<ID3D11VertexShader>,
    pixel_shader: Option<ID3D11PixelShader>,
    constant_buffer: [Option<ID3D11Buffer>; 1],
    shader_resource: [Option<ID3D11ShaderResourceView>; 1],
    depth_stencil_state: Option<ID3D11DepthStencilState>,
    stencil_ref: u32,
    blend_state: Option<ID3D11BlendState>,
    blend_factor: [f32; 4],
    sample_mask: u32,
    render_target: [Option<ID3D11RenderTargetView>; 1],
    depth_stencil_view: Option<ID3D11DepthStencilView>,
    viewports: Vec<D3D11_VIEWPORT>,
    rasterizer: Option<ID3D11RasterizerState>,
    sampler: [Option<ID3D11SamplerState>; 1],
}

/// Device objects built from one `OverlayPipelineDesc`
struct OverlayStates {
    desc: OverlayPipelineDesc,
    depth: ID3D11DepthStencilState,
    blend: ID3D11BlendState,
    rasterizer: ID3D11RasterizerState,
}

pub struct D3d11Backend {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    render_target: ID3D11RenderTargetView,
    surface: SurfaceInfo,
    overlay: Option<OverlayStates>,
    drawer: Box<dyn QuadRenderer>,
}

impl D3d11Backend {
    /// Bind to the swap chain's device and back buffer
    pub fn new(swap_chain: &IDXGISwapChain, drawer: Box<dyn QuadRenderer>) -> Result<Self> {
        unsafe {
            let device: ID3D11Device = swap_chain
                .GetDevice()
                .context("Swap chain has no D3D11 device")?;
            let context = device
                .GetImmediateContext()
                .context("Failed to get immediate context")?;

            let back_buffer: ID3D11Texture2D = swap_chain
                .GetBuffer(0)
                .context("Failed to get back buffer")?;
            let swap_desc = swap_chain
                .GetDesc()
                .context("Failed to query swap chain")?;
            let mut texture_desc = D3D11_TEXTURE2D_DESC::default();
            back_buffer.GetDesc(&mut texture_desc);

            let (format, srgb) = surface_format(swap_desc.BufferDesc.Format);
            let surface = SurfaceInfo {
                width: texture_desc.Width,
                height: texture_desc.Height,
                format,
                srgb,
                windowed: swap_desc.Windowed.as_bool(),
            };

            let mut render_target: Option<ID3D11RenderTargetView> = None;
            device
                .CreateRenderTargetView(&back_buffer, None, Some(&mut render_target))
                .context("Failed to create render target view")?;
            let render_target = render_target.context("Render target view is null")?;

            info!(
                "D3D11 backend bound: {}x{} {:?}",
                surface.width, surface.height, swap_desc.BufferDesc.Format
            );

            Ok(Self {
                device,
                context,
                render_target,
                surface,
                overlay: None,
                drawer,
            })
        }
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    fn overlay_states(&mut self, desc: &OverlayPipelineDesc) -> Result<&OverlayStates, GraphicsError> {
        let stale = self.overlay.as_ref().map_or(true, |states| states.desc != *desc);
        if stale {
            debug!("Creating overlay pipeline states");
            self.overlay = None;
            self.overlay = Some(self.create_overlay_states(desc)?);
        }
        self.overlay.as_ref().ok_or_else(|| device_error("overlay states missing"))
    }

    fn create_overlay_states(&self, desc: &OverlayPipelineDesc) -> Result<OverlayStates, GraphicsError> {
        let depth_desc = D3D11_DEPTH_STENCIL_DESC {
            DepthEnable: desc.depth_test.into(),
            DepthWriteMask: D3D11_DEPTH_WRITE_MASK_ALL,
            DepthFunc: D3D11_COMPARISON_LESS,
            StencilEnable: false.into(),
            StencilReadMask: 0xff,
            StencilWriteMask: 0xff,
            ..Default::default()
        };

        let mut blend_desc = D3D11_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: false.into(),
            ..Default::default()
        };
        blend_desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
            BlendEnable: desc.blend.enabled.into(),
            SrcBlend: blend_factor(desc.blend.src_color),
            DestBlend: blend_factor(desc.blend.dst_color),
            BlendOp: D3D11_BLEND_OP_ADD,
            SrcBlendAlpha: blend_factor(desc.blend.src_alpha),
            DestBlendAlpha: blend_factor(desc.blend.dst_alpha),
            BlendOpAlpha: D3D11_BLEND_OP_ADD,
            RenderTargetWriteMask: desc.blend.write_mask,
        };

        let rasterizer_desc = D3D11_RASTERIZER_DESC {
            FillMode: match desc.fill {
                FillMode::Solid => D3D11_FILL_SOLID,
                FillMode::Wireframe => D3D11_FILL_WIREFRAME,
            },
            CullMode: match desc.cull {
                CullMode::None => D3D11_CULL_NONE,
                CullMode::Front => D3D11_CULL_FRONT,
                CullMode::Back => D3D11_CULL_BACK,
            },
            FrontCounterClockwise: false.into(),
            DepthClipEnable: desc.depth_clip.into(),
            ..Default::default()
        };

        unsafe {
            let mut depth = None;
            self.device
                .CreateDepthStencilState(&depth_desc, Some(&mut depth))
                .map_err(device_error)?;
            let mut blend = None;
            self.device
                .CreateBlendState(&blend_desc, Some(&mut blend))
                .map_err(device_error)?;
            let mut rasterizer = None;
            self.device
                .CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer))
                .map_err(device_error)?;

            match (depth, blend, rasterizer) {
                (Some(depth), Some(blend), Some(rasterizer)) => Ok(OverlayStates {
                    desc: *desc,
                    depth,
                    blend,
                    rasterizer,
                }),
                _ => Err(device_error("state creation returned null")),
            }
        }
    }
}

impl TextureDevice for D3d11Backend {
    type Texture = D3d11Texture;
    type Mapping<'a> = D3d11Mapping<'a>;

    fn create_dynamic_texture(&mut self, size: TextureSize) -> Result<D3d11Texture, GraphicsError> {
        let allocation_error = |reason: String| GraphicsError::TextureAllocation {
            width: size.width,
            height: size.height,
            reason,
        };

        let desc = D3D11_TEXTURE2D_DESC {
            Width: size.width,
            Height: size.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
        };

        unsafe {
            let mut texture: Option<ID3D11Texture2D> = None;
            self.device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(|e| allocation_error(e.to_string()))?;
            let texture = texture.ok_or_else(|| allocation_error("null texture".into()))?;

            let mut view: Option<ID3D11ShaderResourceView> = None;
            self.device
                .CreateShaderResourceView(&texture, None, Some(&mut view))
                .map_err(|e| allocation_error(e.to_string()))?;
            let view = view.ok_or_else(|| allocation_error("null shader resource view".into()))?;

            Ok(D3d11Texture {
                texture,
                view,
                size,
            })
        }
    }

    fn texture_size(&self, texture: &D3d11Texture) -> TextureSize {
        texture.size
    }

    fn map_write<'a>(&'a mut self, texture: &'a D3d11Texture) -> Result<D3d11Mapping<'a>, GraphicsError> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&texture.texture, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
                .map_err(|e| GraphicsError::Mapping {
                    reason: e.to_string(),
                })?;
        }

        let row_pitch = mapped.RowPitch as usize;
        Ok(D3d11Mapping {
            context: &self.context,
            texture: &texture.texture,
            data: mapped.pData.cast::<u8>(),
            row_pitch,
            len: row_pitch * texture.size.height as usize,
        })
    }
}

impl PipelineContext for D3d11Backend {
    type Snapshot = SavedPipelineState;

    fn save_state(&mut self) -> SavedPipelineState {
        let mut saved = SavedPipelineState::default();
        let ctx = &self.context;

        unsafe {
            saved.input_layout = ctx.IAGetInputLayout().ok();
            ctx.IAGetVertexBuffers(
                0,
                1,
                Some(&mut saved.vertex_buffer),
                Some(&mut saved.vertex_stride),
                Some(&mut saved.vertex_offset),
            );
            ctx.IAGetPrimitiveTopology(&mut saved.topology);

            ctx.VSGetShader(&mut saved.vertex_shader, None, None);
            ctx.PSGetShader(&mut saved.pixel_shader, None, None);
            ctx.VSGetConstantBuffers(0, Some(&mut saved.constant_buffer));
            ctx.PSGetShaderResources(0, Some(&mut saved.shader_resource));

            ctx.OMGetDepthStencilState(
                Some(&mut saved.depth_stencil_state),
                Some(&mut saved.stencil_ref),
            );
            ctx.OMGetBlendState(
                Some(&mut saved.blend_state),
                Some(&mut saved.blend_factor),
                Some(&mut saved.sample_mask),
            );
            ctx.OMGetRenderTargets(
                Some(&mut saved.render_target),
                Some(&mut saved.depth_stencil_view),
            );

            let mut count = D3D11_VIEWPORT_AND_SCISSORRECT_OBJECT_COUNT_PER_PIPELINE;
            saved.viewports = vec![D3D11_VIEWPORT::default(); count as usize];
            ctx.RSGetViewports(&mut count, Some(saved.viewports.as_mut_ptr()));
            saved.viewports.truncate(count as usize);

            saved.rasterizer = ctx.RSGetState().ok();
            ctx.PSGetSamplers(0, Some(&mut saved.sampler));
        }

        saved
    }

    fn install_overlay_state(&mut self, desc: &OverlayPipelineDesc) -> Result<(), GraphicsError> {
        let context = self.context.clone();
        let render_target = self.render_target.clone();
        let states = self.overlay_states(desc)?;

        let viewport = D3D11_VIEWPORT {
            TopLeftX: desc.viewport.x,
            TopLeftY: desc.viewport.y,
            Width: desc.viewport.width,
            Height: desc.viewport.height,
            MinDepth: desc.viewport.min_depth,
            MaxDepth: desc.viewport.max_depth,
        };

        unsafe {
            context.OMSetDepthStencilState(&states.depth, 0);
            context.OMSetBlendState(&states.blend, Some(&desc.blend_factor), desc.sample_mask);
            context.OMSetRenderTargets(Some(&[Some(render_target)]), None::<&ID3D11DepthStencilView>);
            context.RSSetState(&states.rasterizer);
            context.RSSetViewports(Some(&[viewport]));
        }
        Ok(())
    }

    fn restore_state(&mut self, saved: SavedPipelineState) {
        let ctx = &self.context;

        unsafe {
            ctx.IASetInputLayout(saved.input_layout.as_ref());
            ctx.IASetVertexBuffers(
                0,
                1,
                Some(&saved.vertex_buffer),
                Some(&saved.vertex_stride),
                Some(&saved.vertex_offset),
            );
            ctx.IASetPrimitiveTopology(saved.topology);

            ctx.VSSetShader(saved.vertex_shader.as_ref(), None);
            ctx.PSSetShader(saved.pixel_shader.as_ref(), None);
            ctx.VSSetConstantBuffers(0, Some(&saved.constant_buffer));
            ctx.PSSetShaderResources(0, Some(&saved.shader_resource));

            ctx.OMSetDepthStencilState(saved.depth_stencil_state.as_ref(), saved.stencil_ref);
            ctx.OMSetBlendState(
                saved.blend_state.as_ref(),
                Some(&saved.blend_factor),
                saved.sample_mask,
            );
            ctx.OMSetRenderTargets(Some(&saved.render_target), saved.depth_stencil_view.as_ref());

            ctx.RSSetViewports(Some(&saved.viewports));
            ctx.RSSetState(saved.rasterizer.as_ref());
            ctx.PSSetSamplers(0, Some(&saved.sampler));
        }
        // `saved` drops here, releasing each captured reference once
    }
}

impl SpriteDrawer for D3d11Backend {
    fn draw_unscaled(&mut self, texture: &D3d11Texture, dest: DrawRect) {
        self.drawer.draw_quad(&self.context, &texture.view, dest);
    }
}

impl GraphicsBackend for D3d11Backend {
    fn surface(&self) -> SurfaceInfo {
        self.surface
    }
}

/// Copy-compatible UNORM format of a back buffer, and whether it was sRGB
pub fn surface_format(format: DXGI_FORMAT) -> (SurfaceFormat, bool) {
    match format {
        DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_B8G8R8A8_TYPELESS => {
            (SurfaceFormat::Bgra8Unorm, false)
        }
        DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => (SurfaceFormat::Bgra8Unorm, true),
        DXGI_FORMAT_R8G8B8A8_UNORM | DXGI_FORMAT_R8G8B8A8_TYPELESS => {
            (SurfaceFormat::Rgba8Unorm, false)
        }
        DXGI_FORMAT_R8G8B8A8_UNORM_SRGB => (SurfaceFormat::Rgba8Unorm, true),
        DXGI_FORMAT_R10G10B10A2_UNORM | DXGI_FORMAT_R10G10B10A2_TYPELESS => {
            (SurfaceFormat::Rgb10A2Unorm, false)
        }
        DXGI_FORMAT_R16G16B16A16_FLOAT | DXGI_FORMAT_R16G16B16A16_TYPELESS => {
            (SurfaceFormat::Rgba16Float, false)
        }
        other => (SurfaceFormat::Other(other.0 as u32), false),
    }
}

fn blend_factor(factor: BlendFactor) -> D3D11_BLEND {
    match factor {
        BlendFactor::Zero => D3D11_BLEND_ZERO,
        BlendFactor::One => D3D11_BLEND_ONE,
        BlendFactor::SrcAlpha => D3D11_BLEND_SRC_ALPHA,
        BlendFactor::InvSrcAlpha => D3D11_BLEND_INV_SRC_ALPHA,
    }
}

fn device_error(reason: impl ToString) -> GraphicsError {
    GraphicsError::Device {
        reason: reason.to_string(),
    }
}
