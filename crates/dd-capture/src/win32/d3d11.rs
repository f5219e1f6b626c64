use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};
use windows::Win32::Foundation::{HANDLE, HMODULE};
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCOMPILE_ENABLE_STRICTNESS, D3DCompile};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE, D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_REFERENCE, D3D_DRIVER_TYPE_WARP, D3D_FEATURE_LEVEL,
    D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_11_0,
    D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST, ID3DBlob,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_VERTEX_BUFFER, D3D11_BOX, D3D11_BUFFER_DESC,
    D3D11_COMPARISON_NEVER, D3D11_CPU_ACCESS_READ, D3D11_CPU_ACCESS_WRITE, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_FILTER_MIN_MAG_MIP_LINEAR, D3D11_INPUT_ELEMENT_DESC, D3D11_INPUT_PER_VERTEX_DATA, D3D11_MAP_READ,
    D3D11_MAP_WRITE_DISCARD, D3D11_MAPPED_SUBRESOURCE, D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX, D3D11_SAMPLER_DESC,
    D3D11_SDK_VERSION, D3D11_TEXTURE_ADDRESS_CLAMP, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_USAGE_DYNAMIC,
    D3D11_USAGE_STAGING, D3D11_VIEWPORT, D3D11CreateDevice, ID3D11BlendState, ID3D11Buffer,
    ID3D11DepthStencilView, ID3D11Device, ID3D11DeviceContext, ID3D11InputLayout, ID3D11PixelShader,
    ID3D11RenderTargetView, ID3D11SamplerState, ID3D11ShaderResourceView, ID3D11Texture2D, ID3D11VertexShader,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R32G32_FLOAT, DXGI_FORMAT_R32G32B32_FLOAT, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{IDXGIAdapter, IDXGIDevice, IDXGIKeyedMutex, IDXGIOutput1, IDXGIResource};
use windows::core::{Interface, PCSTR, s};

use super::dd::DxgiDuplication;
use super::sample::D3D11Sample;
use super::{graphics, monitor};
use crate::geometry::{OutputDescription, Rect};
use crate::platform::{BYTES_PER_PIXEL, DriverType, GpuDevice, TextureDesc, TextureUsage, Vertex};
use crate::{CaptureError, Result};

const FEATURE_LEVELS: [D3D_FEATURE_LEVEL; 4] =
    [D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_9_1];

const SHADERS: &str = include_str!("shaders.hlsl");

/// Key used for both acquire and release of shared surfaces.
const SHARED_KEY: u64 = 0;

/// A 2D BGRA texture owned by one device.
#[derive(Clone)]
pub struct D3D11Texture {
    texture: ID3D11Texture2D,
    width: u32,
    height: u32,
    usage: TextureUsage,
}

// D3D11 resources are free-threaded; only the immediate context needs serializing.
unsafe impl Send for D3D11Texture {}
unsafe impl Sync for D3D11Texture {}

impl D3D11Texture {
    pub(super) fn wrap(texture: ID3D11Texture2D) -> Self {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        let usage = if desc.Usage == D3D11_USAGE_STAGING {
            TextureUsage::Staging
        } else {
            TextureUsage::Default
        };
        Self { texture, width: desc.Width, height: desc.Height, usage }
    }

    pub fn raw(&self) -> &ID3D11Texture2D {
        &self.texture
    }
}

/// Legacy DXGI shared handle through which a second device opens a texture.
#[derive(Debug, Clone, Copy)]
pub struct SharedHandle(HANDLE);

unsafe impl Send for SharedHandle {}
unsafe impl Sync for SharedHandle {}

/// Vertex and pixel shader pair plus the state shared by every blit on a device.
struct BlitShaders {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    input_layout: ID3D11InputLayout,
    sampler: ID3D11SamplerState,
}

struct Immediate {
    context: ID3D11DeviceContext,
    /// CPU-readable copy target reused when reading back GPU textures.
    readback: Option<D3D11Texture>,
    shaders: Option<BlitShaders>,
}

/// Precompiled blit shaders used instead of compiling the embedded HLSL at runtime.
#[derive(Debug, Clone, Default)]
pub struct ShaderBytecode {
    pub vertex: Vec<u8>,
    pub pixel: Vec<u8>,
}

pub struct D3D11Device {
    driver: DriverType,
    bytecode: Option<Arc<ShaderBytecode>>,
    device: ID3D11Device,
    adapter: IDXGIAdapter,
    immediate: Mutex<Immediate>,
}

unsafe impl Send for D3D11Device {}
unsafe impl Sync for D3D11Device {}

/// Render target plus a grow-only dynamic vertex buffer.
pub struct D3D11Pipeline {
    target: D3D11Texture,
    render_target: ID3D11RenderTargetView,
    vertex_buffer: Option<ID3D11Buffer>,
    vertex_capacity: usize,
}

unsafe impl Send for D3D11Pipeline {}

impl D3D11Device {
    pub fn new(driver: DriverType, bytecode: Option<Arc<ShaderBytecode>>) -> Result<Self> {
        let driver_type: D3D_DRIVER_TYPE = match driver {
            DriverType::Hardware => D3D_DRIVER_TYPE_HARDWARE,
            DriverType::Warp => D3D_DRIVER_TYPE_WARP,
            DriverType::Reference => D3D_DRIVER_TYPE_REFERENCE,
        };

        let mut device = None;
        let mut context = None;
        let mut level = D3D_FEATURE_LEVEL::default();
        unsafe {
            D3D11CreateDevice(
                None,
                driver_type,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&FEATURE_LEVELS),
                D3D11_SDK_VERSION,
                Some(&mut device),
                Some(&mut level),
                Some(&mut context),
            )
        }
        .map_err(graphics("D3D11CreateDevice"))?;

        let device: ID3D11Device = device.ok_or_else(|| missing("D3D11 device"))?;
        let context = context.ok_or_else(|| missing("D3D11 immediate context"))?;

        let dxgi_device: IDXGIDevice = device.cast().map_err(graphics("IDXGIDevice"))?;
        let adapter = unsafe { dxgi_device.GetAdapter() }.map_err(graphics("IDXGIDevice::GetAdapter"))?;

        info!("D3D11 {:?} device created at feature level {:#x}", driver, level.0);
        Ok(Self {
            driver,
            bytecode,
            device,
            adapter,
            immediate: Mutex::new(Immediate { context, readback: None, shaders: None }),
        })
    }

    pub fn raw(&self) -> &ID3D11Device {
        &self.device
    }

    fn create_texture2d(&self, desc: &D3D11_TEXTURE2D_DESC) -> Result<D3D11Texture> {
        let mut texture = None;
        unsafe { self.device.CreateTexture2D(desc, None, Some(&mut texture)) }
            .map_err(graphics("CreateTexture2D"))?;
        Ok(D3D11Texture::wrap(texture.ok_or_else(|| missing("texture"))?))
    }

    fn keyed_mutex(texture: &D3D11Texture) -> Result<IDXGIKeyedMutex> {
        texture
            .texture
            .cast()
            .map_err(|e| CaptureError::Graphics(format!("texture is not shared: {}", e)))
    }

    fn compile_shaders(&self) -> Result<BlitShaders> {
        let (vs_bytes, ps_bytes) = match &self.bytecode {
            Some(bytecode) => (bytecode.vertex.clone(), bytecode.pixel.clone()),
            None => (
                compile(s!("vs_main"), s!("vs_4_0_level_9_1"))?,
                compile(s!("ps_main"), s!("ps_4_0_level_9_1"))?,
            ),
        };

        let mut vertex_shader = None;
        let mut pixel_shader = None;
        let mut input_layout = None;
        let mut sampler = None;

        let layout = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 12,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            MipLODBias: 0.0,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };

        unsafe {
            self.device
                .CreateVertexShader(&vs_bytes, None, Some(&mut vertex_shader))
                .map_err(graphics("CreateVertexShader"))?;
            self.device
                .CreatePixelShader(&ps_bytes, None, Some(&mut pixel_shader))
                .map_err(graphics("CreatePixelShader"))?;
            self.device
                .CreateInputLayout(&layout, &vs_bytes, Some(&mut input_layout))
                .map_err(graphics("CreateInputLayout"))?;
            self.device
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))
                .map_err(graphics("CreateSamplerState"))?;
        }

        debug!("Blit shaders created");
        Ok(BlitShaders {
            vertex_shader: vertex_shader.ok_or_else(|| missing("vertex shader"))?,
            pixel_shader: pixel_shader.ok_or_else(|| missing("pixel shader"))?,
            input_layout: input_layout.ok_or_else(|| missing("input layout"))?,
            sampler: sampler.ok_or_else(|| missing("sampler"))?,
        })
    }

    fn upload_vertices(&self, context: &ID3D11DeviceContext, pipeline: &mut D3D11Pipeline, vertices: &[Vertex]) -> Result<()> {
        if pipeline.vertex_buffer.is_none() || vertices.len() > pipeline.vertex_capacity {
            let desc = D3D11_BUFFER_DESC {
                ByteWidth: std::mem::size_of_val(vertices) as u32,
                Usage: D3D11_USAGE_DYNAMIC,
                BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
                CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
                MiscFlags: 0,
                StructureByteStride: 0,
            };
            let mut buffer = None;
            unsafe { self.device.CreateBuffer(&desc, None, Some(&mut buffer)) }.map_err(graphics("CreateBuffer"))?;
            pipeline.vertex_buffer = Some(buffer.ok_or_else(|| missing("vertex buffer"))?);
            pipeline.vertex_capacity = vertices.len();
            debug!("Vertex buffer grown to {} vertices", vertices.len());
        }

        let buffer = pipeline.vertex_buffer.as_ref().ok_or_else(|| missing("vertex buffer"))?;
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            context
                .Map(buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
                .map_err(graphics("Map vertex buffer"))?;
            std::ptr::copy_nonoverlapping(vertices.as_ptr(), mapped.pData.cast::<Vertex>(), vertices.len());
            context.Unmap(buffer, 0);
        }
        Ok(())
    }
}

impl GpuDevice for D3D11Device {
    type Texture = D3D11Texture;
    type Sample = D3D11Sample;
    type SharedHandle = SharedHandle;
    type Pipeline = D3D11Pipeline;
    type Duplication = DxgiDuplication;

    fn driver_type(&self) -> DriverType {
        self.driver
    }

    fn output_count(&self) -> Result<u32> {
        monitor::count(&self.adapter)
    }

    fn output_description(&self, output: u32) -> Result<OutputDescription> {
        monitor::describe(&monitor::output(&self.adapter, output)?)
    }

    fn duplicate_output(&self, output: u32) -> Result<DxgiDuplication> {
        let dxgi_output = monitor::output(&self.adapter, output)?;
        let description = monitor::describe(&dxgi_output)?;
        let output1: IDXGIOutput1 = dxgi_output.cast().map_err(graphics("IDXGIOutput1"))?;
        let duplication = unsafe { output1.DuplicateOutput(&self.device) }.map_err(super::dd::duplication_error)?;

        info!("Duplicating output {} ({})", output, description.name);
        Ok(DxgiDuplication::new(description, duplication))
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<D3D11Texture> {
        let (usage, bind, cpu) = match desc.usage {
            TextureUsage::Staging => (D3D11_USAGE_STAGING, 0, D3D11_CPU_ACCESS_READ.0 as u32),
            TextureUsage::Default => (
                D3D11_USAGE_DEFAULT,
                (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
                0,
            ),
        };

        self.create_texture2d(&D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: usage,
            BindFlags: bind,
            CPUAccessFlags: cpu,
            MiscFlags: 0,
        })
    }

    fn create_shared_texture(&self, width: u32, height: u32) -> Result<(D3D11Texture, SharedHandle)> {
        let texture = self.create_texture2d(&D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0 as u32,
        })?;

        let resource: IDXGIResource = texture.texture.cast().map_err(graphics("IDXGIResource"))?;
        let handle = unsafe { resource.GetSharedHandle() }.map_err(graphics("GetSharedHandle"))?;
        Ok((texture, SharedHandle(handle)))
    }

    fn open_shared_texture(&self, handle: &SharedHandle) -> Result<D3D11Texture> {
        let texture: ID3D11Texture2D =
            unsafe { self.device.OpenSharedResource(handle.0) }.map_err(graphics("OpenSharedResource"))?;
        Ok(D3D11Texture::wrap(texture))
    }

    fn texture_size(&self, texture: &D3D11Texture) -> (u32, u32) {
        (texture.width, texture.height)
    }

    fn copy_region(&self, src: &D3D11Texture, region: &Rect, dst: &D3D11Texture, dst_x: u32, dst_y: u32) {
        // Out-of-bounds boxes make the copy silently do nothing, so clip first.
        let left = region.left.max(0);
        let top = region.top.max(0);
        let right = region.right.min(src.width as i32).min(left + dst.width as i32 - dst_x as i32);
        let bottom = region.bottom.min(src.height as i32).min(top + dst.height as i32 - dst_y as i32);
        if right <= left || bottom <= top {
            return;
        }

        let source_box = D3D11_BOX {
            left: left as u32,
            top: top as u32,
            front: 0,
            right: right as u32,
            bottom: bottom as u32,
            back: 1,
        };
        let immediate = self.immediate.lock();
        unsafe {
            immediate
                .context
                .CopySubresourceRegion(&dst.texture, 0, dst_x, dst_y, 0, &src.texture, 0, Some(&source_box));
        }
    }

    fn read_pixels(&self, texture: &D3D11Texture, out: &mut [u8]) -> Result<()> {
        let row_len = (texture.width * BYTES_PER_PIXEL) as usize;
        let len = row_len * texture.height as usize;
        if out.len() < len {
            return Err(CaptureError::InvalidLength { requested: len, available: out.len() });
        }

        let mut immediate = self.immediate.lock();
        let staging = match texture.usage {
            TextureUsage::Staging => texture.clone(),
            TextureUsage::Default => {
                let reusable = immediate
                    .readback
                    .as_ref()
                    .is_some_and(|r| r.width == texture.width && r.height == texture.height);
                if !reusable {
                    immediate.readback = Some(self.create_texture(&TextureDesc::staging(texture.width, texture.height))?);
                }
                let staging = immediate.readback.clone().ok_or_else(|| missing("readback texture"))?;
                unsafe { immediate.context.CopyResource(&staging.texture, &texture.texture) };
                staging
            }
        };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            immediate
                .context
                .Map(&staging.texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(graphics("Map staging texture"))?;

            let pitch = mapped.RowPitch as usize;
            let src = std::slice::from_raw_parts(mapped.pData.cast::<u8>(), pitch * texture.height as usize);
            for (y, row) in out[..len].chunks_exact_mut(row_len).enumerate() {
                row.copy_from_slice(&src[y * pitch..y * pitch + row_len]);
            }

            immediate.context.Unmap(&staging.texture, 0);
        }
        Ok(())
    }

    fn create_sample(&self, texture: &D3D11Texture) -> Result<D3D11Sample> {
        D3D11Sample::new(texture)
    }

    fn create_blit_pipeline(&self, target: &D3D11Texture) -> Result<D3D11Pipeline> {
        let mut render_target = None;
        unsafe {
            self.device
                .CreateRenderTargetView(&target.texture, None, Some(&mut render_target))
                .map_err(graphics("CreateRenderTargetView"))?;
        }

        let mut immediate = self.immediate.lock();
        if immediate.shaders.is_none() {
            immediate.shaders = Some(self.compile_shaders()?);
        }

        Ok(D3D11Pipeline {
            target: target.clone(),
            render_target: render_target.ok_or_else(|| missing("render target view"))?,
            vertex_buffer: None,
            vertex_capacity: 0,
        })
    }

    fn draw_quads(&self, pipeline: &mut D3D11Pipeline, source: &D3D11Texture, vertices: &[Vertex]) -> Result<()> {
        if vertices.is_empty() {
            return Ok(());
        }

        let mut source_view = None;
        unsafe {
            self.device
                .CreateShaderResourceView(&source.texture, None, Some(&mut source_view))
                .map_err(graphics("CreateShaderResourceView"))?;
        }
        let source_view: ID3D11ShaderResourceView = source_view.ok_or_else(|| missing("shader resource view"))?;

        let immediate = self.immediate.lock();
        let context = &immediate.context;
        let shaders = immediate.shaders.as_ref().ok_or_else(|| missing("blit shaders"))?;
        self.upload_vertices(context, pipeline, vertices)?;

        let stride = std::mem::size_of::<Vertex>() as u32;
        let offset = 0u32;
        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: pipeline.target.width as f32,
            Height: pipeline.target.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };

        unsafe {
            context.OMSetBlendState(None::<&ID3D11BlendState>, Some(&[0.0; 4]), u32::MAX);
            context.OMSetRenderTargets(Some(&[Some(pipeline.render_target.clone())]), None::<&ID3D11DepthStencilView>);
            context.VSSetShader(&shaders.vertex_shader, None);
            context.PSSetShader(&shaders.pixel_shader, None);
            context.PSSetShaderResources(0, Some(&[Some(source_view)]));
            context.PSSetSamplers(0, Some(&[Some(shaders.sampler.clone())]));
            context.IASetInputLayout(&shaders.input_layout);
            context.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.IASetVertexBuffers(0, 1, Some(&pipeline.vertex_buffer), Some(&stride), Some(&offset));
            context.RSSetViewports(Some(&[viewport]));

            context.Draw(vertices.len() as u32, 0);

            // Unbind so the source can be released by the duplication.
            context.PSSetShaderResources(0, Some(&[None]));
        }
        Ok(())
    }

    fn lock_shared(&self, texture: &D3D11Texture) -> Result<()> {
        let mutex = Self::keyed_mutex(texture)?;
        unsafe { mutex.AcquireSync(SHARED_KEY, u32::MAX) }.map_err(graphics("IDXGIKeyedMutex::AcquireSync"))
    }

    fn unlock_shared(&self, texture: &D3D11Texture) {
        if let Ok(mutex) = Self::keyed_mutex(texture) {
            if let Err(e) = unsafe { mutex.ReleaseSync(SHARED_KEY) } {
                debug!("IDXGIKeyedMutex::ReleaseSync failed: {}", e);
            }
        }
    }

    fn flush(&self) {
        unsafe { self.immediate.lock().context.Flush() };
    }
}

fn compile(entry: PCSTR, target: PCSTR) -> Result<Vec<u8>> {
    let mut blob = None;
    let mut errors = None;
    let result = unsafe {
        D3DCompile(
            SHADERS.as_ptr().cast(),
            SHADERS.len(),
            None,
            None,
            None,
            entry,
            target,
            D3DCOMPILE_ENABLE_STRICTNESS,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(e) = result {
        let message = errors
            .map(|errors| String::from_utf8_lossy(unsafe { blob_bytes(&errors) }).into_owned())
            .unwrap_or_else(|| e.to_string());
        return Err(CaptureError::Graphics(format!("shader compilation failed: {}", message)));
    }

    let blob = blob.ok_or_else(|| missing("shader bytecode"))?;
    Ok(unsafe { blob_bytes(&blob) }.to_vec())
}

/// # Safety
/// The returned slice borrows the blob's buffer and must not outlive it.
unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer().cast::<u8>(), blob.GetBufferSize()) }
}

fn missing(what: &str) -> CaptureError {
    CaptureError::Graphics(format!("{} was not returned", what))
}
