/*! Direct3D 12 backend.
 *
 *  Thin wrappers around the `windows` crate's COM interfaces. Every object is
 *  created through `ID3D12Device5` and recorded through
 *  `ID3D12GraphicsCommandList4`, the first versions exposing DXR.
 *  Shader libraries are compiled at runtime with DXC.
 */

mod command;
mod conv;
mod device;
mod shader_compilation;

use std::time::Duration;

use windows::{
    core::*, Win32::Foundation::*, Win32::Graphics::Direct3D::*,
    Win32::Graphics::Direct3D12::*, Win32::Graphics::Dxgi::Common::*, Win32::Graphics::Dxgi::*,
    Win32::System::Threading::*, Win32::System::WindowsProgramming::*,
};

use super::{GpuAddress, ShaderIdentifier, TextureFormat, BACK_BUFFER_COUNT};
use crate::{
    config::RendererConfig,
    context::RenderContext,
    error::{Error, Result},
};

pub use command::CommandList;
pub use device::Device;

#[derive(Debug)]
pub struct Api;

impl super::Api for Api {
    type Device = Device;
    type Queue = Queue;
    type CommandList = CommandList;
    type Fence = Fence;

    type Buffer = Buffer;
    type Texture = Texture;
    type DescriptorHeap = DescriptorHeap;

    type RootSignature = RootSignature;
    type ShaderLibrary = ShaderLibrary;
    type Pipeline = Pipeline;

    type Surface = Surface;
}

trait HResult<T> {
    fn into_device_result(self, operation: &'static str) -> Result<T>;
}

impl<T> HResult<T> for windows::core::Result<T> {
    fn into_device_result(self, operation: &'static str) -> Result<T> {
        self.map_err(|err| Error::device(operation, err.to_string()))
    }
}

/// Pick the first hardware adapter with DXR support and open a device, a
/// direct queue and a flip-model swap chain on `hwnd`.
pub fn open(hwnd: HWND, config: &RendererConfig) -> Result<RenderContext<Api>> {
    let mut factory_flags = 0;
    if cfg!(debug_assertions) {
        let mut debug: Option<ID3D12Debug> = None;
        if let Some(debug) = unsafe { D3D12GetDebugInterface(&mut debug) }.ok().and(debug) {
            unsafe { debug.EnableDebugLayer() };
            factory_flags = DXGI_CREATE_FACTORY_DEBUG;
            log::info!("D3D12 debug layer enabled");
        }
    }

    let factory: IDXGIFactory4 =
        unsafe { CreateDXGIFactory2(factory_flags) }.into_device_result("CreateDXGIFactory2")?;
    let raw = pick_device(&factory)?;

    let queue: ID3D12CommandQueue = unsafe {
        raw.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            ..Default::default()
        })
    }
    .into_device_result("CreateCommandQueue")?;

    let surface = Surface::new(
        &factory,
        &queue,
        hwnd,
        config.window_width,
        config.window_height,
    )?;
    let device = Device::new(raw);
    RenderContext::new(device, Queue { raw: queue }, surface, config)
}

fn pick_device(factory: &IDXGIFactory4) -> Result<ID3D12Device5> {
    for index in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(index) } {
            Ok(adapter) => adapter,
            Err(_) => break,
        };
        let desc = unsafe { adapter.GetDesc1() }.into_device_result("GetDesc1")?;
        let name = String::from_utf16_lossy(&desc.Description)
            .trim_end_matches('\0')
            .to_string();
        if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            log::debug!("Skipping software adapter {}", name);
            continue;
        }

        let mut device: Option<ID3D12Device5> = None;
        if unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device) }.is_err() {
            continue;
        }
        let device = match device {
            Some(device) => device,
            None => continue,
        };

        let mut options = D3D12_FEATURE_DATA_D3D12_OPTIONS5::default();
        let supported = unsafe {
            device.CheckFeatureSupport(
                D3D12_FEATURE_D3D12_OPTIONS5,
                &mut options as *mut _ as *mut _,
                std::mem::size_of::<D3D12_FEATURE_DATA_D3D12_OPTIONS5>() as u32,
            )
        }
        .is_ok()
            && options.RaytracingTier != D3D12_RAYTRACING_TIER_NOT_SUPPORTED;
        if !supported {
            log::info!("Adapter {} does not support DXR", name);
            continue;
        }

        log::info!("Using adapter {}", name);
        return Ok(device);
    }
    Err(Error::device(
        "D3D12CreateDevice",
        "no adapter with ray-tracing support",
    ))
}

#[derive(Debug)]
pub struct Buffer {
    resource: ID3D12Resource,
    size: u64,
}

impl super::Buffer for Buffer {
    fn gpu_address(&self) -> GpuAddress {
        unsafe { self.resource.GetGPUVirtualAddress() }
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
pub struct Texture {
    resource: ID3D12Resource,
    format: TextureFormat,
}

#[derive(Debug)]
pub struct DescriptorHeap {
    raw: ID3D12DescriptorHeap,
    shader_visible: bool,
}

impl super::DescriptorHeap for DescriptorHeap {
    fn cpu_start(&self) -> super::CpuDescriptorHandle {
        super::CpuDescriptorHandle(unsafe { self.raw.GetCPUDescriptorHandleForHeapStart() }.ptr)
    }

    fn gpu_start(&self) -> super::GpuDescriptorHandle {
        if !self.shader_visible {
            return super::GpuDescriptorHandle(0);
        }
        super::GpuDescriptorHandle(unsafe { self.raw.GetGPUDescriptorHandleForHeapStart() }.ptr)
    }
}

#[derive(Debug)]
pub struct RootSignature {
    raw: ID3D12RootSignature,
}

#[derive(Debug)]
pub struct ShaderLibrary {
    blob: IDxcBlob,
    export: String,
}

#[derive(Debug)]
pub struct Pipeline {
    raw: ID3D12StateObject,
    properties: ID3D12StateObjectProperties,
}

impl super::Pipeline for Pipeline {
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier> {
        let name = HSTRING::from(export);
        let ptr = unsafe { self.properties.GetShaderIdentifier(&name) } as *const u8;
        if ptr.is_null() {
            return None;
        }
        let mut identifier = ShaderIdentifier([0; super::SHADER_IDENTIFIER_SIZE as usize]);
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr,
                identifier.0.as_mut_ptr(),
                identifier.0.len(),
            )
        };
        Some(identifier)
    }
}

pub struct Fence {
    raw: ID3D12Fence,
    event: HANDLE,
}

impl super::Fence for Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.raw.GetCompletedValue() }
    }

    fn wait(&self, value: u64, timeout: Duration) -> Result<bool> {
        if self.completed_value() >= value {
            return Ok(true);
        }
        unsafe { self.raw.SetEventOnCompletion(value, self.event) }
            .into_device_result("SetEventOnCompletion")?;
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(INFINITE);
        let result = unsafe { WaitForSingleObject(self.event, millis) };
        if result == WAIT_OBJECT_0 {
            Ok(true)
        } else if result == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(Error::device(
                "WaitForSingleObject",
                format!("unexpected wait result {:?}", result),
            ))
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.event) };
    }
}

pub struct Queue {
    raw: ID3D12CommandQueue,
}

impl super::Queue<Api> for Queue {
    fn execute(&self, list: &CommandList) -> Result<()> {
        let raw: ID3D12CommandList = list.raw.cast().into_device_result("ID3D12CommandList")?;
        unsafe { self.raw.ExecuteCommandLists(&[Some(raw)]) };
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        unsafe { self.raw.Signal(&fence.raw, value) }.into_device_result("Signal")
    }
}

pub struct Surface {
    raw: IDXGISwapChain3,
    back_buffers: Vec<Texture>,
    width: u32,
    height: u32,
}

impl Surface {
    fn new(
        factory: &IDXGIFactory4,
        queue: &ID3D12CommandQueue,
        hwnd: HWND,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: BACK_BUFFER_COUNT as u32,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };
        let swap_chain: IDXGISwapChain1 =
            unsafe { factory.CreateSwapChainForHwnd(queue, hwnd, &desc, None, None) }
                .into_device_result("CreateSwapChainForHwnd")?;
        unsafe { factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }
            .into_device_result("MakeWindowAssociation")?;
        let raw: IDXGISwapChain3 = swap_chain.cast().into_device_result("IDXGISwapChain3")?;

        let back_buffers = Self::acquire_back_buffers(&raw)?;
        Ok(Self {
            raw,
            back_buffers,
            width,
            height,
        })
    }

    fn acquire_back_buffers(raw: &IDXGISwapChain3) -> Result<Vec<Texture>> {
        let buffers: [Texture; BACK_BUFFER_COUNT] = array_init::try_array_init(|i| {
            let resource: ID3D12Resource =
                unsafe { raw.GetBuffer(i as u32) }.into_device_result("GetBuffer")?;
            Ok::<_, Error>(Texture {
                resource,
                format: TextureFormat::Rgba8Unorm,
            })
        })?;
        Ok(buffers.into())
    }
}

impl super::Surface<Api> for Surface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn current_back_buffer_index(&self) -> usize {
        unsafe { self.raw.GetCurrentBackBufferIndex() as usize }
    }

    fn back_buffer(&self, index: usize) -> &Texture {
        &self.back_buffers[index]
    }

    fn present(&mut self) -> Result<()> {
        unsafe { self.raw.Present(1, 0) }
            .ok()
            .into_device_result("Present")
    }

    fn resize(&mut self, _device: &Device, width: u32, height: u32) -> Result<()> {
        self.back_buffers.clear();
        unsafe {
            self.raw
                .ResizeBuffers(BACK_BUFFER_COUNT as u32, width, height, DXGI_FORMAT_UNKNOWN, 0)
        }
        .into_device_result("ResizeBuffers")?;
        self.back_buffers = Self::acquire_back_buffers(&self.raw)?;
        self.width = width;
        self.height = height;
        log::info!("Swap chain resized to {}x{}", width, height);
        Ok(())
    }
}
