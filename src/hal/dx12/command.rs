use std::mem::{self, ManuallyDrop};

use windows::Win32::Graphics::Direct3D12::*;

use super::{conv, Api, Buffer, DescriptorHeap, HResult as _, Pipeline, RootSignature, Texture};
use crate::{error::Result, hal};

pub struct CommandList {
    pub(super) raw: ID3D12GraphicsCommandList4,
    allocator: ID3D12CommandAllocator,
}

impl CommandList {
    pub(super) fn new(device: &ID3D12Device5) -> Result<Self> {
        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .into_device_result("CreateCommandAllocator")?;
        let raw: ID3D12GraphicsCommandList4 = unsafe {
            device.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                &allocator,
                None::<&ID3D12PipelineState>,
            )
        }
        .into_device_result("CreateCommandList")?;
        // Lists are created open.
        unsafe { raw.Close() }.into_device_result("Close")?;
        Ok(Self { raw, allocator })
    }

    fn barrier(&mut self, barrier: D3D12_RESOURCE_BARRIER) {
        unsafe { self.raw.ResourceBarrier(&[barrier]) };
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { mem::transmute_copy(resource) },
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn uav_barrier(resource: &ID3D12Resource) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                pResource: unsafe { mem::transmute_copy(resource) },
            }),
        },
    }
}

impl hal::CommandList<Api> for CommandList {
    fn reset(&mut self) -> Result<()> {
        unsafe { self.allocator.Reset() }.into_device_result("ID3D12CommandAllocator::Reset")?;
        unsafe { self.raw.Reset(&self.allocator, None::<&ID3D12PipelineState>) }
            .into_device_result("ID3D12GraphicsCommandList::Reset")
    }

    fn close(&mut self) -> Result<()> {
        unsafe { self.raw.Close() }.into_device_result("Close")
    }

    fn transition_buffer(
        &mut self,
        buffer: &Buffer,
        before: hal::ResourceState,
        after: hal::ResourceState,
    ) {
        let (before, after) = (conv::map_resource_state(before), conv::map_resource_state(after));
        if before != after {
            self.barrier(transition_barrier(&buffer.resource, before, after));
        }
    }

    fn transition_texture(
        &mut self,
        texture: &Texture,
        before: hal::ResourceState,
        after: hal::ResourceState,
    ) {
        let (before, after) = (conv::map_resource_state(before), conv::map_resource_state(after));
        if before != after {
            self.barrier(transition_barrier(&texture.resource, before, after));
        }
    }

    fn uav_barrier(&mut self, buffer: &Buffer) {
        self.barrier(uav_barrier(&buffer.resource));
    }

    fn copy_buffer(&mut self, dst: &Buffer, src: &Buffer, size: u64) {
        unsafe {
            self.raw
                .CopyBufferRegion(&dst.resource, 0, &src.resource, 0, size)
        };
    }

    fn copy_texture(&mut self, dst: &Texture, src: &Texture) {
        unsafe { self.raw.CopyResource(&dst.resource, &src.resource) };
    }

    fn build_acceleration_structure(&mut self, desc: &hal::BuildAccelerationStructureDesc) {
        let mut geometries = Vec::new();
        let build = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC {
            DestAccelerationStructureData: desc.dest,
            Inputs: conv::map_acceleration_structure_inputs(&desc.inputs, &mut geometries),
            SourceAccelerationStructureData: 0,
            ScratchAccelerationStructureData: desc.scratch,
        };
        unsafe { self.raw.BuildRaytracingAccelerationStructure(&build, None) };
    }

    fn set_descriptor_heap(&mut self, heap: &DescriptorHeap) {
        unsafe { self.raw.SetDescriptorHeaps(&[Some(heap.raw.clone())]) };
    }

    fn set_compute_root_signature(&mut self, root_signature: &RootSignature) {
        unsafe { self.raw.SetComputeRootSignature(&root_signature.raw) };
    }

    fn set_pipeline(&mut self, pipeline: &Pipeline) {
        unsafe { self.raw.SetPipelineState1(&pipeline.raw) };
    }

    fn dispatch_rays(&mut self, desc: &hal::DispatchRaysDesc) {
        unsafe { self.raw.DispatchRays(&conv::map_dispatch_rays(desc)) };
    }
}
