use windows::Win32::Graphics::{Direct3D12::*, Dxgi::Common::*};

use crate::hal;

/// `D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING`, a macro in the C headers.
pub const DEFAULT_SHADER_4_COMPONENT_MAPPING: u32 = 0x1688;

pub fn map_resource_state(state: hal::ResourceState) -> D3D12_RESOURCE_STATES {
    use hal::ResourceState as Rs;
    match state {
        Rs::Common | Rs::Present => D3D12_RESOURCE_STATE_COMMON,
        Rs::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
        Rs::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        Rs::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        Rs::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        Rs::NonPixelShaderResource => D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        Rs::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        Rs::AccelerationStructure => D3D12_RESOURCE_STATE_RAYTRACING_ACCELERATION_STRUCTURE,
    }
}

pub fn map_buffer_usage_to_resource_flags(usage: hal::BufferUses) -> D3D12_RESOURCE_FLAGS {
    if usage.intersects(hal::BufferUses::UNORDERED_ACCESS | hal::BufferUses::ACCELERATION_STRUCTURE)
    {
        D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
    } else {
        D3D12_RESOURCE_FLAG_NONE
    }
}

pub fn map_heap_type(location: hal::MemoryLocation) -> D3D12_HEAP_TYPE {
    match location {
        hal::MemoryLocation::GpuOnly => D3D12_HEAP_TYPE_DEFAULT,
        hal::MemoryLocation::CpuToGpu => D3D12_HEAP_TYPE_UPLOAD,
    }
}

pub fn map_texture_format(format: hal::TextureFormat) -> DXGI_FORMAT {
    match format {
        hal::TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        hal::TextureFormat::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
    }
}

pub fn map_descriptor_heap_kind(kind: hal::DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        hal::DescriptorHeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        hal::DescriptorHeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        hal::DescriptorHeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

pub fn map_descriptor_range_kind(kind: hal::DescriptorRangeKind) -> D3D12_DESCRIPTOR_RANGE_TYPE {
    match kind {
        hal::DescriptorRangeKind::Srv => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
        hal::DescriptorRangeKind::Uav => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
        hal::DescriptorRangeKind::Cbv => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
        hal::DescriptorRangeKind::Sampler => D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
    }
}

pub fn map_descriptor_range(range: &hal::DescriptorRange) -> D3D12_DESCRIPTOR_RANGE {
    D3D12_DESCRIPTOR_RANGE {
        RangeType: map_descriptor_range_kind(range.kind),
        NumDescriptors: range.count,
        BaseShaderRegister: range.base_register,
        RegisterSpace: range.space,
        OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
    }
}

pub fn map_build_flags(
    flags: hal::BuildFlags,
) -> D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAGS {
    D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAGS(flags.bits() as _)
}

pub fn map_geometry_flags(flags: hal::GeometryFlags) -> D3D12_RAYTRACING_GEOMETRY_FLAGS {
    D3D12_RAYTRACING_GEOMETRY_FLAGS(flags.bits() as _)
}

pub fn map_vertex_format(format: hal::VertexFormat) -> DXGI_FORMAT {
    match format {
        hal::VertexFormat::Float32x3 => DXGI_FORMAT_R32G32B32_FLOAT,
    }
}

pub fn map_index_format(format: hal::IndexFormat) -> DXGI_FORMAT {
    match format {
        hal::IndexFormat::Uint32 => DXGI_FORMAT_R32_UINT,
    }
}

pub fn map_triangles(geometry: &hal::TriangleGeometry) -> D3D12_RAYTRACING_GEOMETRY_DESC {
    D3D12_RAYTRACING_GEOMETRY_DESC {
        Type: D3D12_RAYTRACING_GEOMETRY_TYPE_TRIANGLES,
        Flags: map_geometry_flags(geometry.flags),
        Anonymous: D3D12_RAYTRACING_GEOMETRY_DESC_0 {
            Triangles: D3D12_RAYTRACING_GEOMETRY_TRIANGLES_DESC {
                Transform3x4: 0,
                IndexFormat: map_index_format(geometry.index_format),
                VertexFormat: map_vertex_format(geometry.vertex_format),
                IndexCount: geometry.index_count,
                VertexCount: geometry.vertex_count,
                IndexBuffer: geometry.index_buffer,
                VertexBuffer: D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE {
                    StartAddress: geometry.vertex_buffer,
                    StrideInBytes: geometry.vertex_stride,
                },
            },
        },
    }
}

/// Builds the D3D12 inputs for an acceleration structure. For bottom-level
/// inputs the geometry descriptors are written into `storage`, which must
/// outlive every use of the returned value.
pub fn map_acceleration_structure_inputs(
    inputs: &hal::AccelerationStructureInputs,
    storage: &mut Vec<D3D12_RAYTRACING_GEOMETRY_DESC>,
) -> D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
    match *inputs {
        hal::AccelerationStructureInputs::BottomLevel { geometries, flags } => {
            storage.clear();
            storage.extend(geometries.iter().map(map_triangles));
            D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
                Flags: map_build_flags(flags),
                NumDescs: storage.len() as u32,
                DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                    pGeometryDescs: storage.as_ptr() as _,
                },
            }
        }
        hal::AccelerationStructureInputs::TopLevel {
            instance_descs,
            instance_count,
            flags,
        } => D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
            Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
            Flags: map_build_flags(flags),
            NumDescs: instance_count,
            DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
            Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                InstanceDescs: instance_descs,
            },
        },
    }
}

pub fn map_hit_group_kind(kind: hal::HitGroupKind) -> D3D12_HIT_GROUP_TYPE {
    match kind {
        hal::HitGroupKind::Triangles => D3D12_HIT_GROUP_TYPE_TRIANGLES,
        hal::HitGroupKind::ProceduralPrimitive => D3D12_HIT_GROUP_TYPE_PROCEDURAL_PRIMITIVE,
    }
}

pub fn map_dispatch_rays(desc: &hal::DispatchRaysDesc) -> D3D12_DISPATCH_RAYS_DESC {
    let range_and_stride = |range: &hal::GpuAddressRangeAndStride| {
        D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE {
            StartAddress: range.start_address,
            SizeInBytes: range.size,
            StrideInBytes: range.stride,
        }
    };
    D3D12_DISPATCH_RAYS_DESC {
        RayGenerationShaderRecord: D3D12_GPU_VIRTUAL_ADDRESS_RANGE {
            StartAddress: desc.ray_generation.start_address,
            SizeInBytes: desc.ray_generation.size,
        },
        MissShaderTable: range_and_stride(&desc.miss),
        HitGroupTable: range_and_stride(&desc.hit_group),
        CallableShaderTable: range_and_stride(&desc.callable),
        Width: desc.width,
        Height: desc.height,
        Depth: desc.depth,
    }
}

pub fn buffer_resource_desc(size: u64, flags: D3D12_RESOURCE_FLAGS) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
        Alignment: 0,
        Width: size,
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: DXGI_FORMAT_UNKNOWN,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        Flags: flags,
    }
}

pub fn texture_resource_desc(width: u32, height: u32, format: DXGI_FORMAT) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        Alignment: 0,
        Width: u64::from(width),
        Height: height,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: format,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
        Flags: D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS,
    }
}
