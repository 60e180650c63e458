use std::{ffi::c_void, mem::ManuallyDrop, ptr};

use once_cell::unsync::OnceCell;
use windows::{
    core::*, Win32::Foundation::*, Win32::Graphics::Direct3D::*,
    Win32::Graphics::Direct3D12::*, Win32::Graphics::Dxgi::Common::*, Win32::System::Threading::*,
};

use super::{
    command::CommandList, conv, shader_compilation::DxcContainer, Api, Buffer, DescriptorHeap,
    Fence, HResult as _, Pipeline, RootSignature, ShaderLibrary, Texture,
};
use crate::{
    error::{Error, Result},
    hal::{self, Subobject},
};

pub struct Device {
    raw: ID3D12Device5,
    /// Created on the first shader compilation.
    dxc: OnceCell<DxcContainer>,
}

impl Device {
    pub(super) fn new(raw: ID3D12Device5) -> Self {
        Self {
            raw,
            dxc: OnceCell::new(),
        }
    }

    fn create_committed_resource(
        &self,
        heap_type: D3D12_HEAP_TYPE,
        desc: &D3D12_RESOURCE_DESC,
        initial_state: D3D12_RESOURCE_STATES,
    ) -> Result<ID3D12Resource> {
        let heap = D3D12_HEAP_PROPERTIES {
            Type: heap_type,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.raw.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                desc,
                initial_state,
                None,
                &mut resource,
            )
        }
        .into_device_result("CreateCommittedResource")?;
        resource.ok_or_else(|| Error::device("CreateCommittedResource", "no resource returned"))
    }
}

fn set_name(object: &ID3D12Object, label: &str) {
    let _ = unsafe { object.SetName(&HSTRING::from(label)) };
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) }
}

/// Null-terminated UTF-16 copy of `s`.
fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(Some(0)).collect()
}

impl hal::Device<Api> for Device {
    fn create_buffer(&self, desc: &hal::BufferDescriptor) -> Result<Buffer> {
        // Upload heaps only accept GENERIC_READ.
        let initial_state = match desc.location {
            hal::MemoryLocation::CpuToGpu => D3D12_RESOURCE_STATE_GENERIC_READ,
            hal::MemoryLocation::GpuOnly => conv::map_resource_state(desc.initial_state),
        };
        let resource = self.create_committed_resource(
            conv::map_heap_type(desc.location),
            &conv::buffer_resource_desc(desc.size, conv::map_buffer_usage_to_resource_flags(desc.usage)),
            initial_state,
        )?;
        if let Ok(object) = resource.cast::<ID3D12Object>() {
            set_name(&object, desc.label);
        }
        Ok(Buffer {
            resource,
            size: desc.size,
        })
    }

    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > buffer.size {
            return Err(Error::Map(format!(
                "{} bytes at offset {} overrun {} bytes",
                data.len(),
                offset,
                buffer.size
            )));
        }
        let mut mapped: *mut c_void = ptr::null_mut();
        unsafe { buffer.resource.Map(0, None, Some(&mut mapped)) }
            .map_err(|err| Error::Map(err.to_string()))?;
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                (mapped as *mut u8).add(offset as usize),
                data.len(),
            );
            buffer.resource.Unmap(0, None);
        }
        Ok(())
    }

    fn create_texture(&self, desc: &hal::TextureDescriptor) -> Result<Texture> {
        let resource = self.create_committed_resource(
            D3D12_HEAP_TYPE_DEFAULT,
            &conv::texture_resource_desc(
                desc.width,
                desc.height,
                conv::map_texture_format(desc.format),
            ),
            conv::map_resource_state(desc.initial_state),
        )?;
        if let Ok(object) = resource.cast::<ID3D12Object>() {
            set_name(&object, desc.label);
        }
        Ok(Texture {
            resource,
            format: desc.format,
        })
    }

    fn create_descriptor_heap(
        &self,
        desc: &hal::DescriptorHeapDescriptor,
    ) -> Result<DescriptorHeap> {
        let raw: ID3D12DescriptorHeap = unsafe {
            self.raw.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: conv::map_descriptor_heap_kind(desc.kind),
                NumDescriptors: desc.capacity,
                Flags: if desc.shader_visible {
                    D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                } else {
                    D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                },
                NodeMask: 0,
            })
        }
        .into_device_result("CreateDescriptorHeap")?;
        if let Ok(object) = raw.cast::<ID3D12Object>() {
            set_name(&object, desc.label);
        }
        Ok(DescriptorHeap {
            raw,
            shader_visible: desc.shader_visible,
        })
    }

    fn descriptor_increment(&self, kind: hal::DescriptorHeapKind) -> u32 {
        unsafe {
            self.raw
                .GetDescriptorHandleIncrementSize(conv::map_descriptor_heap_kind(kind))
        }
    }

    fn create_texture_uav(&self, texture: &Texture, dest: hal::CpuDescriptorHandle) {
        let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
            Format: conv::map_texture_format(texture.format),
            ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
            Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_UAV {
                    MipSlice: 0,
                    PlaneSlice: 0,
                },
            },
        };
        unsafe {
            self.raw.CreateUnorderedAccessView(
                &texture.resource,
                None::<&ID3D12Resource>,
                Some(&desc),
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dest.0 },
            )
        };
    }

    fn create_acceleration_structure_srv(
        &self,
        location: hal::GpuAddress,
        dest: hal::CpuDescriptorHandle,
    ) {
        let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT_UNKNOWN,
            ViewDimension: D3D12_SRV_DIMENSION_RAYTRACING_ACCELERATION_STRUCTURE,
            Shader4ComponentMapping: conv::DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                RaytracingAccelerationStructure: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_SRV {
                    Location: location,
                },
            },
        };
        // The resource is null for acceleration structures, the location is in the view.
        unsafe {
            self.raw.CreateShaderResourceView(
                None::<&ID3D12Resource>,
                Some(&desc),
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dest.0 },
            )
        };
    }

    fn create_constant_buffer_view(
        &self,
        buffer: &Buffer,
        size: u64,
        dest: hal::CpuDescriptorHandle,
    ) {
        let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
            BufferLocation: unsafe { buffer.resource.GetGPUVirtualAddress() },
            SizeInBytes: size as u32,
        };
        unsafe {
            self.raw
                .CreateConstantBufferView(Some(&desc), D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dest.0 })
        };
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &hal::AccelerationStructureInputs,
    ) -> hal::PrebuildInfo {
        let mut geometries = Vec::new();
        let inputs = conv::map_acceleration_structure_inputs(inputs, &mut geometries);
        let mut info = D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO::default();
        unsafe {
            self.raw
                .GetRaytracingAccelerationStructurePrebuildInfo(&inputs, &mut info)
        };
        hal::PrebuildInfo {
            result_data_max_size: info.ResultDataMaxSizeInBytes,
            scratch_data_size: info.ScratchDataSizeInBytes,
            update_scratch_data_size: info.UpdateScratchDataSizeInBytes,
        }
    }

    fn compile_shader_library(&self, desc: &hal::ShaderLibraryDescriptor) -> Result<ShaderLibrary> {
        let dxc = self.dxc.get_or_try_init(DxcContainer::new)?;
        let blob = dxc.compile(desc)?;
        Ok(ShaderLibrary {
            blob,
            export: desc.export.to_string(),
        })
    }

    fn create_root_signature(&self, desc: &hal::RootSignatureDescriptor) -> Result<RootSignature> {
        let ranges: Vec<Vec<D3D12_DESCRIPTOR_RANGE>> = desc
            .parameters
            .iter()
            .map(|parameter| match *parameter {
                hal::RootParameter::DescriptorTable(ref ranges) => {
                    ranges.iter().map(conv::map_descriptor_range).collect()
                }
                _ => Vec::new(),
            })
            .collect();

        let parameters: Vec<D3D12_ROOT_PARAMETER> = desc
            .parameters
            .iter()
            .zip(&ranges)
            .map(|(parameter, ranges)| {
                let descriptor = |register: u32, space: u32| D3D12_ROOT_PARAMETER_0 {
                    Descriptor: D3D12_ROOT_DESCRIPTOR {
                        ShaderRegister: register,
                        RegisterSpace: space,
                    },
                };
                let (kind, anonymous) = match *parameter {
                    hal::RootParameter::DescriptorTable(_) => (
                        D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                        D3D12_ROOT_PARAMETER_0 {
                            DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                                NumDescriptorRanges: ranges.len() as u32,
                                pDescriptorRanges: ranges.as_ptr() as _,
                            },
                        },
                    ),
                    hal::RootParameter::ShaderResourceView { register, space } => {
                        (D3D12_ROOT_PARAMETER_TYPE_SRV, descriptor(register, space))
                    }
                    hal::RootParameter::UnorderedAccessView { register, space } => {
                        (D3D12_ROOT_PARAMETER_TYPE_UAV, descriptor(register, space))
                    }
                    hal::RootParameter::ConstantBufferView { register, space } => {
                        (D3D12_ROOT_PARAMETER_TYPE_CBV, descriptor(register, space))
                    }
                    hal::RootParameter::Constants {
                        register,
                        space,
                        count,
                    } => (
                        D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
                        D3D12_ROOT_PARAMETER_0 {
                            Constants: D3D12_ROOT_CONSTANTS {
                                ShaderRegister: register,
                                RegisterSpace: space,
                                Num32BitValues: count,
                            },
                        },
                    ),
                };
                D3D12_ROOT_PARAMETER {
                    ParameterType: kind,
                    Anonymous: anonymous,
                    ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
                }
            })
            .collect();

        let root_desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr() as _,
            NumStaticSamplers: 0,
            pStaticSamplers: ptr::null_mut(),
            Flags: match desc.kind {
                hal::RootSignatureKind::Local => D3D12_ROOT_SIGNATURE_FLAG_LOCAL_ROOT_SIGNATURE,
                hal::RootSignatureKind::Global => D3D12_ROOT_SIGNATURE_FLAG_NONE,
            },
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        let serialized = unsafe {
            D3D12SerializeRootSignature(
                &root_desc,
                D3D_ROOT_SIGNATURE_VERSION_1,
                &mut blob,
                Some(&mut error),
            )
        };
        let blob = match (serialized, blob) {
            (Ok(()), Some(blob)) => blob,
            (result, _) => {
                let log = match error {
                    Some(ref error) => String::from_utf8_lossy(blob_bytes(error))
                        .trim_end_matches('\0')
                        .to_string(),
                    None => result.err().map(|e| e.to_string()).unwrap_or_default(),
                };
                return Err(Error::RootSignature(format!("`{}`: {}", desc.label, log)));
            }
        };

        let raw: ID3D12RootSignature = unsafe { self.raw.CreateRootSignature(0, blob_bytes(&blob)) }
            .into_device_result("CreateRootSignature")?;
        if let Ok(object) = raw.cast::<ID3D12Object>() {
            set_name(&object, desc.label);
        }
        Ok(RootSignature { raw })
    }

    fn create_pipeline(&self, desc: &hal::StateObjectDescriptor<Api>) -> Result<Pipeline> {
        let count = desc.subobjects.len();

        // Every string and descriptor lives in storage that is reserved up
        // front and never reallocated while pointers into it are taken.
        let mut names: Vec<Vec<u16>> = Vec::new();
        let mut name_ptr = |s: &str| {
            names.push(wide(s));
            names.last().map_or(PCWSTR::null(), |name| PCWSTR(name.as_ptr()))
        };

        let mut export_lists: Vec<Vec<D3D12_EXPORT_DESC>> = Vec::with_capacity(count);
        let mut association_lists: Vec<Vec<PCWSTR>> = Vec::with_capacity(count);
        let mut libraries = Vec::with_capacity(count);
        let mut hit_groups = Vec::with_capacity(count);
        let mut shader_configs = Vec::with_capacity(count);
        let mut local_root_signatures = Vec::with_capacity(count);
        let mut global_root_signatures = Vec::with_capacity(count);
        let mut associations = Vec::with_capacity(count);
        let mut pipeline_configs = Vec::with_capacity(count);

        let mut subobjects: Vec<D3D12_STATE_SUBOBJECT> = Vec::with_capacity(count);
        let subobjects_base = subobjects.as_ptr();

        for (index, subobject) in desc.subobjects.iter().enumerate() {
            let (kind, pdesc): (D3D12_STATE_SUBOBJECT_TYPE, *const c_void) = match *subobject {
                Subobject::DxilLibrary {
                    library,
                    ref exports,
                } => {
                    export_lists.push(
                        exports
                            .iter()
                            .map(|export| D3D12_EXPORT_DESC {
                                Name: name_ptr(export),
                                ExportToRename: PCWSTR::null(),
                                Flags: D3D12_EXPORT_FLAG_NONE,
                            })
                            .collect(),
                    );
                    let exports = export_lists.last().map_or(&[][..], Vec::as_slice);
                    libraries.push(D3D12_DXIL_LIBRARY_DESC {
                        DXILLibrary: D3D12_SHADER_BYTECODE {
                            pShaderBytecode: unsafe { library.blob.GetBufferPointer() },
                            BytecodeLength: unsafe { library.blob.GetBufferSize() },
                        },
                        NumExports: exports.len() as u32,
                        pExports: exports.as_ptr() as _,
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_DXIL_LIBRARY,
                        libraries.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
                Subobject::HitGroup {
                    ref export,
                    kind,
                    ref closest_hit,
                    ref any_hit,
                    ref intersection,
                } => {
                    let group_export = name_ptr(export);
                    let mut import = |name: &Option<String>| {
                        name.as_deref().map_or(PCWSTR::null(), &mut name_ptr)
                    };
                    hit_groups.push(D3D12_HIT_GROUP_DESC {
                        HitGroupExport: group_export,
                        Type: conv::map_hit_group_kind(kind),
                        AnyHitShaderImport: import(any_hit),
                        ClosestHitShaderImport: import(closest_hit),
                        IntersectionShaderImport: import(intersection),
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_HIT_GROUP,
                        hit_groups.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
                Subobject::ShaderConfig {
                    max_payload_size,
                    max_attribute_size,
                } => {
                    shader_configs.push(D3D12_RAYTRACING_SHADER_CONFIG {
                        MaxPayloadSizeInBytes: max_payload_size,
                        MaxAttributeSizeInBytes: max_attribute_size,
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_SHADER_CONFIG,
                        shader_configs.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
                Subobject::LocalRootSignature(root_signature) => {
                    local_root_signatures.push(D3D12_LOCAL_ROOT_SIGNATURE {
                        pLocalRootSignature: ManuallyDrop::new(Some(root_signature.raw.clone())),
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_LOCAL_ROOT_SIGNATURE,
                        local_root_signatures.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
                Subobject::GlobalRootSignature(root_signature) => {
                    global_root_signatures.push(D3D12_GLOBAL_ROOT_SIGNATURE {
                        pGlobalRootSignature: ManuallyDrop::new(Some(root_signature.raw.clone())),
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_GLOBAL_ROOT_SIGNATURE,
                        global_root_signatures.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
                Subobject::ExportsAssociation {
                    subobject: target,
                    ref exports,
                } => {
                    if target.0 >= index {
                        return Err(Error::InvalidAssociation {
                            handle: target.0,
                            reason: "association must follow the subobject it references",
                        });
                    }
                    association_lists.push(exports.iter().map(|e| name_ptr(e)).collect());
                    let exports = association_lists.last().map_or(&[][..], Vec::as_slice);
                    associations.push(D3D12_SUBOBJECT_TO_EXPORTS_ASSOCIATION {
                        pSubobjectToAssociate: unsafe { subobjects_base.add(target.0) },
                        NumExports: exports.len() as u32,
                        pExports: exports.as_ptr() as _,
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_SUBOBJECT_TO_EXPORTS_ASSOCIATION,
                        associations.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
                Subobject::PipelineConfig {
                    max_trace_recursion_depth,
                } => {
                    pipeline_configs.push(D3D12_RAYTRACING_PIPELINE_CONFIG {
                        MaxTraceRecursionDepth: max_trace_recursion_depth,
                    });
                    (
                        D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_PIPELINE_CONFIG,
                        pipeline_configs.last().map_or(ptr::null(), |d| d as *const _ as _),
                    )
                }
            };
            subobjects.push(D3D12_STATE_SUBOBJECT {
                Type: kind,
                pDesc: pdesc,
            });
        }
        debug_assert_eq!(subobjects.as_ptr(), subobjects_base);

        let state_desc = D3D12_STATE_OBJECT_DESC {
            Type: D3D12_STATE_OBJECT_TYPE_RAYTRACING_PIPELINE,
            NumSubobjects: subobjects.len() as u32,
            pSubobjects: subobjects.as_ptr(),
        };
        let created: windows::core::Result<ID3D12StateObject> =
            unsafe { self.raw.CreateStateObject(&state_desc) };

        for mut local in local_root_signatures {
            unsafe { ManuallyDrop::drop(&mut local.pLocalRootSignature) };
        }
        for mut global in global_root_signatures {
            unsafe { ManuallyDrop::drop(&mut global.pGlobalRootSignature) };
        }

        let raw = created.map_err(|err| {
            Error::PipelineCreation(format!("{}: {}", desc.label, err))
        })?;
        let properties: ID3D12StateObjectProperties = raw
            .cast()
            .into_device_result("ID3D12StateObjectProperties")?;
        log::debug!("Created state object `{}` with {} subobjects", desc.label, count);
        Ok(Pipeline { raw, properties })
    }

    fn create_command_list(&self) -> Result<CommandList> {
        CommandList::new(&self.raw)
    }

    fn create_fence(&self) -> Result<Fence> {
        let raw: ID3D12Fence = unsafe { self.raw.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .into_device_result("CreateFence")?;
        let event = unsafe { CreateEventA(None, false, false, None) }
            .into_device_result("CreateEventA")?;
        Ok(Fence { raw, event })
    }
}
