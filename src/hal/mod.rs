/*! Backend-neutral layer over the graphics API.
 *
 *  The renderer core only sees the traits in this module. Objects are passed
 *  by reference and returned by value, resource transitions are explicit,
 *  and every type here mirrors a D3D12 structure closely enough that the
 *  `dx12` backend converts them field by field.
 *
 *  Backends:
 *  - `dx12`: Direct3D 12 + DXGI + DXC through the `windows` crate.
 *  - `headless`: deterministic software device, used by tests and on hosts
 *    without Direct3D 12.
 */

#[cfg(windows)]
pub mod dx12;
pub mod headless;

use std::{fmt, time::Duration};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::Result;

/// Virtual address of GPU memory, `0` means "no resource".
pub type GpuAddress = u64;

pub const SHADER_IDENTIFIER_SIZE: u64 = 32;
pub const SHADER_RECORD_ALIGNMENT: u64 = 32;
pub const SHADER_TABLE_ALIGNMENT: u64 = 64;
pub const INSTANCE_DESCS_ALIGNMENT: u64 = 16;
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;
pub const MAX_TRACE_RECURSION_DEPTH: u32 = 31;
pub const MAX_ATTRIBUTE_SIZE: u32 = 32;
pub const BACK_BUFFER_COUNT: usize = 3;

/// Round `value` up to `alignment`, which must be a power of two.
pub fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Opaque handle the pipeline hands out for each exported program.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(pub [u8; SHADER_IDENTIFIER_SIZE as usize]);

impl fmt::Debug for ShaderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaderIdentifier(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Default heap, not CPU visible.
    GpuOnly,
    /// Upload heap, persistently CPU writable.
    CpuToGpu,
}

bitflags! {
    pub struct BufferUses: u32 {
        const UNORDERED_ACCESS = 1 << 0;
        const ACCELERATION_STRUCTURE = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    GenericRead,
    CopyDest,
    CopySource,
    UnorderedAccess,
    NonPixelShaderResource,
    RenderTarget,
    Present,
    AccelerationStructure,
}

#[derive(Clone, Debug)]
pub struct BufferDescriptor<'a> {
    pub label: &'a str,
    pub size: u64,
    pub location: MemoryLocation,
    pub usage: BufferUses,
    pub initial_state: ResourceState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba32Float,
}

/// 2D texture that can be bound as an unordered-access view.
#[derive(Clone, Debug)]
pub struct TextureDescriptor<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub initial_state: ResourceState,
}

bitflags! {
    pub struct GeometryFlags: u32 {
        const OPAQUE = 0x1;
        const NO_DUPLICATE_ANYHIT_INVOCATION = 0x2;
    }
}

bitflags! {
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 0x1;
        const ALLOW_COMPACTION = 0x2;
        const PREFER_FAST_TRACE = 0x4;
        const PREFER_FAST_BUILD = 0x8;
        const MINIMIZE_MEMORY = 0x10;
    }
}

bitflags! {
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 0x1;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NON_OPAQUE = 0x8;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    Uint32,
}

/// Indexed triangle list resident in default-heap buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_buffer: GpuAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: VertexFormat,
    pub index_buffer: GpuAddress,
    pub index_count: u32,
    pub index_format: IndexFormat,
    pub flags: GeometryFlags,
}

impl TriangleGeometry {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Clone, Copy, Debug)]
pub enum AccelerationStructureInputs<'a> {
    BottomLevel {
        geometries: &'a [TriangleGeometry],
        flags: BuildFlags,
    },
    TopLevel {
        /// Address of a tightly packed `InstanceDesc` array, `0` when empty.
        instance_descs: GpuAddress,
        instance_count: u32,
        flags: BuildFlags,
    },
}

impl AccelerationStructureInputs<'_> {
    pub fn level(&self) -> &'static str {
        match *self {
            Self::BottomLevel { .. } => "bottom-level",
            Self::TopLevel { .. } => "top-level",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_data_max_size: u64,
    pub scratch_data_size: u64,
    pub update_scratch_data_size: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct BuildAccelerationStructureDesc<'a> {
    pub inputs: AccelerationStructureInputs<'a>,
    pub scratch: GpuAddress,
    pub dest: GpuAddress,
}

/// Pack a 24-bit value and an 8-bit value the way instance descriptors store them.
pub fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & 0x00ff_ffff) | (u32::from(high_8) << 24)
}

/// Wire layout of one top-level instance, identical to
/// `D3D12_RAYTRACING_INSTANCE_DESC`. The transform is the top three rows of a
/// row-major 3x4 matrix.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [[f32; 4]; 3],
    pub instance_id_and_mask: u32,
    pub hit_group_index_and_flags: u32,
    pub acceleration_structure: GpuAddress,
}

impl InstanceDesc {
    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    /// `InstanceContributionToHitGroupIndex`.
    pub fn hit_group_index(&self) -> u32 {
        self.hit_group_index_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.hit_group_index_and_flags >> 24) as u8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Rtv,
    Dsv,
}

#[derive(Clone, Debug)]
pub struct DescriptorHeapDescriptor<'a> {
    pub label: &'a str,
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorRangeKind {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

/// Ranges of a descriptor table are laid out back to back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub count: u32,
    pub base_register: u32,
    pub space: u32,
}

impl DescriptorRange {
    pub fn new(kind: DescriptorRangeKind, count: u32, base_register: u32) -> Self {
        Self {
            kind,
            count,
            base_register,
            space: 0,
        }
    }
}

/// One root-signature slot. Each occupies one 8-byte input in a shader record,
/// except `Constants`, which occupies `count` 4-byte values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootParameter {
    DescriptorTable(Vec<DescriptorRange>),
    ShaderResourceView { register: u32, space: u32 },
    UnorderedAccessView { register: u32, space: u32 },
    ConstantBufferView { register: u32, space: u32 },
    Constants { register: u32, space: u32, count: u32 },
}

impl RootParameter {
    pub fn srv(register: u32) -> Self {
        Self::ShaderResourceView { register, space: 0 }
    }

    pub fn uav(register: u32) -> Self {
        Self::UnorderedAccessView { register, space: 0 }
    }

    pub fn cbv(register: u32) -> Self {
        Self::ConstantBufferView { register, space: 0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootSignatureKind {
    Global,
    Local,
}

#[derive(Clone, Debug)]
pub struct RootSignatureDescriptor<'a> {
    pub label: &'a str,
    pub kind: RootSignatureKind,
    pub parameters: &'a [RootParameter],
}

#[derive(Clone, Debug)]
pub struct ShaderLibraryDescriptor<'a> {
    /// Stage name used in diagnostics, e.g. "ray-generation".
    pub label: &'a str,
    pub source_name: &'a str,
    pub source: &'a str,
    /// Symbol the library exports.
    pub export: &'a str,
    pub target_profile: &'a str,
}

/// Position of a subobject inside a `StateObjectDescriptor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubobjectHandle(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitGroupKind {
    Triangles,
    ProceduralPrimitive,
}

pub enum Subobject<'a, A: Api> {
    DxilLibrary {
        library: &'a A::ShaderLibrary,
        exports: Vec<String>,
    },
    HitGroup {
        export: String,
        kind: HitGroupKind,
        closest_hit: Option<String>,
        any_hit: Option<String>,
        intersection: Option<String>,
    },
    ShaderConfig {
        max_payload_size: u32,
        max_attribute_size: u32,
    },
    LocalRootSignature(&'a A::RootSignature),
    GlobalRootSignature(&'a A::RootSignature),
    ExportsAssociation {
        subobject: SubobjectHandle,
        exports: Vec<String>,
    },
    PipelineConfig {
        max_trace_recursion_depth: u32,
    },
}

impl<A: Api> Subobject<'_, A> {
    pub fn kind_name(&self) -> &'static str {
        match *self {
            Self::DxilLibrary { .. } => "dxil-library",
            Self::HitGroup { .. } => "hit-group",
            Self::ShaderConfig { .. } => "shader-config",
            Self::LocalRootSignature(_) => "local-root-signature",
            Self::GlobalRootSignature(_) => "global-root-signature",
            Self::ExportsAssociation { .. } => "exports-association",
            Self::PipelineConfig { .. } => "pipeline-config",
        }
    }
}

pub struct StateObjectDescriptor<'a, A: Api> {
    pub label: &'a str,
    pub subobjects: Vec<Subobject<'a, A>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuAddressRange {
    pub start_address: GpuAddress,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuAddressRangeAndStride {
    pub start_address: GpuAddress,
    pub size: u64,
    pub stride: u64,
}

/// Where the dispatch finds each shader table, plus the launch grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub ray_generation: GpuAddressRange,
    pub miss: GpuAddressRangeAndStride,
    pub hit_group: GpuAddressRangeAndStride,
    pub callable: GpuAddressRangeAndStride,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

pub trait Api: Sized + 'static {
    type Device: Device<Self>;
    type Queue: Queue<Self>;
    type CommandList: CommandList<Self>;
    type Fence: Fence;

    type Buffer: Buffer;
    type Texture: fmt::Debug;
    type DescriptorHeap: DescriptorHeap;

    type RootSignature: fmt::Debug;
    type ShaderLibrary: fmt::Debug;
    type Pipeline: Pipeline;

    type Surface: Surface<Self>;
}

pub trait Buffer: fmt::Debug {
    fn gpu_address(&self) -> GpuAddress;
    fn size(&self) -> u64;
}

pub trait DescriptorHeap: fmt::Debug {
    fn cpu_start(&self) -> CpuDescriptorHandle;
    fn gpu_start(&self) -> GpuDescriptorHandle;
}

pub trait Pipeline: fmt::Debug {
    /// Identifier of an exported program or hit group, `None` if not exported.
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier>;
}

pub trait Fence {
    fn completed_value(&self) -> u64;

    /// Block until `value` is reached. Returns `false` on timeout.
    fn wait(&self, value: u64, timeout: Duration) -> Result<bool>;
}

pub trait Device<A: Api> {
    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<A::Buffer>;

    /// Copy `data` into an upload-heap buffer at `offset`.
    fn write_buffer(&self, buffer: &A::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<A::Texture>;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDescriptor) -> Result<A::DescriptorHeap>;
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;
    fn create_texture_uav(&self, texture: &A::Texture, dest: CpuDescriptorHandle);
    fn create_acceleration_structure_srv(&self, location: GpuAddress, dest: CpuDescriptorHandle);
    fn create_constant_buffer_view(&self, buffer: &A::Buffer, size: u64, dest: CpuDescriptorHandle);

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> PrebuildInfo;

    fn compile_shader_library(&self, desc: &ShaderLibraryDescriptor) -> Result<A::ShaderLibrary>;
    fn create_root_signature(&self, desc: &RootSignatureDescriptor) -> Result<A::RootSignature>;
    fn create_pipeline(&self, desc: &StateObjectDescriptor<A>) -> Result<A::Pipeline>;

    /// The returned list is closed; `reset` it before recording.
    fn create_command_list(&self) -> Result<A::CommandList>;
    fn create_fence(&self) -> Result<A::Fence>;
}

pub trait Queue<A: Api> {
    fn execute(&self, list: &A::CommandList) -> Result<()>;
    fn signal(&self, fence: &A::Fence, value: u64) -> Result<()>;
}

pub trait CommandList<A: Api> {
    fn reset(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn transition_buffer(&mut self, buffer: &A::Buffer, before: ResourceState, after: ResourceState);
    fn transition_texture(
        &mut self,
        texture: &A::Texture,
        before: ResourceState,
        after: ResourceState,
    );
    fn uav_barrier(&mut self, buffer: &A::Buffer);

    fn copy_buffer(&mut self, dst: &A::Buffer, src: &A::Buffer, size: u64);
    fn copy_texture(&mut self, dst: &A::Texture, src: &A::Texture);

    fn build_acceleration_structure(&mut self, desc: &BuildAccelerationStructureDesc);

    fn set_descriptor_heap(&mut self, heap: &A::DescriptorHeap);
    fn set_compute_root_signature(&mut self, root_signature: &A::RootSignature);
    fn set_pipeline(&mut self, pipeline: &A::Pipeline);
    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc);
}

pub trait Surface<A: Api> {
    /// Client area in pixels.
    fn size(&self) -> (u32, u32);
    fn current_back_buffer_index(&self) -> usize;
    fn back_buffer(&self, index: usize) -> &A::Texture;
    fn present(&mut self) -> Result<()>;

    /// All work referencing the back buffers must have retired.
    fn resize(&mut self, device: &A::Device, width: u32, height: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn align_to_rounds_up_to_power_of_two() {
        assert_eq!(align_to(32, 64), 64);
        assert_eq!(align_to(64, 64), 64);
        assert_eq!(align_to(65, 64), 128);
        assert_eq!(align_to(0, 32), 0);
        assert_eq!(align_to(40, 32), 64);
    }

    #[test]
    fn instance_desc_matches_d3d12_layout() {
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);
        assert_eq!(offset_of!(InstanceDesc, instance_id_and_mask), 48);
        assert_eq!(offset_of!(InstanceDesc, hit_group_index_and_flags), 52);
        assert_eq!(offset_of!(InstanceDesc, acceleration_structure), 56);
    }

    #[test]
    fn packed_fields_round_trip() {
        let desc = InstanceDesc {
            transform: [[0.0; 4]; 3],
            instance_id_and_mask: pack_24_8(0x12_3456, 0xff),
            hit_group_index_and_flags: pack_24_8(7, InstanceFlags::FORCE_OPAQUE.bits()),
            acceleration_structure: 0x1000,
        };
        assert_eq!(desc.instance_id(), 0x12_3456);
        assert_eq!(desc.mask(), 0xff);
        assert_eq!(desc.hit_group_index(), 7);
        assert_eq!(desc.flags(), InstanceFlags::FORCE_OPAQUE);
    }

    #[test]
    fn pack_truncates_to_24_bits() {
        assert_eq!(pack_24_8(0x0100_0001, 0), 1);
    }
}
