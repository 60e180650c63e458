//! Deterministic software device.
//!
//! Buffers live in CPU memory behind synthetic GPU virtual addresses, command
//! lists are executed on submission, fences complete when signaled, and the
//! queue validates what D3D12 would otherwise leave undefined: builds read
//! live buffers, top-level instances point at built bottom-level structures,
//! and dispatched shader tables are aligned and in bounds.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;

use super::{
    AccelerationStructureInputs, BufferDescriptor, BuildAccelerationStructureDesc, BuildFlags,
    CpuDescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapKind, DispatchRaysDesc,
    GpuAddress, GpuDescriptorHandle, InstanceDesc, MemoryLocation, PrebuildInfo, ResourceState,
    RootParameter, RootSignatureDescriptor, RootSignatureKind, ShaderIdentifier,
    ShaderLibraryDescriptor, StateObjectDescriptor, Subobject, TextureDescriptor, TextureFormat,
    TriangleGeometry, ACCELERATION_STRUCTURE_ALIGNMENT, BACK_BUFFER_COUNT,
    MAX_TRACE_RECURSION_DEPTH, SHADER_IDENTIFIER_SIZE, SHADER_RECORD_ALIGNMENT,
    SHADER_TABLE_ALIGNMENT,
};
use crate::{
    config::RendererConfig,
    context::RenderContext,
    error::{Error, Result},
};

const BASE_ADDRESS: GpuAddress = 0x0001_0000_0000;
const CPU_DESCRIPTOR_BASE: usize = 0x10_0000;
const GPU_DESCRIPTOR_BASE: u64 = 0x0008_0000_0000;
const CBV_SRV_UAV_INCREMENT: u32 = 32;
const RTV_DSV_INCREMENT: u32 = 8;

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

/// Create a headless device, queue and surface and wrap them in a context.
pub fn open(config: &RendererConfig) -> Result<RenderContext<Api>> {
    let device = Device::new();
    let queue = device.create_queue();
    let surface = Surface::new(config.window_width, config.window_height);
    log::info!(
        "Opened headless device ({}x{})",
        config.window_width,
        config.window_height
    );
    RenderContext::new(device, queue, surface, config)
}

type Memory = Arc<Mutex<Vec<u8>>>;
type Slots = Arc<Mutex<Vec<Option<DescriptorView>>>>;

/// What a completed acceleration-structure build left at its destination.
#[derive(Clone, Debug, PartialEq)]
pub enum BuiltStructure {
    BottomLevel { triangle_count: u32, vertex_count: u32 },
    TopLevel { instances: Vec<InstanceDesc> },
}

/// Contents of one descriptor slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorView {
    TextureUav { label: String, width: u32, height: u32 },
    AccelerationStructure { location: GpuAddress },
    ConstantBuffer { address: GpuAddress, size: u64 },
}

struct HeapEntry {
    cpu_start: usize,
    increment: u32,
    slots: Weak<Mutex<Vec<Option<DescriptorView>>>>,
}

#[derive(Default)]
struct Shared {
    next_address: Mutex<GpuAddress>,
    next_descriptor_base: Mutex<u64>,
    buffers: Mutex<BTreeMap<GpuAddress, (u64, Weak<Mutex<Vec<u8>>>)>>,
    heaps: Mutex<Vec<HeapEntry>>,
    structures: Mutex<HashMap<GpuAddress, BuiltStructure>>,
    dispatches: Mutex<Vec<DispatchRaysDesc>>,
    submissions: AtomicU64,
}

impl Shared {
    fn allocate_address(&self, size: u64) -> GpuAddress {
        let mut next = self.next_address.lock();
        if *next == 0 {
            *next = BASE_ADDRESS;
        }
        let address = *next;
        *next = super::align_to(address + size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
        address
    }

    /// Memory of the live buffer containing `[address, address + len)`.
    fn resolve(&self, address: GpuAddress, len: u64) -> Option<(Memory, usize)> {
        let buffers = self.buffers.lock();
        let (&base, &(size, ref memory)) = buffers.range(..=address).next_back()?;
        if address + len > base + size {
            return None;
        }
        memory.upgrade().map(|memory| (memory, (address - base) as usize))
    }

    fn read(&self, address: GpuAddress, len: u64) -> Option<Vec<u8>> {
        let (memory, offset) = self.resolve(address, len)?;
        let bytes = memory.lock()[offset..offset + len as usize].to_vec();
        Some(bytes)
    }

    fn write_descriptor(&self, dest: CpuDescriptorHandle, view: DescriptorView) {
        let heaps = self.heaps.lock();
        for heap in heaps.iter() {
            if dest.0 < heap.cpu_start {
                continue;
            }
            let index = (dest.0 - heap.cpu_start) / heap.increment as usize;
            if let Some(slots) = heap.slots.upgrade() {
                let mut slots = slots.lock();
                if index < slots.len() {
                    slots[index] = Some(view);
                    return;
                }
            }
        }
        log::warn!("Descriptor write to unknown handle {:#x}", dest.0);
    }
}

#[derive(Clone)]
pub struct Device {
    shared: Arc<Shared>,
}

impl Device {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn create_queue(&self) -> Queue {
        Queue {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Result of the last build whose destination was `address`.
    pub fn built_structure(&self, address: GpuAddress) -> Option<BuiltStructure> {
        self.shared.structures.lock().get(&address).cloned()
    }

    /// Every `DispatchRays` executed so far, in submission order.
    pub fn dispatches(&self) -> Vec<DispatchRaysDesc> {
        self.shared.dispatches.lock().clone()
    }

    pub fn submission_count(&self) -> u64 {
        self.shared.submissions.load(Ordering::Acquire)
    }

    /// Bytes at a GPU address, if a live buffer covers the whole range.
    pub fn read_memory(&self, address: GpuAddress, len: u64) -> Option<Vec<u8>> {
        self.shared.read(address, len)
    }

    pub fn is_live(&self, address: GpuAddress) -> bool {
        self.shared.resolve(address, 1).is_some()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Buffer {
    label: String,
    address: GpuAddress,
    size: u64,
    location: MemoryLocation,
    memory: Memory,
}

impl Buffer {
    /// Snapshot of the buffer contents.
    pub fn contents(&self) -> Vec<u8> {
        self.memory.lock().clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl super::Buffer for Buffer {
    fn gpu_address(&self) -> GpuAddress {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
pub struct Texture {
    label: String,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl Texture {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

#[derive(Debug)]
pub struct DescriptorHeap {
    kind: DescriptorHeapKind,
    cpu_start: usize,
    gpu_start: u64,
    slots: Slots,
}

impl DescriptorHeap {
    pub fn view_at(&self, index: u32) -> Option<DescriptorView> {
        self.slots.lock().get(index as usize).cloned().flatten()
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }
}

impl super::DescriptorHeap for DescriptorHeap {
    fn cpu_start(&self) -> CpuDescriptorHandle {
        CpuDescriptorHandle(self.cpu_start)
    }

    fn gpu_start(&self) -> GpuDescriptorHandle {
        GpuDescriptorHandle(self.gpu_start)
    }
}

#[derive(Debug)]
pub struct RootSignature {
    kind: RootSignatureKind,
    parameters: Vec<RootParameter>,
}

impl RootSignature {
    pub fn kind(&self) -> RootSignatureKind {
        self.kind
    }

    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }
}

#[derive(Debug)]
pub struct ShaderLibrary {
    export: String,
}

#[derive(Debug)]
pub struct Pipeline {
    identifiers: HashMap<String, ShaderIdentifier>,
    max_payload_size: u32,
    max_attribute_size: u32,
    max_recursion_depth: u32,
    local_associations: HashSet<String>,
}

impl Pipeline {
    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    pub fn max_attribute_size(&self) -> u32 {
        self.max_attribute_size
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    /// Whether `export` has a local root signature associated with it.
    pub fn has_local_root_signature(&self, export: &str) -> bool {
        self.local_associations.contains(export)
    }
}

impl super::Pipeline for Pipeline {
    fn shader_identifier(&self, export: &str) -> Option<ShaderIdentifier> {
        self.identifiers.get(export).copied()
    }
}

/// Stable identifier bytes for an export name (FNV-1a, widened).
fn identifier_for(name: &str) -> ShaderIdentifier {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let words: [u64; (SHADER_IDENTIFIER_SIZE / 8) as usize] =
        array_init::array_init(|i| hash.rotate_left(16 * i as u32) ^ i as u64);
    let mut bytes = [0; SHADER_IDENTIFIER_SIZE as usize];
    for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    ShaderIdentifier(bytes)
}

#[derive(Default)]
pub struct Fence {
    value: Arc<AtomicU64>,
}

impl super::Fence for Fence {
    fn completed_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn wait(&self, value: u64, _timeout: Duration) -> Result<bool> {
        // Work completes at submission, so a value not reached yet never will be.
        Ok(self.completed_value() >= value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BuildInputs {
    BottomLevel {
        geometries: Vec<TriangleGeometry>,
        flags: BuildFlags,
    },
    TopLevel {
        instance_descs: GpuAddress,
        instance_count: u32,
        flags: BuildFlags,
    },
}

/// A recorded command, owning everything it references by value.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    TransitionBuffer {
        buffer: GpuAddress,
        before: ResourceState,
        after: ResourceState,
    },
    TransitionTexture {
        texture: String,
        before: ResourceState,
        after: ResourceState,
    },
    UavBarrier {
        buffer: GpuAddress,
    },
    CopyBuffer {
        dst: GpuAddress,
        src: GpuAddress,
        size: u64,
    },
    CopyTexture {
        dst: String,
        src: String,
    },
    BuildAccelerationStructure {
        inputs: BuildInputs,
        scratch: GpuAddress,
        dest: GpuAddress,
    },
    SetDescriptorHeap {
        gpu_start: u64,
    },
    SetComputeRootSignature,
    SetPipeline,
    DispatchRays(DispatchRaysDesc),
}

#[derive(Default)]
pub struct CommandList {
    commands: Vec<Command>,
    open: bool,
}

impl CommandList {
    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    fn record(&mut self, command: Command) {
        debug_assert!(self.open, "recording into a closed command list");
        self.commands.push(command);
    }
}

impl super::CommandList<Api> for CommandList {
    fn reset(&mut self) -> Result<()> {
        self.commands.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::device("Close", "command list is already closed"));
        }
        self.open = false;
        Ok(())
    }

    fn transition_buffer(&mut self, buffer: &Buffer, before: ResourceState, after: ResourceState) {
        self.record(Command::TransitionBuffer {
            buffer: buffer.address,
            before,
            after,
        });
    }

    fn transition_texture(
        &mut self,
        texture: &Texture,
        before: ResourceState,
        after: ResourceState,
    ) {
        self.record(Command::TransitionTexture {
            texture: texture.label.clone(),
            before,
            after,
        });
    }

    fn uav_barrier(&mut self, buffer: &Buffer) {
        self.record(Command::UavBarrier {
            buffer: buffer.address,
        });
    }

    fn copy_buffer(&mut self, dst: &Buffer, src: &Buffer, size: u64) {
        self.record(Command::CopyBuffer {
            dst: dst.address,
            src: src.address,
            size,
        });
    }

    fn copy_texture(&mut self, dst: &Texture, src: &Texture) {
        self.record(Command::CopyTexture {
            dst: dst.label.clone(),
            src: src.label.clone(),
        });
    }

    fn build_acceleration_structure(&mut self, desc: &BuildAccelerationStructureDesc) {
        let inputs = match desc.inputs {
            AccelerationStructureInputs::BottomLevel { geometries, flags } => {
                BuildInputs::BottomLevel {
                    geometries: geometries.to_vec(),
                    flags,
                }
            }
            AccelerationStructureInputs::TopLevel {
                instance_descs,
                instance_count,
                flags,
            } => BuildInputs::TopLevel {
                instance_descs,
                instance_count,
                flags,
            },
        };
        self.record(Command::BuildAccelerationStructure {
            inputs,
            scratch: desc.scratch,
            dest: desc.dest,
        });
    }

    fn set_descriptor_heap(&mut self, heap: &DescriptorHeap) {
        self.record(Command::SetDescriptorHeap {
            gpu_start: heap.gpu_start,
        });
    }

    fn set_compute_root_signature(&mut self, _root_signature: &RootSignature) {
        self.record(Command::SetComputeRootSignature);
    }

    fn set_pipeline(&mut self, _pipeline: &Pipeline) {
        self.record(Command::SetPipeline);
    }

    fn dispatch_rays(&mut self, desc: &DispatchRaysDesc) {
        self.record(Command::DispatchRays(*desc));
    }
}

pub struct Queue {
    shared: Arc<Shared>,
}

impl Queue {
    fn copy(&self, dst: GpuAddress, src: GpuAddress, size: u64) -> Result<()> {
        let bytes = self
            .shared
            .read(src, size)
            .ok_or_else(|| Error::device("CopyBufferRegion", "source is not a live buffer"))?;
        let (memory, offset) = self
            .shared
            .resolve(dst, size)
            .ok_or_else(|| Error::device("CopyBufferRegion", "destination is not a live buffer"))?;
        memory.lock()[offset..offset + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    fn build(&self, inputs: &BuildInputs, scratch: GpuAddress, dest: GpuAddress) -> Result<()> {
        let fail = |level: &'static str, message: String| Error::AccelerationStructureBuild {
            level,
            message,
        };
        let (level, structure) = match *inputs {
            BuildInputs::BottomLevel { ref geometries, .. } => {
                let mut triangle_count = 0;
                let mut vertex_count = 0;
                for geometry in geometries {
                    let vertex_bytes = geometry.vertex_stride * u64::from(geometry.vertex_count);
                    let index_bytes = 4 * u64::from(geometry.index_count);
                    if self.shared.resolve(geometry.vertex_buffer, vertex_bytes).is_none() {
                        return Err(fail("bottom-level", "vertex buffer is not live".into()));
                    }
                    if self.shared.resolve(geometry.index_buffer, index_bytes).is_none() {
                        return Err(fail("bottom-level", "index buffer is not live".into()));
                    }
                    if geometry.index_count % 3 != 0 {
                        return Err(fail(
                            "bottom-level",
                            format!("index count {} is not a triangle list", geometry.index_count),
                        ));
                    }
                    triangle_count += geometry.triangle_count();
                    vertex_count += geometry.vertex_count;
                }
                (
                    "bottom-level",
                    BuiltStructure::BottomLevel {
                        triangle_count,
                        vertex_count,
                    },
                )
            }
            BuildInputs::TopLevel {
                instance_descs,
                instance_count,
                ..
            } => {
                let mut instances = Vec::with_capacity(instance_count as usize);
                if instance_count > 0 {
                    let len = std::mem::size_of::<InstanceDesc>() as u64 * u64::from(instance_count);
                    let bytes = self
                        .shared
                        .read(instance_descs, len)
                        .ok_or_else(|| fail("top-level", "instance descriptors are not live".into()))?;
                    instances.extend(
                        bytes
                            .chunks_exact(std::mem::size_of::<InstanceDesc>())
                            .map(bytemuck::pod_read_unaligned::<InstanceDesc>),
                    );
                }
                let structures = self.shared.structures.lock();
                for (i, instance) in instances.iter().enumerate() {
                    match structures.get(&instance.acceleration_structure) {
                        Some(BuiltStructure::BottomLevel { .. }) => {}
                        _ => {
                            return Err(fail(
                                "top-level",
                                format!("instance {} references no bottom-level structure", i),
                            ))
                        }
                    }
                }
                ("top-level", BuiltStructure::TopLevel { instances })
            }
        };
        if self.shared.resolve(scratch, 1).is_none() {
            return Err(fail(level, "scratch buffer is not live".into()));
        }
        if self.shared.resolve(dest, 1).is_none() {
            return Err(fail(level, "destination buffer is not live".into()));
        }
        self.shared.structures.lock().insert(dest, structure);
        Ok(())
    }

    fn check_table(&self, name: &str, start: GpuAddress, size: u64, stride: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if start % SHADER_TABLE_ALIGNMENT != 0 {
            return Err(Error::device(
                "DispatchRays",
                format!("{} table start {:#x} is not table-aligned", name, start),
            ));
        }
        if stride % SHADER_RECORD_ALIGNMENT != 0 {
            return Err(Error::device(
                "DispatchRays",
                format!("{} table stride {} is not record-aligned", name, stride),
            ));
        }
        if self.shared.resolve(start, size).is_none() {
            return Err(Error::device(
                "DispatchRays",
                format!("{} table is outside any live buffer", name),
            ));
        }
        Ok(())
    }

    fn dispatch(&self, desc: &DispatchRaysDesc) -> Result<()> {
        let ray_gen = desc.ray_generation;
        self.check_table("ray-generation", ray_gen.start_address, ray_gen.size, ray_gen.size)?;
        self.check_table("miss", desc.miss.start_address, desc.miss.size, desc.miss.stride)?;
        let hit = desc.hit_group;
        self.check_table("hit-group", hit.start_address, hit.size, hit.stride)?;
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(Error::device("DispatchRays", "empty dispatch grid"));
        }
        self.shared.dispatches.lock().push(*desc);
        Ok(())
    }
}

impl super::Queue<Api> for Queue {
    fn execute(&self, list: &CommandList) -> Result<()> {
        if list.open {
            return Err(Error::device(
                "ExecuteCommandLists",
                "command list must be closed before execution",
            ));
        }
        for command in &list.commands {
            match *command {
                Command::CopyBuffer { dst, src, size } => self.copy(dst, src, size)?,
                Command::BuildAccelerationStructure {
                    ref inputs,
                    scratch,
                    dest,
                } => self.build(inputs, scratch, dest)?,
                Command::DispatchRays(ref desc) => self.dispatch(desc)?,
                _ => {}
            }
        }
        self.shared.submissions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        fence.value.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }
}

impl super::Device<Api> for Device {
    fn create_buffer(&self, desc: &BufferDescriptor) -> Result<Buffer> {
        if desc.size == 0 {
            return Err(Error::device(
                "CreateCommittedResource",
                format!("buffer `{}` has zero size", desc.label),
            ));
        }
        let address = self.shared.allocate_address(desc.size);
        let memory = Arc::new(Mutex::new(vec![0; desc.size as usize]));
        self.shared
            .buffers
            .lock()
            .insert(address, (desc.size, Arc::downgrade(&memory)));
        Ok(Buffer {
            label: desc.label.to_string(),
            address,
            size: desc.size,
            location: desc.location,
            memory,
        })
    }

    fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if buffer.location != MemoryLocation::CpuToGpu {
            return Err(Error::Map(buffer.label.clone()));
        }
        let end = offset as usize + data.len();
        let mut memory = buffer.memory.lock();
        if end > memory.len() {
            return Err(Error::Map(buffer.label.clone()));
        }
        memory[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> Result<Texture> {
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::device(
                "CreateCommittedResource",
                format!("texture `{}` has zero size", desc.label),
            ));
        }
        Ok(Texture {
            label: desc.label.to_string(),
            width: desc.width,
            height: desc.height,
            format: desc.format,
        })
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDescriptor) -> Result<DescriptorHeap> {
        let increment = self.descriptor_increment(desc.kind);
        let span = u64::from(desc.capacity) * u64::from(increment);
        let offset = {
            let mut next = self.shared.next_descriptor_base.lock();
            let offset = *next;
            *next = super::align_to(offset + span + 1, 0x1000);
            offset
        };
        let slots: Slots = Arc::new(Mutex::new(vec![None; desc.capacity as usize]));
        let cpu_start = CPU_DESCRIPTOR_BASE + offset as usize;
        self.shared.heaps.lock().push(HeapEntry {
            cpu_start,
            increment,
            slots: Arc::downgrade(&slots),
        });
        Ok(DescriptorHeap {
            kind: desc.kind,
            cpu_start,
            gpu_start: if desc.shader_visible {
                GPU_DESCRIPTOR_BASE + offset
            } else {
                0
            },
            slots,
        })
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::CbvSrvUav => CBV_SRV_UAV_INCREMENT,
            DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv => RTV_DSV_INCREMENT,
        }
    }

    fn create_texture_uav(&self, texture: &Texture, dest: CpuDescriptorHandle) {
        self.shared.write_descriptor(
            dest,
            DescriptorView::TextureUav {
                label: texture.label.clone(),
                width: texture.width,
                height: texture.height,
            },
        );
    }

    fn create_acceleration_structure_srv(&self, location: GpuAddress, dest: CpuDescriptorHandle) {
        self.shared
            .write_descriptor(dest, DescriptorView::AccelerationStructure { location });
    }

    fn create_constant_buffer_view(&self, buffer: &Buffer, size: u64, dest: CpuDescriptorHandle) {
        self.shared.write_descriptor(
            dest,
            DescriptorView::ConstantBuffer {
                address: buffer.address,
                size,
            },
        );
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> PrebuildInfo {
        let (result, scratch) = match *inputs {
            AccelerationStructureInputs::BottomLevel { geometries, .. } => {
                let triangles: u64 = geometries.iter().map(|g| u64::from(g.triangle_count())).sum();
                (256 + 64 * triangles, 256 + 32 * triangles)
            }
            AccelerationStructureInputs::TopLevel { instance_count, .. } => {
                let count = u64::from(instance_count);
                (256 + 128 * count, 256 + 64 * count)
            }
        };
        PrebuildInfo {
            result_data_max_size: super::align_to(result, ACCELERATION_STRUCTURE_ALIGNMENT),
            scratch_data_size: super::align_to(scratch, ACCELERATION_STRUCTURE_ALIGNMENT),
            update_scratch_data_size: 0,
        }
    }

    fn compile_shader_library(&self, desc: &ShaderLibraryDescriptor) -> Result<ShaderLibrary> {
        if desc.source.trim().is_empty() {
            return Err(Error::ShaderCompilation {
                stage: desc.label.to_string(),
                log: format!("{}: empty source", desc.source_name),
            });
        }
        if !desc.source.contains(desc.export) {
            return Err(Error::ShaderCompilation {
                stage: desc.label.to_string(),
                log: format!(
                    "{}: no entry point named `{}` in {}",
                    desc.source_name, desc.export, desc.target_profile
                ),
            });
        }
        Ok(ShaderLibrary {
            export: desc.export.to_string(),
        })
    }

    fn create_root_signature(&self, desc: &RootSignatureDescriptor) -> Result<RootSignature> {
        for parameter in desc.parameters {
            if let RootParameter::DescriptorTable(ref ranges) = *parameter {
                if ranges.is_empty() || ranges.iter().any(|range| range.count == 0) {
                    return Err(Error::RootSignature(format!(
                        "`{}`: descriptor table with an empty range",
                        desc.label
                    )));
                }
            }
        }
        Ok(RootSignature {
            kind: desc.kind,
            parameters: desc.parameters.to_vec(),
        })
    }

    fn create_pipeline(&self, desc: &StateObjectDescriptor<Api>) -> Result<Pipeline> {
        let fail = |message: String| Error::PipelineCreation(format!("{}: {}", desc.label, message));

        let mut exports = HashSet::new();
        let mut identifiers = HashMap::new();
        let mut shader_config = None;
        let mut recursion = None;
        let mut local_associations = HashSet::new();

        for subobject in &desc.subobjects {
            match *subobject {
                Subobject::DxilLibrary {
                    library,
                    exports: ref names,
                } => {
                    for name in names {
                        if *name != library.export {
                            return Err(fail(format!("library does not define `{}`", name)));
                        }
                        exports.insert(name.clone());
                    }
                }
                Subobject::HitGroup {
                    ref export,
                    ref closest_hit,
                    ref any_hit,
                    ref intersection,
                    ..
                } => {
                    for import in [closest_hit, any_hit, intersection].into_iter().flatten() {
                        if !exports.contains(import) {
                            return Err(fail(format!(
                                "hit group `{}` imports unknown `{}`",
                                export, import
                            )));
                        }
                    }
                    identifiers.insert(export.clone(), identifier_for(export));
                    exports.insert(export.clone());
                }
                Subobject::ShaderConfig {
                    max_payload_size,
                    max_attribute_size,
                } => shader_config = Some((max_payload_size, max_attribute_size)),
                Subobject::PipelineConfig {
                    max_trace_recursion_depth,
                } => {
                    if recursion.is_some() {
                        return Err(fail("more than one pipeline config".into()));
                    }
                    recursion = Some(max_trace_recursion_depth);
                }
                Subobject::ExportsAssociation {
                    subobject,
                    exports: ref names,
                } => {
                    let target = desc
                        .subobjects
                        .get(subobject.0)
                        .ok_or_else(|| fail(format!("association to missing subobject {}", subobject.0)))?;
                    for name in names {
                        if !exports.contains(name) {
                            return Err(fail(format!("association names unknown export `{}`", name)));
                        }
                        if let Subobject::LocalRootSignature(_) = *target {
                            local_associations.insert(name.clone());
                        }
                    }
                }
                Subobject::LocalRootSignature(root_signature) => {
                    if root_signature.kind != RootSignatureKind::Local {
                        return Err(fail("local subobject holds a global root signature".into()));
                    }
                }
                Subobject::GlobalRootSignature(root_signature) => {
                    if root_signature.kind != RootSignatureKind::Global {
                        return Err(fail("global subobject holds a local root signature".into()));
                    }
                }
            }
        }

        let (max_payload_size, max_attribute_size) =
            shader_config.ok_or_else(|| fail("missing shader config".into()))?;
        let max_recursion_depth = recursion.ok_or_else(|| fail("missing pipeline config".into()))?;
        if max_recursion_depth > MAX_TRACE_RECURSION_DEPTH {
            return Err(fail(format!("recursion depth {} too deep", max_recursion_depth)));
        }

        for name in &exports {
            identifiers
                .entry(name.clone())
                .or_insert_with(|| identifier_for(name));
        }
        Ok(Pipeline {
            identifiers,
            max_payload_size,
            max_attribute_size,
            max_recursion_depth,
            local_associations,
        })
    }

    fn create_command_list(&self) -> Result<CommandList> {
        Ok(CommandList::default())
    }

    fn create_fence(&self) -> Result<Fence> {
        Ok(Fence::default())
    }
}

/// Off-screen swap chain with `BACK_BUFFER_COUNT` textures.
pub struct Surface {
    width: u32,
    height: u32,
    back_buffers: [Texture; BACK_BUFFER_COUNT],
    current: usize,
    presented: u64,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            back_buffers: Self::back_buffers(width, height),
            current: 0,
            presented: 0,
        }
    }

    fn back_buffers(width: u32, height: u32) -> [Texture; BACK_BUFFER_COUNT] {
        array_init::array_init(|i| Texture {
            label: format!("Back Buffer {}", i),
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
        })
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }
}

impl super::Surface<Api> for Surface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn current_back_buffer_index(&self) -> usize {
        self.current
    }

    fn back_buffer(&self, index: usize) -> &Texture {
        &self.back_buffers[index]
    }

    fn present(&mut self) -> Result<()> {
        self.presented += 1;
        self.current = (self.current + 1) % BACK_BUFFER_COUNT;
        Ok(())
    }

    fn resize(&mut self, _device: &Device, width: u32, height: u32) -> Result<()> {
        self.width = width.max(1);
        self.height = height.max(1);
        self.back_buffers = Self::back_buffers(self.width, self.height);
        self.current = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{
        BufferUses, CommandList as _, Device as _, Fence as _, Queue as _, Buffer as _,
    };

    fn upload_buffer(device: &Device, size: u64) -> Buffer {
        device
            .create_buffer(&BufferDescriptor {
                label: "test",
                size,
                location: MemoryLocation::CpuToGpu,
                usage: BufferUses::empty(),
                initial_state: ResourceState::GenericRead,
            })
            .unwrap()
    }

    #[test]
    fn addresses_are_unique_and_aligned() {
        let device = Device::new();
        let a = upload_buffer(&device, 10);
        let b = upload_buffer(&device, 300);
        assert_ne!(a.gpu_address(), 0);
        assert_eq!(a.gpu_address() % ACCELERATION_STRUCTURE_ALIGNMENT, 0);
        assert_eq!(b.gpu_address() % ACCELERATION_STRUCTURE_ALIGNMENT, 0);
        assert!(b.gpu_address() >= a.gpu_address() + a.size());
    }

    #[test]
    fn dropped_buffers_stop_resolving() {
        let device = Device::new();
        let buffer = upload_buffer(&device, 64);
        let address = buffer.gpu_address();
        assert!(device.is_live(address));
        drop(buffer);
        assert!(!device.is_live(address));
    }

    #[test]
    fn copy_executes_on_submission() {
        let device = Device::new();
        let queue = device.create_queue();
        let src = upload_buffer(&device, 8);
        let dst = upload_buffer(&device, 8);
        device.write_buffer(&src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut list = device.create_command_list().unwrap();
        list.reset().unwrap();
        list.copy_buffer(&dst, &src, 8);
        assert!(queue.execute(&list).is_err(), "open lists must not execute");
        list.close().unwrap();
        queue.execute(&list).unwrap();

        assert_eq!(dst.contents(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn fence_completes_on_signal() {
        let device = Device::new();
        let queue = device.create_queue();
        let fence = device.create_fence().unwrap();
        assert!(!fence.wait(1, Duration::from_millis(1)).unwrap());
        queue.signal(&fence, 1).unwrap();
        assert_eq!(fence.completed_value(), 1);
        assert!(fence.wait(1, Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn identifiers_are_stable_and_distinct() {
        assert_eq!(identifier_for("RayGen"), identifier_for("RayGen"));
        assert_ne!(identifier_for("RayGen"), identifier_for("Miss"));
    }

    #[test]
    fn top_level_build_rejects_unbuilt_references() {
        let device = Device::new();
        let queue = device.create_queue();
        let instances = upload_buffer(&device, 64);
        let desc = InstanceDesc {
            transform: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
            instance_id_and_mask: super::super::pack_24_8(0, 0xff),
            hit_group_index_and_flags: 0,
            acceleration_structure: 0xdead_0000,
        };
        device
            .write_buffer(&instances, 0, bytemuck::bytes_of(&desc))
            .unwrap();
        let scratch = upload_buffer(&device, 256);
        let result = upload_buffer(&device, 256);

        let mut list = device.create_command_list().unwrap();
        list.reset().unwrap();
        list.build_acceleration_structure(&BuildAccelerationStructureDesc {
            inputs: AccelerationStructureInputs::TopLevel {
                instance_descs: instances.gpu_address(),
                instance_count: 1,
                flags: BuildFlags::PREFER_FAST_TRACE,
            },
            scratch: scratch.gpu_address(),
            dest: result.gpu_address(),
        });
        list.close().unwrap();
        let err = queue.execute(&list).unwrap_err();
        assert!(matches!(err, Error::AccelerationStructureBuild { .. }));
    }
}
