//! Bottom- and top-level acceleration structures.
//!
//! Both levels follow the same protocol: query prebuild sizes, allocate a
//! scratch and a result buffer in default memory, record the build followed by
//! a UAV barrier on the result, then submit and block on the fence so the
//! structure is complete before anything that reads it is submitted.

mod blas;
mod tlas;

pub use blas::BottomLevelAs;
pub use tlas::{collect_instances, Instance, InstanceBindings, TopLevelAs, INSTANCE_MASK};

use crate::{
    context::RenderContext,
    error::{Error, Result},
    hal::{
        self, align_to, AccelerationStructureInputs, Api, Buffer as _, BufferUses,
        CommandList as _, Device as _, MemoryLocation, ResourceState,
        ACCELERATION_STRUCTURE_ALIGNMENT,
    },
};

/// Scratch and result memory of one acceleration structure.
pub struct AccelerationStructureBuffers<A: Api> {
    pub scratch: A::Buffer,
    pub result: A::Buffer,
}

pub fn allocate_memory<A: Api>(
    device: &A::Device,
    label: &str,
    inputs: &AccelerationStructureInputs,
) -> Result<AccelerationStructureBuffers<A>> {
    let info = device.acceleration_structure_prebuild_info(inputs);
    if info.result_data_max_size == 0 {
        return Err(Error::AccelerationStructureBuild {
            level: inputs.level(),
            message: format!("`{}`: prebuild info reports an empty result", label),
        });
    }
    let scratch_size = align_to(info.scratch_data_size.max(1), ACCELERATION_STRUCTURE_ALIGNMENT);
    let result_size = align_to(info.result_data_max_size, ACCELERATION_STRUCTURE_ALIGNMENT);
    log::debug!(
        "{} `{}`: result {} bytes, scratch {} bytes",
        inputs.level(),
        label,
        result_size,
        scratch_size
    );

    let scratch = device.create_buffer(&hal::BufferDescriptor {
        label: &format!("{} scratch", label),
        size: scratch_size,
        location: MemoryLocation::GpuOnly,
        usage: BufferUses::UNORDERED_ACCESS,
        initial_state: ResourceState::UnorderedAccess,
    })?;
    let result = device.create_buffer(&hal::BufferDescriptor {
        label: &format!("{} result", label),
        size: result_size,
        location: MemoryLocation::GpuOnly,
        usage: BufferUses::UNORDERED_ACCESS | BufferUses::ACCELERATION_STRUCTURE,
        initial_state: ResourceState::AccelerationStructure,
    })?;
    Ok(AccelerationStructureBuffers { scratch, result })
}

/// Record and run one build, returning once the GPU has finished it.
pub fn build<A: Api>(
    ctx: &mut RenderContext<A>,
    inputs: AccelerationStructureInputs,
    buffers: &AccelerationStructureBuffers<A>,
) -> Result<()> {
    let level = inputs.level();
    ctx.commands.flush()?;

    let list = ctx.commands.reset_command_list()?;
    list.build_acceleration_structure(&hal::BuildAccelerationStructureDesc {
        inputs,
        scratch: buffers.scratch.gpu_address(),
        dest: buffers.result.gpu_address(),
    });
    list.uav_barrier(&buffers.result);

    ctx.commands.submit_and_wait().map_err(|err| match err {
        Error::Device { operation, message } => Error::AccelerationStructureBuild {
            level,
            message: format!("{}: {}", operation, message),
        },
        other => other,
    })
}
