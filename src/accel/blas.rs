use crate::{
    context::RenderContext,
    error::Result,
    geometry::GeometryBuffer,
    hal::{AccelerationStructureInputs, Api, Buffer as _, BuildFlags, GpuAddress},
};

use super::AccelerationStructureBuffers;

/// Intersection structure over one mesh's triangles. Built once, immutable.
pub struct BottomLevelAs<A: Api> {
    buffers: AccelerationStructureBuffers<A>,
    triangle_count: u32,
}

impl<A: Api> BottomLevelAs<A> {
    pub fn build(ctx: &mut RenderContext<A>, label: &str, geometry: &GeometryBuffer<A>) -> Result<Self> {
        let geometries = [geometry.triangles()];
        let inputs = AccelerationStructureInputs::BottomLevel {
            geometries: &geometries,
            flags: BuildFlags::PREFER_FAST_TRACE,
        };
        let buffers = super::allocate_memory(&ctx.device, label, &inputs)?;
        super::build(ctx, inputs, &buffers)?;
        log::debug!(
            "Built BLAS `{}` ({} triangles) at {:#x}",
            label,
            geometries[0].triangle_count(),
            buffers.result.gpu_address()
        );
        Ok(Self {
            triangle_count: geometries[0].triangle_count(),
            buffers,
        })
    }

    /// Never `0`, stable for the lifetime of the structure.
    pub fn gpu_address(&self) -> GpuAddress {
        self.buffers.result.gpu_address()
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn result(&self) -> &A::Buffer {
        &self.buffers.result
    }
}
