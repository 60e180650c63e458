use glam::Mat4;

use crate::{
    context::RenderContext,
    error::Result,
    hal::{pack_24_8, AccelerationStructureInputs, Api, Buffer as _, BuildFlags, GpuAddress, InstanceDesc},
    scene::Scene,
    upload::UploadBuffer,
};

use super::AccelerationStructureBuffers;

/// Every instance is visible to every ray.
pub const INSTANCE_MASK: u8 = 0xff;

/// Resources the hit group of an instance reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceBindings {
    pub vertex_buffer: GpuAddress,
    pub index_buffer: GpuAddress,
    pub material: GpuAddress,
}

/// One mesh placed in the world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub blas: GpuAddress,
    pub transform: Mat4,
    pub instance_id: u32,
    /// Position of this instance's record in the hit-group table.
    pub hit_group_index: u32,
    pub bindings: InstanceBindings,
}

impl Instance {
    /// D3D12 wants the top three rows of a row-major matrix. glam is
    /// column-major, so the rows are read out rather than the columns.
    pub fn to_desc(&self) -> InstanceDesc {
        let m = self.transform;
        InstanceDesc {
            transform: [m.row(0).to_array(), m.row(1).to_array(), m.row(2).to_array()],
            instance_id_and_mask: pack_24_8(self.instance_id, INSTANCE_MASK),
            hit_group_index_and_flags: pack_24_8(self.hit_group_index, 0),
            acceleration_structure: self.blas,
        }
    }
}

/// One instance per mesh, in model order then mesh order. Instance `i` uses
/// hit-group record `i`.
pub fn collect_instances<A: Api>(scene: &Scene<A>) -> Vec<Instance> {
    let mut instances = Vec::with_capacity(scene.instance_count());
    for model in scene.models() {
        let transform = model.transform.model_matrix();
        for mesh in model.meshes() {
            let index = instances.len() as u32;
            instances.push(Instance {
                blas: mesh.blas().gpu_address(),
                transform,
                instance_id: index,
                hit_group_index: index,
                bindings: InstanceBindings {
                    vertex_buffer: mesh.geometry().vertex_address(),
                    index_buffer: mesh.geometry().index_address(),
                    material: mesh.material_address(),
                },
            });
        }
    }
    instances
}

pub struct TopLevelAs<A: Api> {
    instance_buffer: Option<UploadBuffer<A>>,
    buffers: AccelerationStructureBuffers<A>,
    instances: Vec<Instance>,
}

impl<A: Api> TopLevelAs<A> {
    pub fn build(ctx: &mut RenderContext<A>, instances: Vec<Instance>) -> Result<Self> {
        let descs: Vec<InstanceDesc> = instances.iter().map(Instance::to_desc).collect();
        let instance_buffer = if descs.is_empty() {
            None
        } else {
            Some(UploadBuffer::with_data(
                &ctx.device,
                "TLAS instances",
                bytemuck::cast_slice(&descs),
            )?)
        };

        let inputs = AccelerationStructureInputs::TopLevel {
            instance_descs: instance_buffer.as_ref().map_or(0, UploadBuffer::gpu_address),
            instance_count: descs.len() as u32,
            flags: BuildFlags::PREFER_FAST_TRACE,
        };
        let buffers = super::allocate_memory(&ctx.device, "TLAS", &inputs)?;
        super::build(ctx, inputs, &buffers)?;
        log::debug!(
            "Built TLAS with {} instances at {:#x}",
            instances.len(),
            buffers.result.gpu_address()
        );

        Ok(Self {
            instance_buffer,
            buffers,
            instances,
        })
    }

    /// Flush the queue, then replace every buffer with a fresh build.
    /// On failure the previous structure is kept.
    pub fn rebuild(&mut self, ctx: &mut RenderContext<A>, instances: Vec<Instance>) -> Result<()> {
        ctx.flush()?;
        *self = Self::build(ctx, instances)?;
        Ok(())
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.buffers.result.gpu_address()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance_buffer_address(&self) -> Option<GpuAddress> {
        self.instance_buffer.as_ref().map(UploadBuffer::gpu_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn instance(transform: Mat4) -> Instance {
        Instance {
            blas: 0x1000,
            transform,
            instance_id: 5,
            hit_group_index: 5,
            bindings: InstanceBindings {
                vertex_buffer: 0,
                index_buffer: 0,
                material: 0,
            },
        }
    }

    #[test]
    fn translation_lands_in_the_fourth_column() {
        let desc = instance(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0))).to_desc();
        assert_eq!(desc.transform[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(desc.transform[1], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(desc.transform[2], [0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn packed_transform_moves_points_like_the_matrix() {
        let matrix = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_rotation_y(0.7),
            Vec3::new(-4.0, 5.0, 0.5),
        );
        let desc = instance(matrix).to_desc();
        let point = Vec3::new(0.3, -1.2, 2.0);
        let expected = matrix.transform_point3(point);
        let packed: Vec<f32> = desc
            .transform
            .iter()
            .map(|row| row[0] * point.x + row[1] * point.y + row[2] * point.z + row[3])
            .collect();
        assert!((Vec3::from_slice(&packed) - expected).length() < 1e-5);
    }

    #[test]
    fn ids_and_mask_are_packed() {
        let desc = instance(Mat4::IDENTITY).to_desc();
        assert_eq!(desc.instance_id(), 5);
        assert_eq!(desc.hit_group_index(), 5);
        assert_eq!(desc.mask(), INSTANCE_MASK);
        assert_eq!(desc.acceleration_structure, 0x1000);
    }
}
