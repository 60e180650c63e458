//! Vertex data, GPU-resident geometry, meshes and models.

use bytemuck::{Pod, Zeroable};
use glam::{EulerRot, Mat4, Quat, Vec2, Vec3};
use memoffset::offset_of;

use crate::{
    accel::BottomLevelAs,
    context::RenderContext,
    error::{Error, Result},
    hal::{
        self, Api, Buffer as _, BufferUses, CommandList as _, Device as _, GeometryFlags,
        GpuAddress, IndexFormat, MemoryLocation, ResourceState, TriangleGeometry, VertexFormat,
    },
    upload::UploadBuffer,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, tex_coord: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            tangent: [0.0; 3],
            tex_coord: tex_coord.to_array(),
        }
    }
}

/// Per-mesh surface description, bound as a constant buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub color: [f32; 3],
    pub specularity: f32,
    pub is_emissive: u32,
    pub is_dielectric: u32,
    pub _padding: [u32; 2],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            color: [1.0; 3],
            specularity: 0.0,
            is_emissive: 0,
            is_dielectric: 0,
            _padding: [0; 2],
        }
    }
}

/// Fill in tangents from UV gradients, unless the data already has them.
///
/// Each vertex gets the normalized sum of the tangents of the triangles that
/// use it. Triangles with degenerate UVs contribute nothing.
pub fn generate_tangents(vertices: &mut [Vertex], indices: &[u32]) {
    match vertices.first() {
        Some(first) if Vec3::from(first.tangent) == Vec3::ZERO => {}
        _ => return,
    }

    let mut tangents = vec![Vec3::ZERO; vertices.len()];
    for triangle in indices.chunks_exact(3) {
        let [i0, i1, i2] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        if i0 >= vertices.len() || i1 >= vertices.len() || i2 >= vertices.len() {
            continue;
        }
        let (v0, v1, v2) = (&vertices[i0], &vertices[i1], &vertices[i2]);

        let edge1 = Vec3::from(v1.position) - Vec3::from(v0.position);
        let edge2 = Vec3::from(v2.position) - Vec3::from(v0.position);
        let delta_uv1 = Vec2::from(v1.tex_coord) - Vec2::from(v0.tex_coord);
        let delta_uv2 = Vec2::from(v2.tex_coord) - Vec2::from(v0.tex_coord);

        let det = delta_uv1.x * delta_uv2.y - delta_uv2.x * delta_uv1.y;
        if det.abs() <= f32::EPSILON {
            continue;
        }
        let tangent = (edge1 * delta_uv2.y - edge2 * delta_uv1.y) / det;
        for i in [i0, i1, i2] {
            tangents[i] += tangent;
        }
    }

    for (vertex, tangent) in vertices.iter_mut().zip(tangents) {
        vertex.tangent = tangent.normalize_or_zero().to_array();
    }
}

/// Vertex and index buffers in default memory. The CPU copies are gone once
/// the upload completes.
pub struct GeometryBuffer<A: Api> {
    vertex_buffer: A::Buffer,
    index_buffer: A::Buffer,
    vertex_count: u32,
    index_count: u32,
}

impl<A: Api> GeometryBuffer<A> {
    pub fn upload(
        ctx: &mut RenderContext<A>,
        label: &str,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<Self> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(Error::EmptyGeometry(label.to_string()));
        }
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let vertex_buffer = default_buffer::<A>(&ctx.device, &format!("{} vertices", label), vertex_bytes.len())?;
        let index_buffer = default_buffer::<A>(&ctx.device, &format!("{} indices", label), index_bytes.len())?;
        let vertex_upload = UploadBuffer::<A>::with_data(&ctx.device, "intermediate vertices", vertex_bytes)?;
        let index_upload = UploadBuffer::<A>::with_data(&ctx.device, "intermediate indices", index_bytes)?;

        let list = ctx.commands.reset_command_list()?;
        list.copy_buffer(&vertex_buffer, vertex_upload.raw(), vertex_bytes.len() as u64);
        list.copy_buffer(&index_buffer, index_upload.raw(), index_bytes.len() as u64);
        for buffer in [&vertex_buffer, &index_buffer] {
            list.transition_buffer(
                buffer,
                ResourceState::CopyDest,
                ResourceState::NonPixelShaderResource,
            );
        }
        ctx.commands.submit_and_wait()?;

        log::debug!(
            "Uploaded `{}`: {} vertices, {} indices",
            label,
            vertices.len(),
            indices.len()
        );
        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    /// Opaque triangle-list description for acceleration-structure builds.
    pub fn triangles(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_buffer: self.vertex_buffer.gpu_address() + offset_of!(Vertex, position) as u64,
            vertex_stride: std::mem::size_of::<Vertex>() as u64,
            vertex_count: self.vertex_count,
            vertex_format: VertexFormat::Float32x3,
            index_buffer: self.index_buffer.gpu_address(),
            index_count: self.index_count,
            index_format: IndexFormat::Uint32,
            flags: GeometryFlags::OPAQUE,
        }
    }

    pub fn vertex_address(&self) -> GpuAddress {
        self.vertex_buffer.gpu_address()
    }

    pub fn index_address(&self) -> GpuAddress {
        self.index_buffer.gpu_address()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

fn default_buffer<A: Api>(device: &A::Device, label: &str, size: usize) -> Result<A::Buffer> {
    device.create_buffer(&hal::BufferDescriptor {
        label,
        size: size as u64,
        location: MemoryLocation::GpuOnly,
        usage: BufferUses::empty(),
        initial_state: ResourceState::CopyDest,
    })
}

pub struct Mesh<A: Api> {
    pub name: String,
    geometry: GeometryBuffer<A>,
    material: Material,
    material_buffer: UploadBuffer<A>,
    blas: BottomLevelAs<A>,
}

impl<A: Api> Mesh<A> {
    /// Upload geometry, build its BLAS and create the material constant buffer.
    pub fn new(
        ctx: &mut RenderContext<A>,
        name: &str,
        mut vertices: Vec<Vertex>,
        indices: &[u32],
        material: Material,
    ) -> Result<Self> {
        generate_tangents(&mut vertices, indices);
        let geometry = GeometryBuffer::upload(ctx, name, &vertices, indices)?;
        let blas = BottomLevelAs::build(ctx, name, &geometry)?;
        let material_buffer = UploadBuffer::with_constant_buffer_view(
            &ctx.device,
            &mut ctx.heap,
            &format!("{} material", name),
            &material,
        )?;
        Ok(Self {
            name: name.to_string(),
            geometry,
            material,
            material_buffer,
            blas,
        })
    }

    pub fn geometry(&self) -> &GeometryBuffer<A> {
        &self.geometry
    }

    pub fn blas(&self) -> &BottomLevelAs<A> {
        &self.blas
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn material_address(&self) -> GpuAddress {
        self.material_buffer.gpu_address()
    }

    pub fn update_material(&mut self, device: &A::Device, material: Material) -> Result<()> {
        self.material = material;
        self.material_buffer.update(device, bytemuck::bytes_of(&self.material))
    }
}

/// Position, euler rotation in degrees, and scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn model_matrix(&self) -> Mat4 {
        let rotation = Quat::from_euler(
            EulerRot::XYZ,
            self.rotation.x.to_radians(),
            self.rotation.y.to_radians(),
            self.rotation.z.to_radians(),
        );
        Mat4::from_scale_rotation_translation(self.scale, rotation, self.position)
    }
}

pub struct Model<A: Api> {
    pub name: String,
    pub transform: Transform,
    meshes: Vec<Mesh<A>>,
}

impl<A: Api> Model<A> {
    pub fn new(name: &str, transform: Transform, meshes: Vec<Mesh<A>>) -> Self {
        Self {
            name: name.to_string(),
            transform,
            meshes,
        }
    }

    /// Single-mesh model from raw vertex and index arrays.
    pub fn from_geometry(
        ctx: &mut RenderContext<A>,
        name: &str,
        vertices: Vec<Vertex>,
        indices: &[u32],
        material: Material,
    ) -> Result<Self> {
        let mesh = Mesh::new(ctx, name, vertices, indices, material)?;
        Ok(Self::new(name, Transform::default(), vec![mesh]))
    }

    pub fn meshes(&self) -> &[Mesh<A>] {
        &self.meshes
    }

    pub fn meshes_mut(&mut self) -> &mut [Mesh<A>] {
        &mut self.meshes
    }
}

/// Axis-aligned quads stacked along +Z, four vertices and six indices each.
pub fn panel_geometry(panels: u32) -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::with_capacity(4 * panels as usize);
    let mut indices = Vec::with_capacity(6 * panels as usize);
    let corners = [
        (Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, 1.0)),
        (Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, 1.0)),
        (Vec3::new(1.0, 1.0, 0.0), Vec2::new(1.0, 0.0)),
        (Vec3::new(-1.0, 1.0, 0.0), Vec2::new(0.0, 0.0)),
    ];
    for panel in 0..panels {
        let base = vertices.len() as u32;
        let offset = Vec3::new(0.0, 0.0, panel as f32);
        vertices.extend(
            corners
                .iter()
                .map(|&(position, uv)| Vertex::new(position + offset, Vec3::NEG_Z, uv)),
        );
        indices.extend([0, 1, 2, 0, 2, 3].map(|i| base + i));
    }
    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RendererConfig, hal::headless};

    #[test]
    fn vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 44);
        assert_eq!(offset_of!(Vertex, position), 0);
        assert_eq!(offset_of!(Vertex, tex_coord), 36);
        assert_eq!(std::mem::size_of::<Material>() % 16, 0);
    }

    #[test]
    fn panels_have_expected_counts() {
        let (vertices, indices) = panel_geometry(4);
        assert_eq!(vertices.len(), 16);
        assert_eq!(indices.len(), 24);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }

    #[test]
    fn tangents_follow_u_direction() {
        let (mut vertices, indices) = panel_geometry(1);
        generate_tangents(&mut vertices, &indices);
        for vertex in &vertices {
            let tangent = Vec3::from(vertex.tangent);
            assert!((tangent - Vec3::X).length() < 1e-5, "{:?}", tangent);
        }
    }

    #[test]
    fn existing_tangents_are_kept() {
        let (mut vertices, indices) = panel_geometry(1);
        vertices[0].tangent = [0.0, 1.0, 0.0];
        generate_tangents(&mut vertices, &indices);
        assert_eq!(vertices[0].tangent, [0.0, 1.0, 0.0]);
        assert_eq!(vertices[1].tangent, [0.0; 3]);
    }

    #[test]
    fn transform_applies_scale_rotation_translation() {
        let transform = Transform {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Vec3::new(0.0, 0.0, 90.0),
            scale: Vec3::splat(2.0),
        };
        let moved = transform.model_matrix().transform_point3(Vec3::X);
        assert!((moved - Vec3::new(1.0, 4.0, 3.0)).length() < 1e-5, "{:?}", moved);
    }

    #[test]
    fn upload_copies_into_default_memory() {
        let mut ctx = headless::open(&RendererConfig::default()).unwrap();
        let (vertices, indices) = panel_geometry(1);
        let geometry = GeometryBuffer::upload(&mut ctx, "quad", &vertices, &indices).unwrap();

        let bytes = ctx
            .device
            .read_memory(geometry.index_address(), 24)
            .unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&indices));
        assert_eq!(geometry.triangles().triangle_count(), 2);
    }

    #[test]
    fn update_material_rewrites_the_constant_buffer() {
        let mut ctx = headless::open(&RendererConfig::default()).unwrap();
        let (vertices, indices) = panel_geometry(1);
        let mut mesh = Mesh::new(&mut ctx, "quad", vertices, &indices, Material::default()).unwrap();
        let size = std::mem::size_of::<Material>() as u64;
        let read = |ctx: &RenderContext<headless::Api>, mesh: &Mesh<headless::Api>| {
            let bytes = ctx.device.read_memory(mesh.material_address(), size).unwrap();
            bytemuck::pod_read_unaligned::<Material>(&bytes)
        };
        assert_eq!(read(&ctx, &mesh), Material::default());

        let glowing = Material {
            color: [4.0, 3.0, 2.0],
            is_emissive: 1,
            ..Default::default()
        };
        mesh.update_material(&ctx.device, glowing).unwrap();
        assert_eq!(*mesh.material(), glowing);
        assert_eq!(read(&ctx, &mesh), glowing);
    }

    #[test]
    fn empty_geometry_is_rejected() {
        let mut ctx = headless::open(&RendererConfig::default()).unwrap();
        let err = GeometryBuffer::upload(&mut ctx, "nothing", &[], &[]).err().unwrap();
        assert!(matches!(err, Error::EmptyGeometry(_)));
    }
}
