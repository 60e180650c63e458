//! Ray-trace render stage: owns the TLAS, pipeline and shader binding table,
//! and records the dispatch plus the copy of its output into the back buffer.

use bytemuck::{Pod, Zeroable};

use crate::{
    accel::{collect_instances, TopLevelAs},
    config::RendererConfig,
    context::RenderContext,
    error::{Error, Result},
    hal::{
        self, Api, CommandList as _, DescriptorRange, DescriptorRangeKind, Device as _,
        ResourceState, RootParameter, Surface as _, TextureFormat,
    },
    pipeline::{
        RayTracingPipeline, RayTracingPipelineSettings, ShaderSources, HIT_GROUP_EXPORT,
        MISS_EXPORT, RAY_GEN_EXPORT,
    },
    sbt::{BindingValue, ShaderBindingTable, ShaderBindingTableBuilder},
    scene::Scene,
    upload::{constant_buffer_size, UploadBuffer},
};

/// Slots of the ray-generation descriptor table, relative to its base.
pub const OUTPUT_SLOT: u32 = 0;
pub const ACCUMULATION_SLOT: u32 = 1;
pub const SCENE_SLOT: u32 = 2;
pub const SETTINGS_SLOT: u32 = 3;
pub const TABLE_SLOTS: u32 = 4;

/// Per-frame constants read by the ray-generation shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RayTraceSettings {
    pub time: f32,
    pub frame_count: u32,
    /// Nonzero when accumulated color is stale and must be discarded.
    pub clear_buffers: u32,
    pub _padding: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Ready,
    /// A rebuild is in progress or failed; no dispatch is recorded until it
    /// completes.
    Rebuilding,
}

struct OutputTargets<A: Api> {
    output: A::Texture,
    accumulation: A::Texture,
}

impl<A: Api> OutputTargets<A> {
    fn new(ctx: &RenderContext<A>, width: u32, height: u32, table_base: u32) -> Result<Self> {
        let output = ctx.device.create_texture(&hal::TextureDescriptor {
            label: "ray-trace output",
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            initial_state: ResourceState::CopySource,
        })?;
        let accumulation = ctx.device.create_texture(&hal::TextureDescriptor {
            label: "accumulation buffer",
            width,
            height,
            format: TextureFormat::Rgba32Float,
            initial_state: ResourceState::UnorderedAccess,
        })?;
        ctx.device
            .create_texture_uav(&output, ctx.heap.cpu_handle_at(table_base + OUTPUT_SLOT));
        ctx.device.create_texture_uav(
            &accumulation,
            ctx.heap.cpu_handle_at(table_base + ACCUMULATION_SLOT),
        );
        Ok(Self {
            output,
            accumulation,
        })
    }
}

pub struct RayTraceStage<A: Api> {
    state: StageState,
    width: u32,
    height: u32,
    targets: OutputTargets<A>,
    table_base: u32,
    settings: RayTraceSettings,
    settings_buffer: UploadBuffer<A>,
    /// The next frame starts a new accumulation.
    pending_reset: bool,
    /// Target size of a resize that has not completed yet.
    pending_size: Option<(u32, u32)>,
    tlas: TopLevelAs<A>,
    pipeline: RayTracingPipeline<A>,
    sbt_builder: ShaderBindingTableBuilder,
    sbt: ShaderBindingTable<A>,
}

impl<A: Api> RayTraceStage<A> {
    /// Build output targets, the TLAS, the pipeline and the SBT, in that order.
    pub fn new(
        ctx: &mut RenderContext<A>,
        scene: &Scene<A>,
        config: &RendererConfig,
        sources: &ShaderSources,
    ) -> Result<Self> {
        let (width, height) = ctx.surface.size();
        let table_base = ctx.heap.allocate_range(TABLE_SLOTS)?;
        let targets = OutputTargets::new(ctx, width, height, table_base)?;

        let settings = RayTraceSettings::default();
        let settings_size = constant_buffer_size(std::mem::size_of::<RayTraceSettings>() as u64);
        let settings_buffer = UploadBuffer::new(&ctx.device, "ray-trace settings", settings_size)?;
        settings_buffer.update(&ctx.device, bytemuck::bytes_of(&settings))?;
        ctx.device.create_constant_buffer_view(
            settings_buffer.raw(),
            settings_size,
            ctx.heap.cpu_handle_at(table_base + SETTINGS_SLOT),
        );

        let tlas = TopLevelAs::build(ctx, collect_instances(scene))?;
        ctx.device.create_acceleration_structure_srv(
            tlas.gpu_address(),
            ctx.heap.cpu_handle_at(table_base + SCENE_SLOT),
        );

        let pipeline =
            RayTracingPipeline::build(&ctx.device, sources, Self::pipeline_settings(config))?;

        let mut sbt_builder = ShaderBindingTableBuilder::new();
        Self::fill_records(&mut sbt_builder, ctx, table_base, &tlas);
        let sbt = sbt_builder.build(&ctx.device, &pipeline, width, height)?;

        log::info!(
            "Ray-trace stage ready: {}x{}, {} instances",
            width,
            height,
            tlas.instance_count()
        );
        Ok(Self {
            state: StageState::Ready,
            width,
            height,
            targets,
            table_base,
            settings,
            settings_buffer,
            pending_reset: true,
            pending_size: None,
            tlas,
            pipeline,
            sbt_builder,
            sbt,
        })
    }

    /// Ray-gen reads the descriptor table; hit groups read vertex and index
    /// buffers, the scene and their material.
    pub fn pipeline_settings(config: &RendererConfig) -> RayTracingPipelineSettings {
        RayTracingPipelineSettings {
            ray_gen_parameters: vec![RootParameter::DescriptorTable(vec![
                DescriptorRange::new(DescriptorRangeKind::Uav, 1, 0),
                DescriptorRange::new(DescriptorRangeKind::Uav, 1, 1),
                DescriptorRange::new(DescriptorRangeKind::Srv, 1, 0),
                DescriptorRange::new(DescriptorRangeKind::Cbv, 1, 0),
            ])],
            miss_parameters: Vec::new(),
            hit_parameters: vec![
                RootParameter::srv(0),
                RootParameter::srv(1),
                RootParameter::srv(2),
                RootParameter::cbv(0),
            ],
            max_payload_size: config.payload_size,
            max_attribute_size: config.attribute_size,
            max_recursion_depth: config.max_recursion_depth,
        }
    }

    fn fill_records(
        builder: &mut ShaderBindingTableBuilder,
        ctx: &RenderContext<A>,
        table_base: u32,
        tlas: &TopLevelAs<A>,
    ) {
        builder.clear();
        builder.add_ray_generation_program(
            RAY_GEN_EXPORT,
            vec![BindingValue::DescriptorHandle(ctx.heap.gpu_handle_at(table_base))],
        );
        builder.add_miss_program(MISS_EXPORT, Vec::new());
        for instance in tlas.instances() {
            builder.add_hit_program(
                HIT_GROUP_EXPORT,
                vec![
                    BindingValue::GpuAddress(instance.bindings.vertex_buffer),
                    BindingValue::GpuAddress(instance.bindings.index_buffer),
                    BindingValue::GpuAddress(tlas.gpu_address()),
                    BindingValue::GpuAddress(instance.bindings.material),
                ],
            );
        }
    }

    /// Advance time and the frame counter, rebuilding first if the scene
    /// moved. A failed rebuild or resize leaves the stage `Rebuilding` and is
    /// retried on the next call.
    ///
    /// The first frame after construction, a resize or a rebuild is uploaded
    /// with `clear_buffers` set and `frame_count` zero.
    pub fn update(&mut self, ctx: &mut RenderContext<A>, scene: &mut Scene<A>, delta_time: f32) -> Result<()> {
        if scene.has_geometry_moved() || self.state == StageState::Rebuilding {
            self.state = StageState::Rebuilding;
            if let Some((width, height)) = self.pending_size {
                self.apply_size(ctx, width, height)?;
            }
            self.rebuild(ctx, scene)?;
            scene.clear_geometry_moved();
            self.state = StageState::Ready;
        }
        if std::mem::take(&mut self.pending_reset) {
            self.settings.frame_count = 0;
            self.settings.clear_buffers = 1;
        } else {
            self.settings.frame_count += 1;
            self.settings.clear_buffers = 0;
        }
        self.settings.time += delta_time;
        log::trace!(
            "Frame {} at t={:.4}, clear={}",
            self.settings.frame_count,
            self.settings.time,
            self.settings.clear_buffers
        );
        self.settings_buffer
            .update(&ctx.device, bytemuck::bytes_of(&self.settings))
    }

    /// Rebuild the TLAS from the scene and the SBT from the new instances as
    /// one step. Hit record `i` always describes TLAS instance `i`.
    pub fn rebuild(&mut self, ctx: &mut RenderContext<A>, scene: &Scene<A>) -> Result<()> {
        ctx.flush()?;
        self.tlas.rebuild(ctx, collect_instances(scene))?;
        ctx.device.create_acceleration_structure_srv(
            self.tlas.gpu_address(),
            ctx.heap.cpu_handle_at(self.table_base + SCENE_SLOT),
        );
        Self::fill_records(&mut self.sbt_builder, ctx, self.table_base, &self.tlas);
        self.sbt = self
            .sbt_builder
            .build(&ctx.device, &self.pipeline, self.width, self.height)?;
        self.pending_reset = true;
        log::debug!(
            "Rebuilt TLAS and SBT for {} instances",
            self.tlas.instance_count()
        );
        Ok(())
    }

    /// Recreate the output targets in their existing descriptor slots and
    /// re-derive the dispatch size. On failure the stage stays `Rebuilding`
    /// and the next `update` retries at the requested size.
    pub fn resize(&mut self, ctx: &mut RenderContext<A>, width: u32, height: u32) -> Result<()> {
        ctx.flush()?;
        self.state = StageState::Rebuilding;
        self.pending_size = Some((width, height));
        self.apply_size(ctx, width, height)?;
        self.state = StageState::Ready;
        log::info!("Ray-trace stage resized to {}x{}", width, height);
        Ok(())
    }

    /// Size, targets and SBT change together, only once all of them exist.
    fn apply_size(&mut self, ctx: &mut RenderContext<A>, width: u32, height: u32) -> Result<()> {
        let targets = OutputTargets::new(ctx, width, height, self.table_base)?;
        let sbt = self
            .sbt_builder
            .build(&ctx.device, &self.pipeline, width, height)?;
        self.targets = targets;
        self.sbt = sbt;
        self.width = width;
        self.height = height;
        self.pending_size = None;
        self.pending_reset = true;
        Ok(())
    }

    /// Append the dispatch and the copy into `back_buffer`, which must be in
    /// the render-target state, to an open command list.
    pub fn record_stage(
        &self,
        list: &mut A::CommandList,
        heap: &A::DescriptorHeap,
        back_buffer: &A::Texture,
    ) -> Result<()> {
        if self.state != StageState::Ready {
            return Err(Error::StageNotReady);
        }
        let output = &self.targets.output;

        list.set_descriptor_heap(heap);
        list.set_compute_root_signature(self.pipeline.global_root_signature());
        list.transition_texture(output, ResourceState::CopySource, ResourceState::UnorderedAccess);

        list.set_pipeline(self.pipeline.state_object());
        list.dispatch_rays(self.sbt.dispatch_desc());

        list.transition_texture(output, ResourceState::UnorderedAccess, ResourceState::CopySource);
        list.transition_texture(back_buffer, ResourceState::RenderTarget, ResourceState::CopyDest);
        list.copy_texture(back_buffer, output);
        list.transition_texture(back_buffer, ResourceState::CopyDest, ResourceState::RenderTarget);
        Ok(())
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn settings(&self) -> &RayTraceSettings {
        &self.settings
    }

    /// Where the constants of the last `update` live on the GPU.
    pub fn settings_address(&self) -> hal::GpuAddress {
        self.settings_buffer.gpu_address()
    }

    pub fn tlas(&self) -> &TopLevelAs<A> {
        &self.tlas
    }

    pub fn pipeline(&self) -> &RayTracingPipeline<A> {
        &self.pipeline
    }

    pub fn sbt(&self) -> &ShaderBindingTable<A> {
        &self.sbt
    }

    pub fn sbt_builder(&self) -> &ShaderBindingTableBuilder {
        &self.sbt_builder
    }

    pub fn table_base(&self) -> u32 {
        self.table_base
    }

    pub fn output(&self) -> &A::Texture {
        &self.targets.output
    }

    pub fn accumulation(&self) -> &A::Texture {
        &self.targets.accumulation
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{self, Command, DescriptorView};
    use crate::hal::Surface as _;

    fn stage() -> (RenderContext<headless::Api>, Scene<headless::Api>, RayTraceStage<headless::Api>) {
        let config = RendererConfig {
            window_width: 64,
            window_height: 32,
            ..Default::default()
        };
        let mut ctx = headless::open(&config).unwrap();
        let scene = Scene::new();
        let stage = RayTraceStage::new(&mut ctx, &scene, &config, &ShaderSources::builtin()).unwrap();
        (ctx, scene, stage)
    }

    #[test]
    fn settings_layout() {
        assert_eq!(std::mem::size_of::<RayTraceSettings>(), 16);
    }

    #[test]
    fn descriptor_table_is_contiguous() {
        let (ctx, _scene, stage) = stage();
        let base = stage.table_base();
        let heap = ctx.heap.raw();
        assert!(matches!(
            heap.view_at(base + OUTPUT_SLOT),
            Some(DescriptorView::TextureUav { width: 64, height: 32, .. })
        ));
        assert!(matches!(
            heap.view_at(base + ACCUMULATION_SLOT),
            Some(DescriptorView::TextureUav { .. })
        ));
        assert_eq!(
            heap.view_at(base + SCENE_SLOT),
            Some(DescriptorView::AccelerationStructure {
                location: stage.tlas().gpu_address()
            })
        );
        assert!(matches!(
            heap.view_at(base + SETTINGS_SLOT),
            Some(DescriptorView::ConstantBuffer { size: 256, .. })
        ));
    }

    #[test]
    fn record_stage_brackets_the_dispatch() {
        let (mut ctx, _scene, stage) = stage();
        let list = ctx.commands.reset_command_list().unwrap();
        let back_buffer = ctx.surface.back_buffer(0);
        stage.record_stage(list, ctx.heap.raw(), back_buffer).unwrap();

        let commands = list.commands();
        let dispatch = commands
            .iter()
            .position(|c| matches!(c, Command::DispatchRays(_)))
            .unwrap();
        assert_eq!(
            commands[dispatch - 2],
            Command::TransitionTexture {
                texture: "ray-trace output".to_string(),
                before: ResourceState::CopySource,
                after: ResourceState::UnorderedAccess,
            }
        );
        assert_eq!(
            commands[dispatch + 1],
            Command::TransitionTexture {
                texture: "ray-trace output".to_string(),
                before: ResourceState::UnorderedAccess,
                after: ResourceState::CopySource,
            }
        );
        assert_eq!(
            commands[dispatch + 3],
            Command::CopyTexture {
                dst: "Back Buffer 0".to_string(),
                src: "ray-trace output".to_string(),
            }
        );
        assert_eq!(commands.len(), dispatch + 5);
    }

    #[test]
    fn resize_updates_dispatch_and_resets_accumulation() {
        let (mut ctx, mut scene, mut stage) = stage();
        stage.update(&mut ctx, &mut scene, 0.1).unwrap();
        stage.update(&mut ctx, &mut scene, 0.1).unwrap();
        assert_eq!(stage.settings().frame_count, 1);

        stage.resize(&mut ctx, 128, 96).unwrap();
        let dispatch = stage.sbt().dispatch_desc();
        assert_eq!((dispatch.width, dispatch.height), (128, 96));
        assert!(matches!(
            ctx.heap.raw().view_at(stage.table_base() + OUTPUT_SLOT),
            Some(DescriptorView::TextureUav { width: 128, height: 96, .. })
        ));

        stage.update(&mut ctx, &mut scene, 0.1).unwrap();
        assert_eq!(stage.settings().frame_count, 0);
        assert_eq!(stage.settings().clear_buffers, 1);
        stage.update(&mut ctx, &mut scene, 0.1).unwrap();
        assert_eq!(stage.settings().frame_count, 1);
        assert_eq!(stage.settings().clear_buffers, 0);
    }

    #[test]
    fn first_update_clears_accumulation() {
        let (mut ctx, mut scene, mut stage) = stage();
        stage.update(&mut ctx, &mut scene, 0.1).unwrap();
        assert_eq!(stage.settings().frame_count, 0);
        assert_eq!(stage.settings().clear_buffers, 1);
    }

    #[test]
    fn failed_resize_is_retried_at_the_requested_size() {
        let (mut ctx, mut scene, mut stage) = stage();
        // Zero-sized textures cannot be created.
        assert!(stage.resize(&mut ctx, 0, 0).is_err());
        assert_eq!(stage.state(), StageState::Rebuilding);
        assert_eq!(stage.size(), (64, 32));

        // The retry does not come back with the old targets.
        assert!(stage.update(&mut ctx, &mut scene, 0.1).is_err());
        assert_eq!(stage.state(), StageState::Rebuilding);
        assert_eq!(stage.size(), (64, 32));

        stage.resize(&mut ctx, 128, 96).unwrap();
        stage.update(&mut ctx, &mut scene, 0.1).unwrap();
        assert_eq!(stage.state(), StageState::Ready);
        assert_eq!(stage.size(), (128, 96));
        let dispatch = stage.sbt().dispatch_desc();
        assert_eq!((dispatch.width, dispatch.height), (128, 96));
        assert!(matches!(
            ctx.heap.raw().view_at(stage.table_base() + OUTPUT_SLOT),
            Some(DescriptorView::TextureUav { width: 128, height: 96, .. })
        ));
        assert_eq!(stage.settings().clear_buffers, 1);
    }
}
