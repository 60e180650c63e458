use crate::{
    config::RendererConfig,
    context::RenderContext,
    error::{Error, Result},
    geometry::{Material, Model, Transform, Vertex},
    hal::{Api, CommandList as _, ResourceState, Surface as _},
    pipeline::ShaderSources,
    scene::Scene,
    stage::{RayTraceStage, StageState},
};

/// Owns the context, the scene and the ray-trace stage, and runs frames.
pub struct Renderer<A: Api> {
    ctx: RenderContext<A>,
    scene: Scene<A>,
    stage: RayTraceStage<A>,
}

impl<A: Api> Renderer<A> {
    pub fn new(mut ctx: RenderContext<A>, mut scene: Scene<A>, config: &RendererConfig) -> Result<Self> {
        let sources = ShaderSources::from_config(config)?;
        let stage = RayTraceStage::new(&mut ctx, &scene, config, &sources)?;
        // the initial build already reflects every model added so far
        scene.clear_geometry_moved();
        Ok(Self { ctx, scene, stage })
    }

    /// Upload a single-mesh model and add it to the scene. The stage picks
    /// it up on the next update.
    pub fn add_model(
        &mut self,
        name: &str,
        vertices: Vec<Vertex>,
        indices: &[u32],
        material: Material,
        transform: Transform,
    ) -> Result<usize> {
        let mut model = Model::from_geometry(&mut self.ctx, name, vertices, indices, material)?;
        model.transform = transform;
        Ok(self.scene.add_model(model))
    }

    pub fn update(&mut self, delta_time: f32) -> Result<()> {
        self.stage.update(&mut self.ctx, &mut self.scene, delta_time)
    }

    /// Record, submit and present one frame, then wait for it.
    pub fn render(&mut self) -> Result<()> {
        if self.stage.state() != StageState::Ready {
            return Err(Error::StageNotReady);
        }
        let ctx = &mut self.ctx;
        let index = ctx.surface.current_back_buffer_index();

        let list = ctx.commands.reset_command_list()?;
        let back_buffer = ctx.surface.back_buffer(index);
        list.transition_texture(back_buffer, ResourceState::Present, ResourceState::RenderTarget);
        self.stage.record_stage(list, ctx.heap.raw(), back_buffer)?;
        list.transition_texture(back_buffer, ResourceState::RenderTarget, ResourceState::Present);

        ctx.commands.execute_command_list()?;
        ctx.surface.present()?;
        let value = ctx.commands.signal()?;
        ctx.commands.wait_for_fence_value(value)
    }

    /// `update` followed by `render`. A frame the stage is not ready for is
    /// skipped.
    pub fn frame(&mut self, delta_time: f32) -> Result<()> {
        self.update(delta_time)?;
        match self.render() {
            Err(err) if err.is_recoverable() => {
                log::warn!("Skipping frame: {}", err);
                Ok(())
            }
            other => other,
        }
    }

    /// Resize the swap chain and the stage's output targets. A zero-sized
    /// client area is ignored.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 || (width, height) == self.ctx.surface.size() {
            return Ok(());
        }
        self.ctx.flush()?;
        self.ctx.surface.resize(&self.ctx.device, width, height)?;
        self.stage.resize(&mut self.ctx, width, height)
    }

    /// Drain the queue before the renderer is dropped.
    pub fn shutdown(&mut self) -> Result<()> {
        self.ctx.flush()
    }

    pub fn context(&self) -> &RenderContext<A> {
        &self.ctx
    }

    pub fn scene(&self) -> &Scene<A> {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene<A> {
        &mut self.scene
    }

    pub fn stage(&self) -> &RayTraceStage<A> {
        &self.stage
    }
}
