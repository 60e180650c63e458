use crate::{
    commands::{fence_timeout, Commands},
    config::RendererConfig,
    descriptor::DescriptorHeap,
    error::Result,
    hal::{Api, DescriptorHeapKind},
};

/// Process-lifetime GPU objects every component reads from.
///
/// Built once by a backend's `open` and passed by reference.
pub struct RenderContext<A: Api> {
    pub device: A::Device,
    pub commands: Commands<A>,
    /// Shader-visible CBV/SRV/UAV heap.
    pub heap: DescriptorHeap<A>,
    pub surface: A::Surface,
}

impl<A: Api> RenderContext<A> {
    pub fn new(
        device: A::Device,
        queue: A::Queue,
        surface: A::Surface,
        config: &RendererConfig,
    ) -> Result<Self> {
        let commands = Commands::new(&device, queue, fence_timeout(config.fence_timeout_ms))?;
        let heap = DescriptorHeap::new(
            &device,
            "CBV/SRV/UAV",
            DescriptorHeapKind::CbvSrvUav,
            config.descriptor_heap_capacity,
        )?;
        Ok(Self {
            device,
            commands,
            heap,
            surface,
        })
    }

    /// Block until all submitted work has retired.
    pub fn flush(&mut self) -> Result<()> {
        self.commands.flush()
    }
}
