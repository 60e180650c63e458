//! Frame-level behavior of the renderer on the headless device.

use dxr_renderer::{
    geometry::{panel_geometry, Material, Transform},
    hal::{
        self,
        headless::{self, BuiltStructure},
        Surface as _, SHADER_RECORD_ALIGNMENT, SHADER_TABLE_ALIGNMENT,
    },
    stage::RayTraceSettings,
    Error, Renderer, RendererConfig, Scene, StageState,
};
use glam::Vec3;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> RendererConfig {
    RendererConfig {
        window_width: 1080,
        window_height: 720,
        max_recursion_depth: 16,
        payload_size: 20,
        attribute_size: 8,
        ..Default::default()
    }
}

fn renderer(config: &RendererConfig) -> Renderer<headless::Api> {
    init_logger();
    let ctx = headless::open(config).unwrap();
    Renderer::new(ctx, Scene::new(), config).unwrap()
}

fn add_panels(renderer: &mut Renderer<headless::Api>, name: &str, x: f32) -> usize {
    let (vertices, indices) = panel_geometry(4);
    renderer
        .add_model(
            name,
            vertices,
            &indices,
            Material::default(),
            Transform::from_position(Vec3::new(x, 0.0, 0.0)),
        )
        .unwrap()
}

/// Constants the last recorded dispatch reads.
fn uploaded_settings(renderer: &Renderer<headless::Api>) -> RayTraceSettings {
    let size = std::mem::size_of::<RayTraceSettings>() as u64;
    let bytes = renderer
        .context()
        .device
        .read_memory(renderer.stage().settings_address(), size)
        .unwrap();
    bytemuck::pod_read_unaligned(&bytes)
}

fn read_u64(renderer: &Renderer<headless::Api>, address: u64) -> u64 {
    let bytes = renderer.context().device.read_memory(address, 8).unwrap();
    u64::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn single_model_scene() {
    let config = config();
    let mut renderer = renderer(&config);
    add_panels(&mut renderer, "Panels", 0.0);
    renderer.update(1.0 / 60.0).unwrap();

    let mesh = &renderer.scene().models()[0].meshes()[0];
    assert_eq!(mesh.geometry().vertex_count(), 16);
    assert_eq!(mesh.geometry().index_count(), 24);
    let blas = mesh.blas().gpu_address();
    assert_ne!(blas, 0);
    assert_eq!(
        renderer.context().device.built_structure(blas),
        Some(BuiltStructure::BottomLevel {
            triangle_count: 8,
            vertex_count: 16
        })
    );

    let stage = renderer.stage();
    assert_eq!(stage.state(), StageState::Ready);
    assert_eq!(stage.tlas().instance_count(), 1);
    assert_eq!(stage.tlas().instances()[0].hit_group_index, 0);
    assert_eq!(stage.tlas().instances()[0].blas, blas);

    let pipeline = stage.pipeline().state_object();
    assert_eq!(pipeline.max_recursion_depth(), 16);
    assert_eq!(pipeline.max_payload_size(), 20);
    assert_eq!(pipeline.max_attribute_size(), 8);

    assert_eq!(stage.sbt().record_count(), 3);
    let dispatch = *stage.sbt().dispatch_desc();
    assert_eq!((dispatch.width, dispatch.height, dispatch.depth), (1080, 720, 1));

    renderer.render().unwrap();
    assert_eq!(renderer.context().device.dispatches(), vec![dispatch]);
    assert_eq!(renderer.context().surface.presented_frames(), 1);
}

#[test]
fn moving_geometry_resets_accumulation_for_one_frame() {
    let mut renderer = renderer(&config());
    add_panels(&mut renderer, "Panels", 0.0);

    renderer.frame(0.1).unwrap();
    renderer.frame(0.1).unwrap();
    renderer.frame(0.1).unwrap();
    assert_eq!(renderer.stage().settings().frame_count, 2);
    assert_eq!(renderer.stage().settings().clear_buffers, 0);
    let old_tlas = renderer.stage().tlas().gpu_address();

    assert!(renderer
        .scene_mut()
        .set_transform(0, Transform::from_position(Vec3::new(2.0, 0.0, 0.0))));
    renderer.frame(0.1).unwrap();
    let settings = *renderer.stage().settings();
    assert_eq!(settings.frame_count, 0);
    assert_eq!(settings.clear_buffers, 1);
    assert!(!renderer.scene().has_geometry_moved());
    assert_ne!(renderer.stage().tlas().gpu_address(), old_tlas);

    let translation = renderer.stage().tlas().instances()[0].to_desc().transform[0][3];
    assert_eq!(translation, 2.0);

    renderer.frame(0.1).unwrap();
    let settings = *renderer.stage().settings();
    assert_eq!(settings.frame_count, 1);
    assert_eq!(settings.clear_buffers, 0);
    assert!((settings.time - 0.5).abs() < 1e-5);
}

#[test]
fn first_frame_starts_a_fresh_accumulation() {
    let mut renderer = renderer(&config());
    renderer.frame(0.016).unwrap();
    let settings = uploaded_settings(&renderer);
    assert_eq!(settings.clear_buffers, 1);
    assert_eq!(settings.frame_count, 0);

    renderer.frame(0.016).unwrap();
    let settings = uploaded_settings(&renderer);
    assert_eq!(settings.clear_buffers, 0);
    assert_eq!(settings.frame_count, 1);
}

#[test]
fn hit_records_follow_instance_order() {
    let mut renderer = renderer(&config());
    for (i, name) in ["A", "B", "C"].iter().enumerate() {
        add_panels(&mut renderer, name, i as f32 * 3.0);
    }
    renderer.update(0.0).unwrap();

    let stage = renderer.stage();
    let sbt = stage.sbt();
    let layout = *sbt.layout();
    assert_eq!(layout.hit_count, 3);
    assert_eq!(stage.sbt_builder().hit_records().len(), 3);

    let built = match renderer
        .context()
        .device
        .built_structure(stage.tlas().gpu_address())
    {
        Some(BuiltStructure::TopLevel { instances }) => instances,
        other => panic!("unexpected structure {:?}", other),
    };
    assert_eq!(built.len(), 3);

    for (i, model) in renderer.scene().models().iter().enumerate() {
        let mesh = &model.meshes()[0];
        assert_eq!(built[i].hit_group_index(), i as u32);
        assert_eq!(built[i].instance_id(), i as u32);
        assert_eq!(built[i].acceleration_structure, mesh.blas().gpu_address());

        let record = sbt.gpu_address() + layout.hit_record_offset(i as u32);
        let inputs = record + hal::SHADER_IDENTIFIER_SIZE;
        assert_eq!(read_u64(&renderer, inputs), mesh.geometry().vertex_address());
        assert_eq!(read_u64(&renderer, inputs + 8), mesh.geometry().index_address());
        assert_eq!(read_u64(&renderer, inputs + 16), stage.tlas().gpu_address());
        assert_eq!(read_u64(&renderer, inputs + 24), mesh.material_address());
    }
}

#[test]
fn empty_scene_still_dispatches() {
    let mut renderer = renderer(&config());
    renderer.frame(0.016).unwrap();

    let stage = renderer.stage();
    assert_eq!(stage.tlas().instance_count(), 0);
    assert_eq!(stage.tlas().instance_buffer_address(), None);
    assert_eq!(stage.sbt().record_count(), 2);
    let dispatch = stage.sbt().dispatch_desc();
    assert_eq!(dispatch.hit_group.size, 0);
    assert_eq!(renderer.context().device.dispatches().len(), 1);
}

#[test]
fn tables_are_aligned() {
    let mut renderer = renderer(&config());
    add_panels(&mut renderer, "A", 0.0);
    add_panels(&mut renderer, "B", 3.0);
    renderer.update(0.0).unwrap();

    let sbt = renderer.stage().sbt();
    let layout = sbt.layout();
    assert_eq!(layout.record_size % SHADER_TABLE_ALIGNMENT, 0);
    assert_eq!(layout.table_size % SHADER_TABLE_ALIGNMENT, 0);

    let dispatch = sbt.dispatch_desc();
    assert_eq!(dispatch.ray_generation.start_address % SHADER_TABLE_ALIGNMENT, 0);
    for table in [dispatch.miss, dispatch.hit_group] {
        assert_eq!(table.start_address % SHADER_TABLE_ALIGNMENT, 0);
        assert_eq!(table.stride % SHADER_RECORD_ALIGNMENT, 0);
    }
}

#[test]
fn building_twice_gives_identical_tables() {
    let mut renderer = renderer(&config());
    add_panels(&mut renderer, "A", 0.0);
    renderer.update(0.0).unwrap();

    let stage = renderer.stage();
    let device = &renderer.context().device;
    let build = || {
        stage
            .sbt_builder()
            .build(device, stage.pipeline(), 1080, 720)
            .unwrap()
    };
    let first = build();
    let second = build();

    let size = first.layout().table_size;
    assert_eq!(first.layout(), second.layout());
    assert_eq!(
        device.read_memory(first.gpu_address(), size),
        device.read_memory(second.gpu_address(), size)
    );
    let relative = |desc: &hal::DispatchRaysDesc, base: u64| {
        (
            desc.miss.start_address - base,
            desc.hit_group.start_address - base,
            desc.hit_group.stride,
        )
    };
    assert_eq!(
        relative(first.dispatch_desc(), first.gpu_address()),
        relative(second.dispatch_desc(), second.gpu_address())
    );
}

#[test]
fn removing_a_model_shrinks_the_hit_table() {
    let mut renderer = renderer(&config());
    add_panels(&mut renderer, "A", 0.0);
    add_panels(&mut renderer, "B", 3.0);
    renderer.frame(0.0).unwrap();
    assert_eq!(renderer.stage().sbt().record_count(), 4);

    let removed = renderer.scene_mut().remove_model(0).unwrap();
    assert_eq!(removed.name, "A");
    assert_eq!(renderer.scene().instance_count(), 1);
    renderer.frame(0.0).unwrap();

    let stage = renderer.stage();
    assert_eq!(stage.tlas().instance_count(), 1);
    assert_eq!(stage.sbt().record_count(), 3);
    let vertex_buffer = renderer.scene().models()[0].meshes()[0]
        .geometry()
        .vertex_address();
    assert_eq!(stage.tlas().instances()[0].bindings.vertex_buffer, vertex_buffer);
}

#[test]
fn frames_are_presented_in_order() {
    let mut renderer = renderer(&config());
    add_panels(&mut renderer, "A", 0.0);
    for _ in 0..5 {
        renderer.frame(0.016).unwrap();
    }
    let ctx = renderer.context();
    assert_eq!(ctx.surface.presented_frames(), 5);
    assert_eq!(ctx.device.dispatches().len(), 5);
    assert!(ctx.commands.fence_value() >= 5);
}

#[test]
fn resize_updates_the_dispatch_grid() {
    let mut renderer = renderer(&config());
    add_panels(&mut renderer, "A", 0.0);
    renderer.frame(0.016).unwrap();

    renderer.frame(0.016).unwrap();
    assert_eq!(uploaded_settings(&renderer).clear_buffers, 0);

    renderer.resize(640, 480).unwrap();
    assert_eq!(renderer.context().surface.size(), (640, 480));
    assert_eq!(renderer.stage().size(), (640, 480));

    // Zero-sized client areas, e.g. a minimized window, are ignored.
    renderer.resize(0, 0).unwrap();
    assert_eq!(renderer.context().surface.size(), (640, 480));

    renderer.frame(0.016).unwrap();
    let last = *renderer.context().device.dispatches().last().unwrap();
    assert_eq!((last.width, last.height), (640, 480));
    let settings = uploaded_settings(&renderer);
    assert_eq!(settings.clear_buffers, 1);
    assert_eq!(settings.frame_count, 0);
    assert!(renderer
        .context()
        .device
        .is_live(renderer.stage().sbt().gpu_address()));
}

#[test]
fn broken_shader_directory_fails_to_start() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("RayGen.hlsl"), "").unwrap();
    std::fs::write(dir.path().join("Miss.hlsl"), "[shader(\"miss\")] void Miss() {}").unwrap();
    std::fs::write(
        dir.path().join("ClosestHit.hlsl"),
        "[shader(\"closesthit\")] void ClosestHit() {}",
    )
    .unwrap();
    let config = RendererConfig {
        shader_directory: Some(dir.path().to_path_buf()),
        ..config()
    };
    let ctx = headless::open(&config).unwrap();
    match Renderer::new(ctx, Scene::new(), &config) {
        Err(Error::ShaderCompilation { stage, .. }) => assert_eq!(stage, "ray-generation"),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("renderer started with an empty ray-generation library"),
    }
}
