//! Ray-tracing pipeline state object.
//!
//! A state object is a flat list of subobjects in which associations refer
//! to earlier entries by position. `StateObjectBuilder` hands out a
//! `SubobjectHandle` for each entry and checks associations as they are
//! added, so a malformed list is rejected before it reaches the driver.

use std::{fs, path::Path};

use crate::{
    config::RendererConfig,
    error::{Error, Result},
    hal::{
        self, Api, Device as _, HitGroupKind, Pipeline as _, RootParameter, RootSignatureKind,
        ShaderIdentifier, Subobject, SubobjectHandle, MAX_ATTRIBUTE_SIZE,
        MAX_TRACE_RECURSION_DEPTH,
    },
};

pub const RAY_GEN_EXPORT: &str = "RayGen";
pub const MISS_EXPORT: &str = "Miss";
pub const CLOSEST_HIT_EXPORT: &str = "ClosestHit";
pub const HIT_GROUP_EXPORT: &str = "HitGroup";

const LIBRARY_TARGET: &str = "lib_6_3";

/// HLSL source of the three programs.
#[derive(Clone, Debug)]
pub struct ShaderSources {
    pub ray_gen: String,
    pub miss: String,
    pub closest_hit: String,
}

impl ShaderSources {
    /// Sources compiled into the binary.
    pub fn builtin() -> Self {
        let common = include_str!("../shaders/Common.hlsli");
        Self {
            ray_gen: expand_common(include_str!("../shaders/RayGen.hlsl"), Some(common)),
            miss: expand_common(include_str!("../shaders/Miss.hlsl"), Some(common)),
            closest_hit: expand_common(include_str!("../shaders/ClosestHit.hlsl"), Some(common)),
        }
    }

    /// `RayGen.hlsl`, `Miss.hlsl` and `ClosestHit.hlsl` from `dir`, with
    /// `Common.hlsli` spliced in where they include it.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            fs::read_to_string(&path).map_err(|source| Error::ReadFile { path, source })
        };
        let common_path = dir.join(COMMON_INCLUDE);
        let common = if common_path.exists() {
            Some(read(COMMON_INCLUDE)?)
        } else {
            None
        };
        let common = common.as_deref();
        Ok(Self {
            ray_gen: expand_common(&read("RayGen.hlsl")?, common),
            miss: expand_common(&read("Miss.hlsl")?, common),
            closest_hit: expand_common(&read("ClosestHit.hlsl")?, common),
        })
    }

    pub fn from_config(config: &RendererConfig) -> Result<Self> {
        match config.shader_directory {
            Some(ref dir) => Self::load(dir),
            None => Ok(Self::builtin()),
        }
    }
}

const COMMON_INCLUDE: &str = "Common.hlsli";

/// Libraries are compiled from memory without an include handler, so the
/// shared header is inlined up front.
fn expand_common(source: &str, common: Option<&str>) -> String {
    let common = match common {
        Some(common) => common,
        None => return source.to_string(),
    };
    source
        .lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with("#include") && trimmed.contains(COMMON_INCLUDE) {
                common
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Per-stage root parameters and the shader/pipeline config values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RayTracingPipelineSettings {
    pub ray_gen_parameters: Vec<RootParameter>,
    pub miss_parameters: Vec<RootParameter>,
    pub hit_parameters: Vec<RootParameter>,
    /// Bytes.
    pub max_payload_size: u32,
    /// Bytes.
    pub max_attribute_size: u32,
    /// Must cover the deepest `TraceRay` chain in the shaders.
    pub max_recursion_depth: u32,
}

impl Default for RayTracingPipelineSettings {
    fn default() -> Self {
        Self {
            ray_gen_parameters: Vec::new(),
            miss_parameters: Vec::new(),
            hit_parameters: Vec::new(),
            max_payload_size: 16,
            max_attribute_size: 8,
            max_recursion_depth: 1,
        }
    }
}

impl RayTracingPipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_recursion_depth == 0 || self.max_recursion_depth > MAX_TRACE_RECURSION_DEPTH {
            return Err(Error::InvalidPipelineSettings(format!(
                "max recursion depth {} outside 1..={}",
                self.max_recursion_depth, MAX_TRACE_RECURSION_DEPTH
            )));
        }
        if self.max_payload_size == 0 {
            return Err(Error::InvalidPipelineSettings(
                "max payload size must be nonzero".to_string(),
            ));
        }
        if self.max_attribute_size == 0 || self.max_attribute_size > MAX_ATTRIBUTE_SIZE {
            return Err(Error::InvalidPipelineSettings(format!(
                "max attribute size {} outside 1..={}",
                self.max_attribute_size, MAX_ATTRIBUTE_SIZE
            )));
        }
        Ok(())
    }

    /// Number of 8-byte record inputs a stage's parameters occupy.
    pub fn input_count(parameters: &[RootParameter]) -> usize {
        parameters
            .iter()
            .map(|parameter| match *parameter {
                RootParameter::Constants { count, .. } => (count as usize + 1) / 2,
                _ => 1,
            })
            .sum()
    }
}

pub struct StateObjectBuilder<'a, A: Api> {
    subobjects: Vec<Subobject<'a, A>>,
}

impl<'a, A: Api> Default for StateObjectBuilder<'a, A> {
    fn default() -> Self {
        Self {
            subobjects: Vec::new(),
        }
    }
}

impl<'a, A: Api> StateObjectBuilder<'a, A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subobject: Subobject<'a, A>) -> SubobjectHandle {
        self.subobjects.push(subobject);
        SubobjectHandle(self.subobjects.len() - 1)
    }

    /// Associate `exports` with an earlier shader-config or
    /// local-root-signature subobject.
    pub fn associate(&mut self, target: SubobjectHandle, exports: &[&str]) -> Result<SubobjectHandle> {
        let reason = match self.subobjects.get(target.0) {
            None => Some("no such subobject"),
            Some(Subobject::ShaderConfig { .. }) | Some(Subobject::LocalRootSignature(_)) => None,
            Some(_) => Some("only shader configs and local root signatures can be associated"),
        };
        if let Some(reason) = reason {
            return Err(Error::InvalidAssociation {
                handle: target.0,
                reason,
            });
        }
        if exports.is_empty() {
            return Err(Error::InvalidAssociation {
                handle: target.0,
                reason: "association without exports",
            });
        }
        Ok(self.add(Subobject::ExportsAssociation {
            subobject: target,
            exports: exports.iter().map(|export| export.to_string()).collect(),
        }))
    }

    pub fn subobjects(&self) -> &[Subobject<'a, A>] {
        &self.subobjects
    }

    pub fn build(self, device: &A::Device, label: &'a str) -> Result<A::Pipeline> {
        log::debug!(
            "Creating state object `{}` from {} subobjects: {}",
            label,
            self.subobjects.len(),
            self.subobjects
                .iter()
                .map(Subobject::kind_name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        device.create_pipeline(&hal::StateObjectDescriptor {
            label,
            subobjects: self.subobjects,
        })
    }
}

/// Compiled state object plus everything it was created from.
pub struct RayTracingPipeline<A: Api> {
    state_object: A::Pipeline,
    global_root_signature: A::RootSignature,
    _local_root_signatures: Vec<A::RootSignature>,
    _libraries: Vec<A::ShaderLibrary>,
    settings: RayTracingPipelineSettings,
}

impl<A: Api> RayTracingPipeline<A> {
    pub fn build(
        device: &A::Device,
        sources: &ShaderSources,
        settings: RayTracingPipelineSettings,
    ) -> Result<Self> {
        settings.validate()?;

        let compile = |label: &str, source_name: &str, source: &str, export: &str| {
            device.compile_shader_library(&hal::ShaderLibraryDescriptor {
                label,
                source_name,
                source,
                export,
                target_profile: LIBRARY_TARGET,
            })
        };
        let ray_gen = compile("ray-generation", "RayGen.hlsl", &sources.ray_gen, RAY_GEN_EXPORT)?;
        let miss = compile("miss", "Miss.hlsl", &sources.miss, MISS_EXPORT)?;
        let closest_hit = compile(
            "closest-hit",
            "ClosestHit.hlsl",
            &sources.closest_hit,
            CLOSEST_HIT_EXPORT,
        )?;

        let root_signature = |label: &str, kind: RootSignatureKind, parameters: &[RootParameter]| {
            device.create_root_signature(&hal::RootSignatureDescriptor {
                label,
                kind,
                parameters,
            })
        };
        let ray_gen_rs = root_signature("ray-generation", RootSignatureKind::Local, &settings.ray_gen_parameters)?;
        let miss_rs = root_signature("miss", RootSignatureKind::Local, &settings.miss_parameters)?;
        let hit_rs = root_signature("hit", RootSignatureKind::Local, &settings.hit_parameters)?;
        let dummy_global = root_signature("dummy global", RootSignatureKind::Global, &[])?;
        let dummy_local = root_signature("dummy local", RootSignatureKind::Local, &[])?;

        let state_object = {
            let mut builder = StateObjectBuilder::<A>::new();
            for (library, export) in [
                (&ray_gen, RAY_GEN_EXPORT),
                (&miss, MISS_EXPORT),
                (&closest_hit, CLOSEST_HIT_EXPORT),
            ] {
                builder.add(Subobject::DxilLibrary {
                    library,
                    exports: vec![export.to_string()],
                });
            }
            builder.add(Subobject::HitGroup {
                export: HIT_GROUP_EXPORT.to_string(),
                kind: HitGroupKind::Triangles,
                closest_hit: Some(CLOSEST_HIT_EXPORT.to_string()),
                any_hit: None,
                intersection: None,
            });

            let shader_config = builder.add(Subobject::ShaderConfig {
                max_payload_size: settings.max_payload_size,
                max_attribute_size: settings.max_attribute_size,
            });
            builder.associate(shader_config, &[RAY_GEN_EXPORT, MISS_EXPORT, HIT_GROUP_EXPORT])?;

            for (root_signature, export) in [
                (&ray_gen_rs, RAY_GEN_EXPORT),
                (&miss_rs, MISS_EXPORT),
                (&hit_rs, HIT_GROUP_EXPORT),
            ] {
                let handle = builder.add(Subobject::LocalRootSignature(root_signature));
                builder.associate(handle, &[export])?;
            }

            builder.add(Subobject::GlobalRootSignature(&dummy_global));
            builder.add(Subobject::LocalRootSignature(&dummy_local));
            builder.add(Subobject::PipelineConfig {
                max_trace_recursion_depth: settings.max_recursion_depth,
            });
            builder.build(device, "ray-tracing pipeline")?
        };

        log::info!(
            "Created ray-tracing pipeline (payload {} B, attributes {} B, recursion {})",
            settings.max_payload_size,
            settings.max_attribute_size,
            settings.max_recursion_depth
        );
        Ok(Self {
            state_object,
            global_root_signature: dummy_global,
            _local_root_signatures: vec![ray_gen_rs, miss_rs, hit_rs, dummy_local],
            _libraries: vec![ray_gen, miss, closest_hit],
            settings,
        })
    }

    pub fn shader_identifier(&self, export: &str) -> Result<ShaderIdentifier> {
        self.state_object
            .shader_identifier(export)
            .ok_or_else(|| Error::MissingShaderIdentifier(export.to_string()))
    }

    pub fn state_object(&self) -> &A::Pipeline {
        &self.state_object
    }

    pub fn global_root_signature(&self) -> &A::RootSignature {
        &self.global_root_signature
    }

    pub fn settings(&self) -> &RayTracingPipelineSettings {
        &self.settings
    }

    /// Inputs a shader record for `export` carries, `None` for exports with
    /// no local root signature of their own.
    pub fn record_input_count(&self, export: &str) -> Option<usize> {
        let parameters = match export {
            RAY_GEN_EXPORT => &self.settings.ray_gen_parameters,
            MISS_EXPORT => &self.settings.miss_parameters,
            HIT_GROUP_EXPORT => &self.settings.hit_parameters,
            _ => return None,
        };
        Some(RayTracingPipelineSettings::input_count(parameters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{headless, DescriptorRange, DescriptorRangeKind};

    fn settings() -> RayTracingPipelineSettings {
        RayTracingPipelineSettings {
            ray_gen_parameters: vec![RootParameter::DescriptorTable(vec![
                DescriptorRange::new(DescriptorRangeKind::Uav, 2, 0),
                DescriptorRange::new(DescriptorRangeKind::Srv, 1, 0),
                DescriptorRange::new(DescriptorRangeKind::Cbv, 1, 0),
            ])],
            hit_parameters: vec![RootParameter::srv(0), RootParameter::srv(1), RootParameter::cbv(0)],
            max_payload_size: 20,
            max_recursion_depth: 16,
            ..Default::default()
        }
    }

    #[test]
    fn settings_are_validated() {
        assert!(settings().validate().is_ok());
        for bad in [
            RayTracingPipelineSettings {
                max_recursion_depth: 0,
                ..settings()
            },
            RayTracingPipelineSettings {
                max_recursion_depth: 32,
                ..settings()
            },
            RayTracingPipelineSettings {
                max_payload_size: 0,
                ..settings()
            },
            RayTracingPipelineSettings {
                max_attribute_size: 33,
                ..settings()
            },
        ] {
            assert!(matches!(bad.validate(), Err(Error::InvalidPipelineSettings(_))));
        }
    }

    #[test]
    fn constants_pack_two_per_input() {
        let parameters = [
            RootParameter::cbv(0),
            RootParameter::Constants {
                register: 1,
                space: 0,
                count: 3,
            },
        ];
        assert_eq!(RayTracingPipelineSettings::input_count(&parameters), 3);
    }

    #[test]
    fn associations_must_point_at_configs_or_local_signatures() {
        let mut builder = StateObjectBuilder::<headless::Api>::new();
        let pipeline_config = builder.add(Subobject::PipelineConfig {
            max_trace_recursion_depth: 1,
        });
        let err = builder.associate(pipeline_config, &["RayGen"]).unwrap_err();
        assert!(matches!(err, Error::InvalidAssociation { handle: 0, .. }));

        let err = builder.associate(SubobjectHandle(7), &["RayGen"]).unwrap_err();
        assert!(matches!(err, Error::InvalidAssociation { handle: 7, .. }));

        let config = builder.add(Subobject::ShaderConfig {
            max_payload_size: 4,
            max_attribute_size: 8,
        });
        assert_eq!(builder.associate(config, &["RayGen"]).unwrap(), SubobjectHandle(2));
        assert_eq!(builder.subobjects().len(), 3);
    }

    #[test]
    fn builds_and_exports_identifiers() {
        let device = headless::Device::new();
        let pipeline =
            RayTracingPipeline::<headless::Api>::build(&device, &ShaderSources::builtin(), settings())
                .unwrap();

        let ray_gen = pipeline.shader_identifier(RAY_GEN_EXPORT).unwrap();
        let hit_group = pipeline.shader_identifier(HIT_GROUP_EXPORT).unwrap();
        assert_ne!(ray_gen, hit_group);
        assert!(matches!(
            pipeline.shader_identifier("Callable"),
            Err(Error::MissingShaderIdentifier(_))
        ));

        let state_object = pipeline.state_object();
        assert_eq!(state_object.max_recursion_depth(), 16);
        assert_eq!(state_object.max_payload_size(), 20);
        for export in [RAY_GEN_EXPORT, MISS_EXPORT, HIT_GROUP_EXPORT] {
            assert!(state_object.has_local_root_signature(export), "{}", export);
        }
    }

    #[test]
    fn compile_errors_name_the_stage() {
        let device = headless::Device::new();
        let sources = ShaderSources {
            miss: String::new(),
            ..ShaderSources::builtin()
        };
        let err = RayTracingPipeline::<headless::Api>::build(&device, &sources, settings())
            .err()
            .unwrap();
        match err {
            Error::ShaderCompilation { stage, .. } => assert_eq!(stage, "miss"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn load_reads_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["RayGen.hlsl", "Miss.hlsl", "ClosestHit.hlsl"] {
            fs::write(dir.path().join(name), format!("// {}", name)).unwrap();
        }
        let sources = ShaderSources::load(dir.path()).unwrap();
        assert_eq!(sources.miss, "// Miss.hlsl");

        fs::write(dir.path().join("Miss.hlsl"), "#include \"Common.hlsli\"\nvoid Miss() {}").unwrap();
        fs::write(dir.path().join("Common.hlsli"), "struct HitInfo {};").unwrap();
        let sources = ShaderSources::load(dir.path()).unwrap();
        assert_eq!(sources.miss, "struct HitInfo {};\nvoid Miss() {}");

        fs::remove_file(dir.path().join("Miss.hlsl")).unwrap();
        assert!(matches!(
            ShaderSources::load(dir.path()),
            Err(Error::ReadFile { .. })
        ));
    }
}
