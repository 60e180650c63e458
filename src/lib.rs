/*! Minimal DirectX Raytracing renderer core.
 *
 *  Meshes are uploaded once and get a bottom-level acceleration structure
 *  each. The `RayTraceStage` owns the scene's top-level structure, the
 *  ray-tracing pipeline and the shader binding table, rebuilds the TLAS and
 *  SBT together whenever the scene moves, and records one `DispatchRays` per
 *  frame whose output is copied into the swap chain.
 *
 *  All GPU access goes through the traits in `hal`, implemented for
 *  Direct3D 12 on Windows and by a software device everywhere.
 */

pub mod accel;
pub mod commands;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod hal;
pub mod pipeline;
pub mod renderer;
pub mod sbt;
pub mod scene;
pub mod stage;
pub mod upload;

pub use config::RendererConfig;
pub use context::RenderContext;
pub use error::{Error, Result};
pub use renderer::Renderer;
pub use scene::Scene;
pub use stage::{RayTraceStage, StageState};
