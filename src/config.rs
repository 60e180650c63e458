//! Renderer configuration, persisted as JSON.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub window_title: String,
    pub window_width: u32,
    pub window_height: u32,
    /// Directory holding `RayGen.hlsl`, `Miss.hlsl` and `ClosestHit.hlsl`.
    /// The sources compiled into the binary are used when unset.
    pub shader_directory: Option<PathBuf>,
    pub max_recursion_depth: u32,
    /// Bytes.
    pub payload_size: u32,
    /// Bytes.
    pub attribute_size: u32,
    pub descriptor_heap_capacity: u32,
    /// `0` waits forever.
    pub fence_timeout_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            window_title: "DXR Renderer".to_string(),
            window_width: 1080,
            window_height: 720,
            shader_directory: None,
            max_recursion_depth: 16,
            payload_size: 20,
            attribute_size: 8,
            descriptor_heap_capacity: 1000,
            fence_timeout_ms: 5000,
        }
    }
}

impl RendererConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load `path` if given and present, defaults otherwise. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                log::warn!("Config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}
