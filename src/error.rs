//! Error types for the renderer core.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type. Every variant except `StageNotReady` is fatal for the
/// frame loop: the binary logs it and exits.
#[derive(Error, Debug)]
pub enum Error {
    /// The driver rejected a call, the device was removed, or an allocation failed.
    #[error("device error in {operation}: {message}")]
    Device {
        operation: &'static str,
        message: String,
    },

    /// Shader library compilation failed, `log` is the compiler output.
    #[error("failed to compile {stage} library: {log}")]
    ShaderCompilation { stage: String, log: String },

    /// Root signature serialization failed, `log` is the error blob.
    #[error("failed to serialize root signature: {0}")]
    RootSignature(String),

    /// State object creation failed.
    #[error("failed to create ray-tracing pipeline: {0}")]
    PipelineCreation(String),

    #[error("invalid pipeline settings: {0}")]
    InvalidPipelineSettings(String),

    /// An exports association points at a subobject it cannot reference.
    #[error("subobject {handle} cannot be associated: {reason}")]
    InvalidAssociation { handle: usize, reason: &'static str },

    #[error("failed to build {level} acceleration structure: {message}")]
    AccelerationStructureBuild {
        level: &'static str,
        message: String,
    },

    #[error("mesh `{0}` has no vertices or no indices")]
    EmptyGeometry(String),

    #[error("descriptor heap exhausted (capacity: {capacity})")]
    DescriptorHeapExhausted { capacity: u32 },

    #[error("pipeline exports no shader identifier for `{0}`")]
    MissingShaderIdentifier(String),

    #[error("record for `{export}` has {found} inputs, its root signature takes {expected}")]
    RecordInputMismatch {
        export: String,
        expected: usize,
        found: usize,
    },

    #[error("shader binding table has no ray-generation record")]
    MissingRayGeneration,

    #[error("failed to map buffer `{0}`")]
    Map(String),

    #[error("timed out waiting for fence value {value} (completed: {completed})")]
    FenceTimeout { value: u64, completed: u64 },

    /// The render stage is mid-rebuild and cannot record a dispatch.
    #[error("render stage is not ready")]
    StageNotReady,

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a device error for the named operation.
    pub fn device(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            operation,
            message: message.into(),
        }
    }

    /// Whether the frame loop may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StageNotReady)
    }
}

/// Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::DescriptorHeapExhausted { capacity: 4 };
        assert!(e.to_string().contains('4'));

        let e = Error::FenceTimeout {
            value: 7,
            completed: 5,
        };
        assert!(e.to_string().contains('7'));
        assert!(e.to_string().contains('5'));

        let e = Error::device("CreateCommittedResource", "E_OUTOFMEMORY");
        assert!(e.to_string().contains("CreateCommittedResource"));
    }

    #[test]
    fn test_only_stage_not_ready_is_recoverable() {
        assert!(Error::StageNotReady.is_recoverable());
        assert!(!Error::MissingRayGeneration.is_recoverable());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
