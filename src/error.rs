//! Error types for the resource and pipeline lifecycle.
//!
//! Shader failures, resource validation failures and low-level API errors are all
//! plain values. [`PrepareError`] is what a [`Drawable`](crate::Drawable) hands back
//! to the host when it refuses to become prepared.

use std::fmt;

use crate::reflect::ShaderStage;
use crate::shader::ProgramState;

/// A shader stage failed to compile, or the program failed to link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShaderError {
    #[error("{stage} shader failed to compile:\n{info_log}")]
    Compile {
        stage: ShaderStage,
        info_log: String,
    },
    #[error("shader program failed to link:\n{info_log}")]
    Link { info_log: String },
}

impl ShaderError {
    /// State of the program after this failure, always [`ProgramState::Failed`].
    pub fn state(&self) -> ProgramState {
        ProgramState::Failed
    }

    /// Last state the program reached before failing.
    ///
    /// A compile failure never gets past `Uncompiled`. A link failure happens after
    /// both stages reached `Compiled`.
    pub fn reached(&self) -> ProgramState {
        match self {
            ShaderError::Compile { .. } => ProgramState::Uncompiled,
            ShaderError::Link { .. } => ProgramState::Compiled,
        }
    }

    /// The info log produced by the compiler or linker.
    pub fn info_log(&self) -> &str {
        match self {
            ShaderError::Compile { info_log, .. } | ShaderError::Link { info_log } => info_log,
        }
    }
}

/// Error codes a context records after a failed state-mutating call.
///
/// These mirror the classic GL error flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiErrorCode::InvalidEnum => "INVALID_ENUM",
            ApiErrorCode::InvalidValue => "INVALID_VALUE",
            ApiErrorCode::InvalidOperation => "INVALID_OPERATION",
            ApiErrorCode::OutOfMemory => "OUT_OF_MEMORY",
        };
        f.write_str(name)
    }
}

/// An unexpected error code observed after `operation`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: gpu error {code}")]
pub struct GpuApiError {
    pub operation: String,
    pub code: ApiErrorCode,
}

/// Resource data was rejected before anything was uploaded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height} RGBA8")]
    PixelBufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("texture dimensions must be non-zero, got {width}x{height}")]
    ZeroSize { width: u32, height: u32 },
    #[error("effect '{effect}' samples an image but none was supplied")]
    MissingImage { effect: String },
    #[error("invalid vertex layout: {0}")]
    InvalidLayout(String),
    #[error("vertex data holds {len} floats, not a multiple of the {floats_per_vertex}-float stride")]
    VertexDataLength { len: usize, floats_per_vertex: usize },
    #[error("index {index} at position {position} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        position: usize,
        index: u32,
        vertex_count: usize,
    },
}

/// Why [`Drawable::prepare`](crate::Drawable::prepare) refused to transition to prepared.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrepareError {
    #[error("drawable is already prepared for this context")]
    AlreadyPrepared,
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Gpu(#[from] GpuApiError),
}

/// Failure while bringing up a hardware context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to create surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("no suitable GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("failed to create device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("surface reports no supported formats")]
    NoSurfaceFormat,
}
