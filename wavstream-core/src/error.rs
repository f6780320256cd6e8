use thiserror::Error;

/// All errors produced by wavstream-core.
#[derive(Debug, Error)]
pub enum WavStreamError {
    #[error("file not found: {path}")]
    FileNotFound { path: std::path::PathBuf },

    #[error("invalid WAV container: {0}")]
    InvalidContainer(String),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("not enough device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("audio hardware failed to initialize: {0}")]
    HardwareInit(String),

    #[error("invalid chunk duration: {0} s")]
    InvalidChunkDuration(f64),

    #[error("channel {channel} out of range (engine has {count} channels)")]
    InvalidChannel { channel: usize, count: usize },

    #[error("no sound is loaded")]
    NotLoaded,

    #[error("engine has been shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WavStreamError>;
