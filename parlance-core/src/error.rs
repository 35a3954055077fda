use thiserror::Error;

/// All errors produced by parlance-core.
#[derive(Debug, Error)]
pub enum ParlanceError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("device can only be changed while idle")]
    DeviceBusy,

    #[error("connect failed after {attempts} attempts: {reason}")]
    ConnectExhausted { attempts: u32, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    #[error("recorder is already running")]
    AlreadyRunning,

    #[error("recorder is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParlanceError>;
