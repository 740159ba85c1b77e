use crate::traits::ChannelId;
use thiserror::Error;

/// Failures of the underlying transports. These never reach the user as hard
/// errors; the engine re-queues or reconnects instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),

    #[error("send failed: {0}")]
    Send(String),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("bridge returned HTTP {0}")]
    Status(u16),
}

/// Validation failures of the tube editor draft
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EditorError {
    #[error("Tube # must be >= 1.")]
    InvalidTubeNumber,

    #[error("Hours must be >= 0.")]
    InvalidHours,

    #[error("Minutes must be 0-59.")]
    InvalidMinutes,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
