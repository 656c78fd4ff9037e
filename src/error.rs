use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build log config: {0}")]
    Config(String),

    #[error("logging initialization failed: {0}")]
    Init(#[from] log::SetLoggerError),
}

/// Errors that end a single capture loop. Other loops are unaffected.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("interface is down: {0}")]
    InterfaceDown(String),

    #[error("failed to open capture channel on {interface}: {source}")]
    ChannelOpen {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("interface {0} does not provide an ethernet channel")]
    UnsupportedChannel(String),

    #[error("interface {0} has no link-layer address, skipping raw IP capture")]
    NoLinkLayer(String),

    #[error("capture on {interface} failed after {frames} frames: {source}")]
    Read {
        interface: String,
        frames: u64,
        #[source]
        source: io::Error,
    },
}

/// A captured frame that cannot be processed. The frame is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame of {len} bytes is shorter than an ethernet header")]
    Truncated { len: usize },

    #[error("malformed {protocol} destination port field ({len} transport bytes)")]
    MalformedPort { protocol: &'static str, len: usize },
}

/// Failures on the persistent outbound connections.
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("failed to connect uplink {path}: {source}")]
    Connect {
        path: &'static str,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    #[error("failed to write to uplink {path}: {reason}")]
    Write { path: &'static str, reason: String },

    #[error("gave up reconnecting uplink {path} after {attempts} attempts")]
    ReconnectExhausted { path: &'static str, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector rejected registration with status {0}")]
    Status(u16),
}
