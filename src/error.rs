//! Error types for the voice relay

use std::fmt;
use std::io;

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the process should give up instead of retrying.
    ///
    /// Only configuration problems and listener bind failures are fatal;
    /// everything else is handled where it happens.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::Network(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("cpal error: {0}")]
    CpalError(String),
}

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Reasons a chunk could not be handed to the playback subprocess.
///
/// The stream bridge treats every variant as "queue it and retry later".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    #[error("Player is not ready")]
    NotReady,

    #[error("Player input is saturated")]
    Backpressure,

    #[error("Player input is closed")]
    Closed,
}

/// Why an outbound connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    HostUnreachable,
    TimedOut,
    Other,
}

impl ConnectFailure {
    /// Classify an I/O error returned by `connect`.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectFailure::Refused,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ConnectFailure::HostUnreachable
            }
            io::ErrorKind::TimedOut => ConnectFailure::TimedOut,
            _ => ConnectFailure::Other,
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectFailure::Refused => "connection refused",
            ConnectFailure::HostUnreachable => "host unreachable",
            ConnectFailure::TimedOut => "timed out",
            ConnectFailure::Other => "connect error",
        };
        f.write_str(text)
    }
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Port {port} is already in use; free it or choose another port")]
    AddrInUse { port: u16 },

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection to {target} failed ({cause}): {detail}")]
    ConnectFailed {
        target: String,
        cause: ConnectFailure,
        detail: String,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Socket option failed: {0}")]
    SocketOption(String),
}

impl NetworkError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetworkError::AddrInUse { .. } | NetworkError::BindFailed(_) | NetworkError::InvalidAddress(_)
        )
    }

    /// Connect failure cause, if this is a connect error.
    pub fn connect_failure(&self) -> Option<ConnectFailure> {
        match self {
            NetworkError::ConnectFailed { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connect_errors() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(ConnectFailure::classify(&refused), ConnectFailure::Refused);

        let unreachable = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(ConnectFailure::classify(&unreachable), ConnectFailure::HostUnreachable);

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(ConnectFailure::classify(&timeout), ConnectFailure::TimedOut);

        let other = io::Error::new(io::ErrorKind::Other, "dns");
        assert_eq!(ConnectFailure::classify(&other), ConnectFailure::Other);
    }

    #[test]
    fn test_fatality() {
        assert!(Error::from(NetworkError::AddrInUse { port: 3333 }).is_fatal());
        assert!(Error::Config("bad".into()).is_fatal());

        let transient = NetworkError::ConnectFailed {
            target: "peer:3333".into(),
            cause: ConnectFailure::Refused,
            detail: "refused".into(),
        };
        assert!(!transient.is_fatal());
        assert_eq!(transient.connect_failure(), Some(ConnectFailure::Refused));
        assert!(!Error::from(SinkError::NotReady).is_fatal());
    }
}
