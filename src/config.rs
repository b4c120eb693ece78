//! Relay configuration
//!
//! Settings come from an optional TOML file and are then overridden by
//! command line flags (see [`crate::cli`]). Durations are written in
//! milliseconds in the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, NetworkError, Result};

/// File name looked up in the per-user config directory
pub const CONFIG_FILE_NAME: &str = "relay.toml";

/// Connection role, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Role {
    /// Accept inbound connections on all interfaces
    Listen { port: u16 },
    /// Dial a remote relay, reconnecting forever
    Connect { host: String, port: u16 },
}

impl Role {
    /// Parse a `host:port` target. Bracketed IPv6 literals are accepted.
    pub fn connect_to(target: &str) -> std::result::Result<Self, NetworkError> {
        let invalid = || NetworkError::InvalidAddress(target.to_string());

        let (host, port) = target.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Role::Connect {
            host: host.to_string(),
            port,
        })
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Listen {
            port: DEFAULT_LISTEN_PORT,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listen { port } => write!(f, "listen on port {}", port),
            Role::Connect { host, port } if host.contains(':') => {
                write!(f, "connect to [{}]:{}", host, port)
            }
            Role::Connect { host, port } => write!(f, "connect to {}:{}", host, port),
        }
    }
}

/// How microphone audio is captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureBackend {
    /// In-process capture through cpal
    Cpal,
    /// PulseAudio `parec` subprocess
    Parec,
    /// ALSA `arecord` subprocess
    Arecord,
    /// Any program writing raw s16le PCM to stdout
    Command { program: String, args: Vec<String> },
}

impl Default for CaptureBackend {
    fn default() -> Self {
        CaptureBackend::Cpal
    }
}

/// Which program plays received audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerBackend {
    /// PulseAudio `paplay --raw`
    Paplay,
    /// ALSA `aplay -t raw`
    Aplay,
    /// Any program reading raw s16le PCM from stdin
    Command { program: String, args: Vec<String> },
}

impl Default for PlayerBackend {
    fn default() -> Self {
        PlayerBackend::Paplay
    }
}

/// Audio device and format settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name (None = system default)
    pub input_device: Option<String>,
    /// Playback device name (None = system default)
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub mic_channels: u16,
    pub speaker_channels: u16,
    pub capture: CaptureBackend,
    pub player: PlayerBackend,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            mic_channels: DEFAULT_CHANNELS,
            speaker_channels: DEFAULT_CHANNELS,
            capture: CaptureBackend::default(),
            player: PlayerBackend::default(),
        }
    }
}

/// Socket and session timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive: Duration,
    #[serde(with = "duration_ms")]
    pub drain_chunk_delay: Duration,
    pub read_chunk_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            keepalive: KEEPALIVE_INTERVAL,
            drain_chunk_delay: DRAIN_CHUNK_DELAY,
            read_chunk_size: READ_CHUNK_SIZE,
        }
    }
}

/// Player restart policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Delay before the first relaunch after a failure
    #[serde(with = "duration_ms")]
    pub relaunch_delay: Duration,
    /// Growth factor for consecutive failures; 1.0 keeps the delay fixed
    pub backoff_multiplier: f64,
    #[serde(with = "duration_ms")]
    pub max_relaunch_delay: Duration,
    /// Give up after this many consecutive failures (None = never)
    pub max_relaunch_attempts: Option<u32>,
    /// Time allowed between end-of-input and a forced kill
    #[serde(with = "duration_ms")]
    pub stop_grace: Duration,
}

impl SinkConfig {
    /// Delay before relaunch attempt number `failures` (1-based).
    pub fn relaunch_delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = self.relaunch_delay.as_secs_f64() * factor;
        let capped = delay.min(self.max_relaunch_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether `failures` consecutive failures exhausts the relaunch budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_relaunch_attempts
            .map_or(false, |max| failures > max)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            relaunch_delay: SINK_RELAUNCH_DELAY,
            backoff_multiplier: 1.0,
            max_relaunch_delay: Duration::from_secs(30),
            max_relaunch_attempts: None,
            stop_grace: SINK_STOP_GRACE,
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub role: Role,
    pub audio: AudioConfig,
    pub network: NetworkConfig,
    pub sink: SinkConfig,
}

impl RelayConfig {
    /// Per-user config file location, e.g. `~/.config/voice-relay/relay.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "voice-relay").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Load an explicitly requested file, or the per-user file if present.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading config file");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, channels) in [
            ("mic-channels", self.audio.mic_channels),
            ("speaker-channels", self.audio.speaker_channels),
        ] {
            if !(1..=2).contains(&channels) {
                return Err(Error::Config(format!(
                    "{} must be 1 or 2, got {}",
                    name, channels
                )));
            }
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".into()));
        }
        if self.network.read_chunk_size == 0 {
            return Err(Error::Config("read chunk size must be positive".into()));
        }
        if !self.sink.backoff_multiplier.is_finite() || self.sink.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff multiplier must be >= 1.0".into()));
        }
        if let Role::Listen { port: 0 } = self.role {
            return Err(Error::Config("listen port must be non-zero".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
