//! # Voice Relay
//!
//! Duplex raw-PCM voice relay between two machines over one TCP connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                         Connection Manager (network)                      │
//! │   Listener: bind [::]:<port> (IPv4 fallback), accept until shutdown       │
//! │   Connector: dial host:port (5s timeout), reconnect every 4s on failure   │
//! └───────────────────────────────────┬───────────────────────────────────────┘
//!                                     │ TcpStream (keep-alive 5s)
//!                                     ▼
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           Session (session)                               │
//! │                                                                           │
//! │   ┌────────────┐  s16le chunks   ┌───────────────┐                        │
//! │   │ Microphone │ ──────────────► │ socket writer │ ──► peer               │
//! │   │  (capture) │  (drop if full) │    (task)     │                        │
//! │   └────────────┘                 └───────────────┘                        │
//! │                                                                           │
//! │   peer ──► socket read ──► Stream Bridge ──► Audio Sink (player process)  │
//! │                               │     ▲                                     │
//! │                               ▼     │ drain, 5ms apart                    │
//! │                           Pending Audio Queue                             │
//! │                                                                           │
//! │   States: Starting → Active ⇄ Draining → Closed                           │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The wire carries bare 16-bit signed little-endian PCM samples with no
//! framing; chunk boundaries carry no meaning.

pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod session;

pub use config::{RelayConfig, Role};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Wire sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Bytes per sample on the wire (s16le)
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Port the relay listens on when launched by the dashboard
    pub const DEFAULT_LISTEN_PORT: u16 = 3333;

    /// Bound on a single outbound connection attempt
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Delay between reconnect attempts
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(4);

    /// TCP keep-alive probe interval
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

    /// Grace period between closing the player's input and killing it
    pub const SINK_STOP_GRACE: Duration = Duration::from_millis(200);

    /// Gap between queued chunks while draining
    pub const DRAIN_CHUNK_DELAY: Duration = Duration::from_millis(5);

    /// Delay before relaunching a failed player
    pub const SINK_RELAUNCH_DELAY: Duration = Duration::from_secs(1);

    /// Socket read buffer size
    pub const READ_CHUNK_SIZE: usize = 4096;

    /// Chunks buffered between the session and the player's stdin writer
    pub const SINK_CHANNEL_CAPACITY: usize = 256;

    /// Captured chunks buffered between the capture thread and the session
    pub const CAPTURE_CHANNEL_CAPACITY: usize = 256;

    /// Microphone chunks buffered between the session and the socket writer
    pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

    /// Time the socket writer gets to flush at teardown before it is aborted
    pub const OUTBOUND_FLUSH_GRACE: Duration = Duration::from_millis(200);
}
