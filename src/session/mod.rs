//! Session: one connected peer, both audio directions
//!
//! A session owns the socket, one microphone source and one audio sink. It
//! runs a single select loop until the socket ends or shutdown is requested,
//! then tears everything down in a fixed order.

pub mod bridge;
pub mod outbound;
pub mod pacer;

pub use bridge::{BridgeStats, DrainStep, Inbound, SessionState, StreamBridge};
pub use outbound::{OutboundAudio, OutboundStats};
pub use pacer::DrainPacer;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::audio::{build_source, AudioSink, AudioSource, PcmFormat, SinkEvent};
use crate::config::RelayConfig;
use crate::constants::{OUTBOUND_CHANNEL_CAPACITY, OUTBOUND_FLUSH_GRACE};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection
    PeerClosed,
    /// Reading from the socket failed
    SocketError,
    /// Process shutdown was requested
    Shutdown,
}

/// Summary logged when a session ends
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Microphone chunks dropped because the peer was not keeping up
    pub chunks_unsent: u64,
    pub chunks_queued: u64,
    pub chunks_discarded: u64,
    pub chunks_dropped: u64,
    pub player_launches: u64,
    pub end: SessionEnd,
}

impl SessionReport {
    pub fn log(&self) {
        tracing::info!(
            session = %self.id,
            peer = %self.peer,
            started_at = %self.started_at.to_rfc3339(),
            duration_ms = self.duration.as_millis() as u64,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            unsent = self.chunks_unsent,
            queued = self.chunks_queued,
            discarded = self.chunks_discarded,
            dropped = self.chunks_dropped,
            player_launches = self.player_launches,
            end = ?self.end,
            "session ended"
        );
    }
}

pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    stream: Option<TcpStream>,
    sink: AudioSink,
    source: Box<dyn AudioSource>,
    outbound: Option<OutboundAudio>,
    bridge: StreamBridge,
    speaker_format: PcmFormat,
    drain_delay: Duration,
    read_chunk_size: usize,
    started_at: DateTime<Utc>,
    opened: Instant,
}

impl Session {
    /// Session using the configured player and microphone backends
    pub fn new(stream: TcpStream, peer: SocketAddr, config: &RelayConfig) -> Self {
        if config.audio.mic_channels != config.audio.speaker_channels {
            tracing::warn!(
                mic_channels = config.audio.mic_channels,
                speaker_channels = config.audio.speaker_channels,
                "microphone and speaker channel counts differ; the peer must agree on the wire layout"
            );
        }
        let sink = AudioSink::from_config(&config.audio, &config.sink);
        let source = build_source(&config.audio, config.network.read_chunk_size);
        Self::with_parts(stream, peer, sink, source, config)
    }

    pub fn with_parts(
        stream: TcpStream,
        peer: SocketAddr,
        sink: AudioSink,
        source: Box<dyn AudioSource>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            stream: Some(stream),
            sink,
            source,
            outbound: None,
            bridge: StreamBridge::new(),
            speaker_format: PcmFormat::new(config.audio.sample_rate, config.audio.speaker_channels),
            drain_delay: config.network.drain_chunk_delay,
            read_chunk_size: config.network.read_chunk_size.max(1),
            started_at: Utc::now(),
            opened: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relay audio until the socket ends or shutdown is signalled, then
    /// release every resource the session holds.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionReport {
        let span = tracing::info_span!("session", id = %self.id, peer = %self.peer);
        let end = self.relay(&mut shutdown).instrument(span.clone()).await;
        let report = self.teardown(end).instrument(span).await;
        report.log();
        report
    }

    async fn relay(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        tracing::info!("setting up voice stream");

        self.sink.start();

        let mut mic = match self.source.start() {
            Ok(rx) => {
                tracing::info!(source = %self.source.describe(), "microphone started");
                Some(rx)
            }
            Err(e) => {
                tracing::warn!(error = %e, "microphone unavailable; sending no audio");
                None
            }
        };

        let Some(stream) = self.stream.take() else {
            return SessionEnd::SocketError;
        };
        let (mut reader, writer) = stream.into_split();
        let outbound = self
            .outbound
            .insert(OutboundAudio::spawn(writer, OUTBOUND_CHANNEL_CAPACITY));

        let mut pacer = DrainPacer::new(self.drain_delay);

        let mut buf = BytesMut::with_capacity(self.read_chunk_size);

        loop {
            buf.reserve(self.read_chunk_size);

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {
                    tracing::info!("shutdown requested");
                    return SessionEnd::Shutdown;
                }

                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        tracing::info!("peer closed the connection");
                        return SessionEnd::PeerClosed;
                    }
                    Ok(n) => {
                        let chunk = buf.split().freeze();
                        match self.bridge.on_inbound(&mut self.sink, chunk) {
                            Inbound::Delivered => tracing::trace!(bytes = n, "played inbound chunk"),
                            Inbound::Queued => tracing::trace!(bytes = n, pending = self.bridge.pending(), "queued inbound chunk"),
                            Inbound::Dropped => tracing::trace!(bytes = n, "dropped inbound chunk"),
                        }
                        if self.bridge.try_begin_drain(&self.sink) {
                            pacer.start();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "socket error");
                        return SessionEnd::SocketError;
                    }
                },

                chunk = recv_opt(&mut mic) => match chunk {
                    Some(chunk) => {
                        outbound.send(chunk);
                    }
                    None => {
                        tracing::warn!("microphone stream ended; no further outbound audio");
                        mic = None;
                    }
                },

                event = self.sink.next_event() => match event {
                    SinkEvent::Ready => {
                        tracing::debug!("audio player ready");
                        if self.bridge.on_sink_ready(&self.sink) {
                            pacer.start();
                        }
                    }
                    SinkEvent::Exited { code } => {
                        tracing::warn!(?code, pending = self.bridge.pending(), "audio player exited");
                        self.bridge.on_sink_lost();
                        pacer.stop();
                    }
                    SinkEvent::LaunchFailed { error } => {
                        tracing::warn!(%error, "audio player failed to start");
                        self.bridge.on_sink_lost();
                        pacer.stop();
                    }
                    SinkEvent::GaveUp { failures } => {
                        let dropped = self.bridge.abandon_sink();
                        pacer.stop();
                        tracing::error!(failures, dropped, "giving up on audio player; inbound audio will be dropped");
                    }
                },

                () = pacer.due() => {
                    let step = self.bridge.drain_next(&mut self.sink);
                    match step {
                        DrainStep::Delivered { remaining } => tracing::trace!(remaining, "played buffered chunk"),
                        DrainStep::Finished => tracing::debug!("buffered audio drained"),
                        DrainStep::Stalled | DrainStep::Aborted => {}
                    }
                    pacer.after(step);
                }
            }
        }
    }

    /// Release capture, player and socket. Every step runs regardless of how
    /// the ones before it went.
    async fn teardown(mut self, end: SessionEnd) -> SessionReport {
        tracing::info!(reason = ?end, "socket closed, cleaning up audio");

        self.source.stop();
        self.sink.shutdown().await;

        // The write half shuts the socket down once queued audio is flushed
        let outbound = match self.outbound.take() {
            Some(outbound) => outbound.close(OUTBOUND_FLUSH_GRACE).await,
            None => OutboundStats::default(),
        };

        let pending = self.speaker_format.duration_of(self.bridge.pending_bytes());
        let discarded = self.bridge.close();
        if discarded > 0 {
            tracing::info!(
                discarded,
                audio_ms = pending.as_millis() as u64,
                "discarding undelivered audio"
            );
        }

        let stats = self.bridge.stats();
        SessionReport {
            id: self.id,
            peer: self.peer,
            started_at: self.started_at,
            duration: self.opened.elapsed(),
            bytes_in: stats.bytes_in,
            bytes_out: outbound.bytes_written,
            chunks_unsent: outbound.chunks_unsent,
            chunks_queued: stats.queued,
            chunks_discarded: stats.discarded,
            chunks_dropped: stats.dropped,
            player_launches: self.sink.launches(),
            end,
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone. Cancel-safe.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Whether shutdown has been requested, without waiting
pub fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, CaptureBackend, PlayerBackend, SinkConfig};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[cfg(unix)]
    fn sh(script: String) -> (String, Vec<String>) {
        ("sh".to_string(), vec!["-c".to_string(), script])
    }

    #[cfg(unix)]
    fn test_config(player: String, mic: String) -> RelayConfig {
        let (player_program, player_args) = sh(player);
        let (mic_program, mic_args) = sh(mic);
        RelayConfig {
            audio: AudioConfig {
                capture: CaptureBackend::Command {
                    program: mic_program,
                    args: mic_args,
                },
                player: PlayerBackend::Command {
                    program: player_program,
                    args: player_args,
                },
                ..AudioConfig::default()
            },
            sink: SinkConfig {
                relaunch_delay: Duration::from_millis(50),
                ..SinkConfig::default()
            },
            ..RelayConfig::default()
        }
    }

    async fn connected_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, peer, client)
    }

    #[cfg(unix)]
    async fn wait_for_exit(pid_file: &std::path::Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut pid = None;
        while Instant::now() < deadline {
            if pid.is_none() {
                pid = std::fs::read_to_string(pid_file)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
            }
            if let Some(pid) = pid {
                if !std::path::Path::new(&format!("/proc/{}", pid)).exists() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_relays_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("speaker.raw");
        let config = test_config(
            format!("cat >> '{}'", out.display()),
            "printf 'MICDATA'; sleep 30".to_string(),
        );

        let (server, peer, mut client) = connected_pair().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Session::new(server, peer, &config);
        let task = tokio::spawn(session.run(shutdown_rx));

        let mut mic = [0u8; 7];
        client.read_exact(&mut mic).await.unwrap();
        assert_eq!(&mic, b"MICDATA");

        client.write_all(b"hello ").await.unwrap();
        client.write_all(b"world").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.end, SessionEnd::PeerClosed);
        assert_eq!(report.bytes_in, 11);
        assert_eq!(report.bytes_out, 7);
        assert_eq!(report.chunks_dropped, 0);
        assert_eq!(std::fs::read(&out).unwrap(), b"hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_releases_player_and_microphone() {
        let dir = tempfile::tempdir().unwrap();
        let player_pid = dir.path().join("player.pid");
        let mic_pid = dir.path().join("mic.pid");
        let config = test_config(
            format!("echo $$ > '{}'; exec sleep 30", player_pid.display()),
            format!("echo $$ > '{}'; exec sleep 30", mic_pid.display()),
        );

        let (server, peer, _client) = connected_pair().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Session::new(server, peer, &config).run(shutdown_rx));

        // Let both processes come up and record their pids
        let deadline = Instant::now() + Duration::from_secs(3);
        while !(player_pid.exists() && mic_pid.exists()) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.end, SessionEnd::Shutdown);
        assert!(wait_for_exit(&player_pid).await, "player still running");
        assert!(wait_for_exit(&mic_pid).await, "microphone still running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_player_crash_mid_stream_keeps_later_audio() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("speaker.raw");
        let marker = dir.path().join("crashed");
        // First instance takes three bytes and dies; later instances keep playing
        let player = format!(
            "if [ -e '{m}' ]; then exec cat >> '{o}'; else touch '{m}'; head -c 3 >> '{o}'; exit 1; fi",
            m = marker.display(),
            o = out.display()
        );
        let config = test_config(player, "sleep 30".to_string());

        let (server, peer, mut client) = connected_pair().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Session::new(server, peer, &config).run(shutdown_rx));

        client.write_all(b"abc").await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while !marker.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give the first player time to exit and its replacement time to start
        tokio::time::sleep(Duration::from_millis(300)).await;

        client.write_all(b"def").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.shutdown().await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.end, SessionEnd::PeerClosed);
        assert!(report.player_launches >= 2);
        assert_eq!(std::fs::read(&out).unwrap(), b"abcdef");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_peer_not_reading_does_not_block_shutdown() {
        let config = test_config("cat > /dev/null".to_string(), "cat /dev/zero".to_string());

        // The client never reads, so the socket backs up
        let (server, peer, _client) = connected_pair().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Session::new(server, peer, &config).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("session ended")
            .unwrap();
        assert_eq!(report.end, SessionEnd::Shutdown);
        assert!(report.chunks_unsent > 0);
        assert!(report.bytes_out > 0);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_sees_earlier_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
        assert!(shutdown_requested(&rx));
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!shutdown_requested(&rx));
        drop(tx);
        tokio::time::timeout(Duration::from_millis(100), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
        assert!(shutdown_requested(&rx));
    }
}
