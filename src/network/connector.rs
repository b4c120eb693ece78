//! Connect mode: dial the peer, run a session, and keep retrying

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::tcp::{configure_stream, connect, display_target};
use crate::config::RelayConfig;
use crate::error::{ConnectFailure, NetworkError, Result};
use crate::session::{shutdown_requested, wait_for_shutdown, Session, SessionEnd};

/// A single cancellable reconnect deadline.
///
/// Scheduling replaces any earlier deadline, so at most one attempt is ever
/// pending.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    deadline: Option<Instant>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    /// Returns true if a deadline was pending
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the deadline passes, or never if none is set.
    /// The deadline is consumed.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

pub struct Connector {
    host: String,
    port: u16,
    config: Arc<RelayConfig>,
    timer: ReconnectTimer,
    attempts: u64,
    sessions: u64,
}

impl Connector {
    pub fn new(host: impl Into<String>, port: u16, config: Arc<RelayConfig>) -> Self {
        Self {
            host: host.into(),
            port,
            config,
            timer: ReconnectTimer::new(),
            attempts: 0,
            sessions: 0,
        }
    }

    /// Keep a session with the peer alive until shutdown. Connection failures
    /// and lost sessions are never fatal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let target = display_target(&self.host, self.port);
        tracing::info!(%target, "connecting to server");

        self.timer.schedule(Duration::ZERO);
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = self.timer.expired() => {}
            }

            self.attempts += 1;
            let attempt = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = connect(&self.host, self.port, self.config.network.connect_timeout) => result,
            };

            let delay = self.config.network.reconnect_delay;
            match attempt {
                Ok(stream) => {
                    self.sessions += 1;
                    tracing::info!(%target, attempts = self.attempts, "connected to server");
                    if let Err(e) = configure_stream(&stream, self.config.network.keepalive) {
                        tracing::warn!(error = %e, "could not tune socket");
                    }
                    let peer = match stream.peer_addr() {
                        Ok(peer) => peer,
                        Err(e) => {
                            tracing::warn!(error = %e, "connection dropped before the session started");
                            self.timer.schedule(delay);
                            continue;
                        }
                    };

                    let session = Session::new(stream, peer, &self.config);
                    tracing::debug!(session = %session.id(), %peer, "session started");
                    let report = session.run(shutdown.clone()).await;
                    if report.end == SessionEnd::Shutdown || shutdown_requested(&shutdown) {
                        break;
                    }
                    tracing::info!(
                        delay_ms = delay.as_millis() as u64,
                        "connection lost, reconnecting"
                    );
                }
                Err(e) => log_connect_failure(&e, delay),
            }

            self.timer.schedule(delay);
        }

        self.timer.cancel();
        tracing::info!(attempts = self.attempts, sessions = self.sessions, "connector stopped");
        Ok(())
    }
}

fn log_connect_failure(err: &NetworkError, delay: Duration) {
    let delay_ms = delay.as_millis() as u64;
    match err.connect_failure() {
        Some(ConnectFailure::Refused) => {
            tracing::info!(delay_ms, "connection refused, server not listening; retrying")
        }
        Some(ConnectFailure::HostUnreachable) => {
            tracing::warn!(delay_ms, "host unreachable, check network connectivity; retrying")
        }
        Some(ConnectFailure::TimedOut) => {
            tracing::warn!(delay_ms, "connection timed out, server may be offline; retrying")
        }
        _ => tracing::warn!(error = %err, delay_ms, "connection error; retrying"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let mut timer = ReconnectTimer::new();
        let start = Instant::now();
        timer.schedule(Duration::from_secs(4));
        assert!(timer.is_scheduled());

        timer.expired().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(!timer.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_deadline() {
        let mut timer = ReconnectTimer::new();
        let start = Instant::now();
        timer.schedule(Duration::from_secs(1));
        timer.schedule(Duration::from_secs(4));

        timer.expired().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut timer = ReconnectTimer::new();
        timer.schedule(Duration::from_secs(1));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let fired = tokio::time::timeout(Duration::from_secs(10), timer.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_retrying() {
        // Nothing listens on this port
        let port = {
            let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            closed.local_addr().unwrap().port()
        };
        let config = Arc::new(RelayConfig::default());
        let connector = Connector::new("127.0.0.1", port, config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connector.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reaches_server_that_starts_late() {
        use crate::config::{AudioConfig, CaptureBackend, NetworkConfig, PlayerBackend};
        use tokio::io::AsyncReadExt;

        let port = {
            let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            closed.local_addr().unwrap().port()
        };
        let config = Arc::new(RelayConfig {
            audio: AudioConfig {
                capture: CaptureBackend::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), "printf PING; sleep 30".into()],
                },
                player: PlayerBackend::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), "cat > /dev/null".into()],
                },
                ..AudioConfig::default()
            },
            network: NetworkConfig {
                reconnect_delay: Duration::from_millis(100),
                connect_timeout: Duration::from_secs(1),
                ..NetworkConfig::default()
            },
            ..RelayConfig::default()
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Connector::new("127.0.0.1", port, config).run(shutdown_rx));

        // Let a few attempts fail first
        tokio::time::sleep(Duration::from_millis(350)).await;
        let server = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        let (mut peer, _) = tokio::time::timeout(Duration::from_secs(3), server.accept())
            .await
            .unwrap()
            .unwrap();
        let mut ping = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(3), peer.read_exact(&mut ping))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&ping, b"PING");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
