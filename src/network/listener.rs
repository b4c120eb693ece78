//! Listen mode: accept peers and run a session for each

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::tcp::{bind_listener, configure_stream};
use crate::config::RelayConfig;
use crate::error::{NetworkError, Result};
use crate::session::{wait_for_shutdown, Session, SessionReport};

/// Pause after a failed accept so a persistent error cannot spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Listener {
    listener: TcpListener,
    config: Arc<RelayConfig>,
    sessions: JoinSet<SessionReport>,
    accepted: u64,
}

impl Listener {
    /// Bind `[::]:port`, or `0.0.0.0:port` where IPv6 is unavailable. A port
    /// already in use is a fatal error.
    pub async fn bind(port: u16, config: Arc<RelayConfig>) -> std::result::Result<Self, NetworkError> {
        let listener = bind_listener(port).await?;
        Ok(Self {
            listener,
            config,
            sessions: JoinSet::new(),
            accepted: 0,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept peers until shutdown, then wait for live sessions to tear down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "server is listening"),
            Err(_) => tracing::info!("server is listening"),
        }

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.accepted += 1;
                        if let Err(e) = configure_stream(&stream, self.config.network.keepalive) {
                            tracing::warn!(error = %e, %peer, "could not tune socket");
                        }
                        let session = Session::new(stream, peer, &self.config);
                        tracing::info!(%peer, session = %session.id(), active = self.sessions.len(), "a client has connected");
                        self.sessions.spawn(session.run(shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },

                Some(done) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!(error = %e, "session task failed");
                    }
                }
            }
        }

        tracing::info!(live = self.sessions.len(), accepted = self.accepted, "listener shutting down");
        while let Some(done) = self.sessions.join_next().await {
            if let Err(e) = done {
                tracing::error!(error = %e, "session task failed");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{AudioConfig, CaptureBackend, PlayerBackend};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn greeting_config() -> Arc<RelayConfig> {
        Arc::new(RelayConfig {
            audio: AudioConfig {
                capture: CaptureBackend::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), "printf HELLO; sleep 30".into()],
                },
                player: PlayerBackend::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), "cat > /dev/null".into()],
                },
                ..AudioConfig::default()
            },
            ..RelayConfig::default()
        })
    }

    async fn greet(addr: SocketAddr) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut hello = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut hello))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&hello, b"HELLO");
        client.write_all(&[0u8; 64]).await.unwrap();
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_peers_one_after_another() {
        let listener = Listener::bind(0, greeting_config()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        greet(addr).await;
        // The first session ending leaves the listener accepting
        greet(addr).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_live_sessions() {
        let listener = Listener::bind(0, greeting_config()).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        let mut client = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap();
        let mut hello = [0u8; 5];
        client.read_exact(&mut hello).await.unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Session closed its end of the socket
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_idle_listener_starts_no_audio_processes() {
        let dir = tempfile::tempdir().unwrap();
        let player_marker = dir.path().join("player-started");
        let mic_marker = dir.path().join("mic-started");
        let config = Arc::new(RelayConfig {
            audio: AudioConfig {
                capture: CaptureBackend::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), format!("touch '{}'; sleep 30", mic_marker.display())],
                },
                player: PlayerBackend::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), format!("touch '{}'; cat > /dev/null", player_marker.display())],
                },
                ..AudioConfig::default()
            },
            ..RelayConfig::default()
        });

        let listener = Listener::bind(0, config).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!player_marker.exists(), "player launched with no peer");
        assert!(!mic_marker.exists(), "microphone opened with no peer");
    }
}
