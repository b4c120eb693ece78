//! Outbound audio: microphone chunks to the socket without blocking the session
//!
//! The session hands chunks over with `try_send`; a writer task owns the
//! socket's write half. A peer that stops reading only costs dropped
//! microphone chunks, never a stalled session loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Totals reported when the writer is closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboundStats {
    pub bytes_written: u64,
    /// Chunks never handed to the writer (queue full or writer gone)
    pub chunks_unsent: u64,
}

pub struct OutboundAudio {
    tx: Option<mpsc::Sender<Bytes>>,
    task: JoinHandle<()>,
    written: Arc<AtomicU64>,
    unsent: u64,
}

impl OutboundAudio {
    /// Spawn the writer task in the current span.
    pub fn spawn<W>(writer: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let written = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(
            write_loop(writer, rx, Arc::clone(&written)).instrument(tracing::Span::current()),
        );
        Self {
            tx: Some(tx),
            task,
            written,
            unsent: 0,
        }
    }

    /// Queue one chunk for the peer. Returns false if it was dropped.
    pub fn send(&mut self, chunk: Bytes) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            self.unsent += 1;
            return false;
        };
        match tx.try_send(chunk) {
            Ok(()) => true,
            Err(e) => {
                if self.unsent == 0 {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            tracing::warn!("peer is not keeping up; dropping microphone audio")
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            tracing::warn!("socket writer stopped; dropping microphone audio")
                        }
                    }
                }
                self.unsent += 1;
                false
            }
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Let the writer flush what is queued and shut the write half down,
    /// aborting it if that takes longer than `grace`.
    pub async fn close(mut self, grace: Duration) -> OutboundStats {
        self.tx = None;
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            tracing::debug!("socket writer did not finish in time; aborting");
            self.task.abort();
        }
        if self.unsent > 0 {
            tracing::info!(unsent = self.unsent, "microphone chunks dropped on the way to the peer");
        }
        OutboundStats {
            bytes_written: self.bytes_written(),
            chunks_unsent: self.unsent,
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, written: Arc<AtomicU64>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            tracing::warn!(error = %e, "error writing microphone audio to socket");
            return;
        }
        written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "socket shutdown");
    }
}
