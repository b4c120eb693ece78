//! Stream Bridge: inbound audio routing for one session
//!
//! A synchronous state machine deciding, chunk by chunk, whether inbound
//! audio goes straight to the sink or into the pending queue, and when the
//! queue is replayed. The session driver owns the timers and I/O; this type
//! only owns the decisions.
//!
//! ```text
//!   Starting ──sink ready──► Active ◄──queue empty / sink lost── Draining
//!      │                       │  └──sink ready & queue non-empty──►  │
//!      └───────────────────────┴──────────── close ───────────► Closed ◄┘
//! ```
//!
//! While anything is queued, new chunks are appended behind it rather than
//! written directly, so the sink always sees arrival order.

use bytes::Bytes;

use crate::audio::buffer::PendingQueue;
use crate::audio::playback::PcmSink;
use crate::error::SinkError;

/// Lifecycle of a session's inbound path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first player instance
    Starting,
    /// Forwarding directly, or holding a queue until the player is back
    Active,
    /// Replaying the pending queue
    Draining,
    /// Torn down; everything inbound is ignored
    Closed,
}

/// What happened to one inbound chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Delivered,
    Queued,
    /// Session closed or the player was abandoned
    Dropped,
}

/// Result of one drain step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    /// One chunk delivered, more remain
    Delivered { remaining: usize },
    /// Queue is empty; back to Active
    Finished,
    /// The player is saturated; retry the same chunk later
    Stalled,
    /// The player went away mid-drain; the queue is kept
    Aborted,
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub chunks_in: u64,
    pub bytes_in: u64,
    pub delivered_direct: u64,
    pub delivered_from_queue: u64,
    pub queued: u64,
    /// Dropped because the player was abandoned
    pub dropped: u64,
    /// Still queued when the session closed
    pub discarded: u64,
}

#[derive(Debug)]
pub struct StreamBridge {
    state: SessionState,
    queue: PendingQueue,
    sink_abandoned: bool,
    stats: BridgeStats,
}

impl StreamBridge {
    pub fn new() -> Self {
        Self {
            state: SessionState::Starting,
            queue: PendingQueue::new(),
            sink_abandoned: false,
            stats: BridgeStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_draining(&self) -> bool {
        self.state == SessionState::Draining
    }

    /// Chunks waiting for the player
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.queue.queued_bytes()
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Route one chunk read from the socket.
    pub fn on_inbound<S: PcmSink>(&mut self, sink: &mut S, chunk: Bytes) -> Inbound {
        if self.state == SessionState::Closed {
            return Inbound::Dropped;
        }

        self.stats.chunks_in += 1;
        self.stats.bytes_in += chunk.len() as u64;

        if self.sink_abandoned {
            self.stats.dropped += 1;
            return Inbound::Dropped;
        }

        // Anything already waiting goes first
        if !self.queue.is_empty() || self.is_draining() || !sink.is_ready() {
            self.enqueue(chunk);
            if !sink.is_ready() {
                sink.request_start();
            }
            return Inbound::Queued;
        }

        match sink.write(chunk.clone()) {
            Ok(()) => {
                self.stats.delivered_direct += 1;
                Inbound::Delivered
            }
            Err(e) => {
                tracing::debug!(error = %e, bytes = chunk.len(), "buffering chunk the player did not take");
                self.enqueue(chunk);
                if e != SinkError::Backpressure {
                    sink.request_start();
                }
                Inbound::Queued
            }
        }
    }

    /// The player became ready. Returns true if a drain should begin.
    pub fn on_sink_ready<S: PcmSink>(&mut self, sink: &S) -> bool {
        if self.state == SessionState::Starting {
            self.state = SessionState::Active;
        }
        self.try_begin_drain(sink)
    }

    /// Enter Draining if there is something to replay and the player can
    /// take it. A drain already in progress is never restarted.
    pub fn try_begin_drain<S: PcmSink>(&mut self, sink: &S) -> bool {
        if self.state != SessionState::Active
            || self.sink_abandoned
            || self.queue.is_empty()
            || !sink.is_ready()
        {
            return false;
        }
        tracing::debug!(chunks = self.queue.len(), "processing buffered audio chunks");
        self.state = SessionState::Draining;
        true
    }

    /// Deliver the oldest queued chunk. The chunk leaves the queue only once
    /// the player has accepted it.
    pub fn drain_next<S: PcmSink>(&mut self, sink: &mut S) -> DrainStep {
        if self.state != SessionState::Draining {
            return DrainStep::Aborted;
        }

        let Some(chunk) = self.queue.front().cloned() else {
            self.state = SessionState::Active;
            return DrainStep::Finished;
        };

        if !sink.is_ready() {
            self.state = SessionState::Active;
            return DrainStep::Aborted;
        }

        match sink.write(chunk) {
            Ok(()) => {
                self.queue.pop_delivered();
                self.stats.delivered_from_queue += 1;
                if self.queue.is_empty() {
                    self.state = SessionState::Active;
                    DrainStep::Finished
                } else {
                    DrainStep::Delivered {
                        remaining: self.queue.len(),
                    }
                }
            }
            Err(SinkError::Backpressure) => DrainStep::Stalled,
            Err(e) => {
                tracing::warn!(error = %e, remaining = self.queue.len(), "error playing buffered audio");
                self.state = SessionState::Active;
                sink.request_start();
                DrainStep::Aborted
            }
        }
    }

    /// The player exited or failed to launch. Any drain stops; the queue stays.
    pub fn on_sink_lost(&mut self) {
        if self.state == SessionState::Draining {
            tracing::debug!(remaining = self.queue.len(), "player lost mid-drain");
            self.state = SessionState::Active;
        }
    }

    /// The player will not come back. Queued and future audio is dropped.
    /// Returns how many queued chunks were dropped.
    pub fn abandon_sink(&mut self) -> usize {
        self.sink_abandoned = true;
        if self.state == SessionState::Draining {
            self.state = SessionState::Active;
        }
        let dropped = self.queue.discard();
        self.stats.dropped += dropped as u64;
        dropped
    }

    /// End the session. Returns how many queued chunks were discarded.
    pub fn close(&mut self) -> usize {
        self.state = SessionState::Closed;
        let discarded = self.queue.discard();
        self.stats.discarded += discarded as u64;
        discarded
    }

    fn enqueue(&mut self, chunk: Bytes) {
        self.queue.push(chunk);
        self.stats.queued += 1;
        tracing::trace!(total = self.queue.len(), "buffered audio chunk");
    }
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new()
    }
}
