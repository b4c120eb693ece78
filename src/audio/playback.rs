//! Audio Sink Controller: the external raw-PCM player process
//!
//! The controller owns at most one live player at a time. Each launch gets a
//! generation number; notices from older generations are ignored, so killing
//! a player never gets mistaken for the current one crashing.
//!
//! Writes never block: chunks go onto a bounded channel drained by a
//! supervisor task that owns the child's stdin.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::format::PcmFormat;
use super::{alsa_args, pulse_args, CommandSpec};
use crate::config::{AudioConfig, PlayerBackend, SinkConfig};
use crate::constants::SINK_CHANNEL_CAPACITY;
use crate::error::SinkError;

/// Readiness transitions reported by [`AudioSink::next_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A player instance launched and accepts audio
    Ready,
    /// The running player went away; a relaunch is scheduled
    Exited { code: Option<i32> },
    /// Launching a player failed; a relaunch is scheduled
    LaunchFailed { error: String },
    /// Relaunch budget exhausted; no further attempts will be made
    GaveUp { failures: u32 },
}

/// What the stream bridge needs from a sink
pub trait PcmSink {
    fn is_ready(&self) -> bool;

    /// Hand one chunk to the player without waiting
    fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    /// Ask for a player to be (re)started if none is usable
    fn request_start(&mut self);
}

/// Player command for the configured backend
pub fn player_command(config: &AudioConfig) -> CommandSpec {
    let format = PcmFormat::new(config.sample_rate, config.speaker_channels);
    let device = config.output_device.as_deref();
    match &config.player {
        PlayerBackend::Paplay => CommandSpec::new("paplay", pulse_args(format, device)),
        PlayerBackend::Aplay => CommandSpec::new("aplay", alsa_args(format, device)),
        PlayerBackend::Command { program, args } => CommandSpec::new(program.clone(), args.clone()),
    }
}

#[derive(Debug)]
enum Notice {
    Spawned { generation: u64 },
    LaunchFailed { generation: u64, error: String },
    Exited { generation: u64, status: Option<ExitStatus> },
}

/// One launched player instance
struct PlayerHandle {
    pid: Option<u32>,
    input: mpsc::Sender<Bytes>,
    stop_tx: Option<oneshot::Sender<Duration>>,
    task: JoinHandle<()>,
}

impl PlayerHandle {
    /// End input, then kill after `grace`. Returns the supervisor task to await.
    fn stop(mut self, grace: Duration) -> JoinHandle<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(grace);
        }
        self.task
    }
}

/// Controller for the external playback process
pub struct AudioSink {
    spec: CommandSpec,
    policy: SinkConfig,

    generation: u64,
    ready: bool,
    current: Option<PlayerHandle>,
    /// Supervisors of players that were replaced or stopped
    retired: Vec<JoinHandle<()>>,

    notices_tx: mpsc::UnboundedSender<Notice>,
    notices_rx: mpsc::UnboundedReceiver<Notice>,

    relaunch_at: Option<Instant>,
    /// Consecutive failures since the last successful write
    failures: u32,
    gave_up: bool,
    stopped: bool,

    launches: u64,
    bytes_written: u64,
}

impl AudioSink {
    pub fn new(spec: CommandSpec, policy: SinkConfig) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            spec,
            policy,
            generation: 0,
            ready: false,
            current: None,
            retired: Vec::new(),
            notices_tx,
            notices_rx,
            relaunch_at: None,
            failures: 0,
            gave_up: false,
            stopped: false,
            launches: 0,
            bytes_written: 0,
        }
    }

    /// Sink for the configured player backend
    pub fn from_config(audio: &AudioConfig, policy: &SinkConfig) -> Self {
        Self::new(player_command(audio), policy.clone())
    }

    /// Launch a new player, force-terminating any previous instance.
    pub fn start(&mut self) {
        self.relaunch_at = None;
        self.stopped = false;
        self.retire_current(Duration::ZERO);

        self.generation += 1;
        let generation = self.generation;
        self.launches += 1;

        tracing::info!(command = %self.spec, "starting audio player");

        let mut child = match self
            .spec
            .command(Stdio::piped(), Stdio::null(), Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.launch_failed(generation, e.to_string());
                return;
            }
        };

        let Some(stdin) = child.stdin.take() else {
            let _ = child.start_kill();
            self.launch_failed(generation, "player stdin not captured".to_string());
            return;
        };
        let stderr = child.stderr.take();
        let pid = child.id();

        let (input_tx, input_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise_player(
            child,
            stdin,
            stderr,
            input_rx,
            stop_rx,
            self.notices_tx.clone(),
            generation,
        ));

        self.current = Some(PlayerHandle {
            pid,
            input: input_tx,
            stop_tx: Some(stop_tx),
            task,
        });
        self.ready = true;
        tracing::info!(pid = ?pid, "audio player process started");
        let _ = self.notices_tx.send(Notice::Spawned { generation });
    }

    /// Graceful end-of-input, then a forced kill after the grace period.
    /// Cancels any scheduled relaunch.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.relaunch_at = None;
        self.retire_current(self.policy.stop_grace);
    }

    /// [`stop`](Self::stop) and wait until every player process has been reaped.
    pub async fn shutdown(&mut self) {
        self.stop();
        for task in self.retired.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "audio player supervisor failed");
            }
        }
    }

    /// Wait for the next readiness transition.
    ///
    /// Also performs scheduled relaunches. Cancel-safe.
    pub async fn next_event(&mut self) -> SinkEvent {
        loop {
            let relaunch_at = self.relaunch_at;
            tokio::select! {
                Some(notice) = self.notices_rx.recv() => {
                    if let Some(event) = self.handle_notice(notice) {
                        return event;
                    }
                }
                _ = sleep_until_opt(relaunch_at) => {
                    tracing::info!(failures = self.failures, "relaunching audio player");
                    self.start();
                }
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|p| p.pid)
    }

    /// Whether a player instance is currently owned
    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn launches(&self) -> u64 {
        self.launches
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn relaunch_pending(&self) -> bool {
        self.relaunch_at.is_some()
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    fn retire_current(&mut self, grace: Duration) {
        self.ready = false;
        self.retired.retain(|task| !task.is_finished());
        if let Some(player) = self.current.take() {
            self.retired.push(player.stop(grace));
        }
    }

    fn launch_failed(&mut self, generation: u64, error: String) {
        tracing::error!(command = %self.spec, error = %error, "failed to launch audio player");
        self.ready = false;
        self.record_failure();
        let _ = self.notices_tx.send(Notice::LaunchFailed { generation, error });
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        if self.policy.exhausted(self.failures) {
            self.gave_up = true;
            self.relaunch_at = None;
            tracing::error!(failures = self.failures, "audio player keeps failing, giving up");
        } else {
            let delay = self.policy.relaunch_delay_for(self.failures);
            self.relaunch_at = Some(Instant::now() + delay);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "audio player relaunch scheduled");
        }
    }

    fn handle_notice(&mut self, notice: Notice) -> Option<SinkEvent> {
        match notice {
            Notice::Spawned { generation } if generation == self.generation && self.ready => {
                Some(SinkEvent::Ready)
            }
            Notice::LaunchFailed { generation, error } if generation == self.generation => {
                if self.gave_up {
                    Some(SinkEvent::GaveUp { failures: self.failures })
                } else {
                    Some(SinkEvent::LaunchFailed { error })
                }
            }
            Notice::Exited { generation, status }
                if generation == self.generation && self.current.is_some() =>
            {
                if let Some(player) = self.current.take() {
                    self.retired.push(player.task);
                }
                self.ready = false;
                let code = status.and_then(|s| s.code());
                tracing::warn!(code = ?code, "audio player process exited");

                if self.stopped {
                    return None;
                }
                self.record_failure();
                if self.gave_up {
                    Some(SinkEvent::GaveUp { failures: self.failures })
                } else {
                    Some(SinkEvent::Exited { code })
                }
            }
            stale => {
                tracing::trace!(?stale, "ignoring notice from a previous player");
                None
            }
        }
    }
}

impl PcmSink for AudioSink {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if !self.ready {
            return Err(SinkError::NotReady);
        }
        let player = self.current.as_ref().ok_or(SinkError::NotReady)?;
        let len = chunk.len() as u64;
        match player.input.try_send(chunk) {
            Ok(()) => {
                self.failures = 0;
                self.bytes_written += len;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.ready = false;
                Err(SinkError::Closed)
            }
        }
    }

    fn request_start(&mut self) {
        if self.ready || self.relaunch_at.is_some() || self.gave_up {
            return;
        }
        self.start();
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns one player process: feeds its stdin and reports when it exits
async fn supervise_player(
    mut child: Child,
    stdin: ChildStdin,
    stderr: Option<ChildStderr>,
    mut input: mpsc::Receiver<Bytes>,
    mut stop_rx: oneshot::Receiver<Duration>,
    notices: mpsc::UnboundedSender<Notice>,
    generation: u64,
) {
    if let Some(stderr) = stderr {
        tokio::spawn(log_player_output(stderr));
    }

    let mut stdin = Some(stdin);
    let status = loop {
        tokio::select! {
            status = child.wait() => break status.ok(),
            grace = &mut stop_rx => {
                let grace = grace.unwrap_or(Duration::ZERO);
                break finish_player(&mut child, stdin.take(), &mut input, grace).await;
            }
            chunk = input.recv(), if stdin.is_some() => match chunk {
                Some(chunk) => {
                    let Some(pipe) = stdin.as_mut() else { continue };
                    // A player that stops reading must not hold off a stop request
                    let stop = tokio::select! {
                        written = pipe.write_all(&chunk) => {
                            if let Err(e) = written {
                                tracing::warn!(error = %e, "write to audio player failed");
                                stdin = None;
                                let _ = child.start_kill();
                            }
                            None
                        }
                        grace = &mut stop_rx => Some(grace.unwrap_or(Duration::ZERO)),
                    };
                    if let Some(grace) = stop {
                        break finish_player(&mut child, stdin.take(), &mut input, grace).await;
                    }
                }
                // Controller dropped its sender: end of input
                None => stdin = None,
            },
        }
    };

    let _ = notices.send(Notice::Exited { generation, status });
}

/// Flush what is already queued, close stdin, and give the player `grace` to exit
async fn finish_player(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    input: &mut mpsc::Receiver<Bytes>,
    grace: Duration,
) -> Option<ExitStatus> {
    input.close();

    let graceful = async {
        if let Some(mut pipe) = stdin {
            while let Some(chunk) = input.recv().await {
                if pipe.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = pipe.shutdown().await;
        }
        child.wait().await
    };

    match tokio::time::timeout(grace, graceful).await {
        Ok(status) => status.ok(),
        Err(_) => {
            tracing::debug!("audio player did not exit in time, killing");
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

async fn log_player_output(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(status = %line.trim(), "audio player");
    }
}
