//! Audio Source Controller: microphone capture
//!
//! A source produces s16le chunks on a tokio channel. Two implementations:
//! an in-process cpal stream running on its own thread, and an external
//! recorder process (`parec`, `arecord`, or any command) whose stdout is
//! forwarded chunk by chunk.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};

use super::device::find_input_device;
use super::format::{f32_to_s16le, i16_to_s16le, u16_to_s16le, PcmFormat};
use super::{alsa_args, pulse_args, CommandSpec};
use crate::config::{AudioConfig, CaptureBackend};
use crate::constants::CAPTURE_CHANNEL_CAPACITY;
use crate::error::AudioError;

/// How often a parked capture thread rechecks whether the session still listens
const CAPTURE_IDLE_CHECK: Duration = Duration::from_millis(100);

/// One microphone capture stream
pub trait AudioSource: Send {
    /// Begin capture. Captured chunks arrive on the returned channel, which
    /// closes when capture ends for any reason.
    fn start(&mut self) -> Result<mpsc::Receiver<Bytes>, AudioError>;

    /// Stop capture and release the device. Safe to call repeatedly.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Build the source selected by the configuration
pub fn build_source(config: &AudioConfig, chunk_size: usize) -> Box<dyn AudioSource> {
    let format = PcmFormat::new(config.sample_rate, config.mic_channels);
    let device = config.input_device.as_deref();

    let spec = match &config.capture {
        CaptureBackend::Cpal => {
            return Box::new(CpalCapture::new(config.input_device.clone(), format));
        }
        CaptureBackend::Parec => CommandSpec::new("parec", pulse_args(format, device)),
        CaptureBackend::Arecord => CommandSpec::new("arecord", alsa_args(format, device)),
        CaptureBackend::Command { program, args } => CommandSpec::new(program.clone(), args.clone()),
    };
    Box::new(CommandCapture::new(spec, chunk_size))
}

/// Non-blocking hand-off from the audio callback to the session
#[derive(Clone)]
struct ChunkSender {
    tx: mpsc::Sender<Bytes>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl ChunkSender {
    fn send(&self, chunk: Bytes) {
        if !self.running.load(Ordering::Relaxed) || chunk.is_empty() {
            return;
        }
        match self.tx.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.running.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Microphone capture through cpal on a dedicated thread
pub struct CpalCapture {
    /// Device name (None = default input)
    device_name: Option<String>,

    format: PcmFormat,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Chunks dropped because the session fell behind
    dropped_chunks: Arc<AtomicU64>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>, format: PcmFormat) -> Self {
        Self {
            device_name,
            format,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            dropped_chunks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

impl AudioSource for CpalCapture {
    fn start(&mut self) -> Result<mpsc::Receiver<Bytes>, AudioError> {
        if self.thread_handle.is_some() {
            return Err(AudioError::StreamError("capture already started".to_string()));
        }

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let sender = ChunkSender {
            tx,
            running: self.running.clone(),
            dropped: self.dropped_chunks.clone(),
        };
        let running = self.running.clone();
        let device_name = self.device_name.clone();
        let format = self.format;

        self.running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(device_name.as_deref(), format, sender) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "microphone capture failed to start");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };

                tracing::debug!(
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "microphone capture started"
                );

                // Keep the stream alive while running; dropping it stops capture
                hold_until_stopped(&running);
                drop(stream);
                tracing::debug!("microphone capture stopped");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            // The thread is parked, so the join only waits for the stream to drop
            handle.thread().unpark();
            let _ = handle.join();

            let dropped = self.dropped_chunks();
            if dropped > 0 {
                tracing::warn!(dropped, "microphone chunks dropped while the session fell behind");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        format!(
            "cpal:{} ({} Hz, {} ch)",
            self.device_name.as_deref().unwrap_or("default"),
            self.format.sample_rate,
            self.format.channels
        )
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Park the calling thread until `running` clears. Wakes on unpark, and
/// periodically to notice a sender that stopped itself.
fn hold_until_stopped(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        thread::park_timeout(CAPTURE_IDLE_CHECK);
    }
}

fn report_stream_error(err: cpal::StreamError) {
    tracing::error!(error = %err, "microphone stream error");
}

/// Open and start the cpal input stream, converting to s16le in the callback
fn open_stream(
    device_name: Option<&str>,
    format: PcmFormat,
    sender: ChunkSender,
) -> Result<cpal::Stream, AudioError> {
    let device = find_input_device(device_name)?;
    let sample_format = device.default_input_config()?.sample_format();

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| sender.send(f32_to_s16le(data)),
            report_stream_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| sender.send(i16_to_s16le(data)),
            report_stream_error,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| sender.send(u16_to_s16le(data)),
            report_stream_error,
            None,
        )?,
        other => {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", other)));
        }
    };

    stream.play()?;
    Ok(stream)
}

/// Microphone capture through an external recorder process
pub struct CommandCapture {
    spec: CommandSpec,
    chunk_size: usize,
    running: Arc<AtomicBool>,
    /// Dropping or firing this stops the recorder
    kill_tx: Option<oneshot::Sender<()>>,
}

impl CommandCapture {
    pub fn new(spec: CommandSpec, chunk_size: usize) -> Self {
        Self {
            spec,
            chunk_size: chunk_size.max(1),
            running: Arc::new(AtomicBool::new(false)),
            kill_tx: None,
        }
    }
}

impl AudioSource for CommandCapture {
    fn start(&mut self) -> Result<mpsc::Receiver<Bytes>, AudioError> {
        if self.kill_tx.is_some() {
            return Err(AudioError::StreamError("capture already started".to_string()));
        }

        let spawn_failed = |reason: String| AudioError::SpawnFailed {
            program: self.spec.program.clone(),
            reason,
        };

        let mut child = self
            .spec
            .command(
                std::process::Stdio::null(),
                std::process::Stdio::piped(),
                std::process::Stdio::null(),
            )
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_tx = Some(kill_tx);
        self.running.store(true, Ordering::SeqCst);

        tracing::debug!(command = %self.spec, "recorder process started");

        let running = self.running.clone();
        let chunk_size = self.chunk_size;
        tokio::spawn(async move {
            pump_recorder(child, stdout, tx, kill_rx, chunk_size).await;
            running.store(false, Ordering::SeqCst);
        });

        Ok(rx)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        self.spec.to_string()
    }
}

impl Drop for CommandCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward recorder stdout until it ends, the receiver goes away, or a stop is requested
async fn pump_recorder(
    mut child: tokio::process::Child,
    mut stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<Bytes>,
    mut kill_rx: oneshot::Receiver<()>,
    chunk_size: usize,
) {
    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        tokio::select! {
            biased;
            _ = &mut kill_rx => break,
            read = stdout.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("recorder output closed");
                    break;
                }
                Ok(_) => {
                    if tx.send(buf.freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "recorder read failed");
                    break;
                }
            },
        }
    }

    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "recorder process exited"),
        Err(e) => tracing::warn!(error = %e, "failed to reap recorder process"),
    }
}
