//! Audio subsystem: microphone capture, player process control, queueing

pub mod buffer;
pub mod capture;
pub mod device;
pub mod format;
pub mod playback;

pub use buffer::PendingQueue;
pub use capture::{build_source, AudioSource, CommandCapture, CpalCapture};
pub use device::{find_input_device, list_devices, AudioDeviceInfo};
pub use format::PcmFormat;
pub use playback::{AudioSink, PcmSink, SinkEvent};

use std::process::Stdio;

/// Program and arguments for an external audio process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// A tokio command with all three stdio streams piped or nulled as given.
    pub(crate) fn command(&self, stdin: Stdio, stdout: Stdio, stderr: Stdio) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Arguments shared by `paplay` and `parec`
fn pulse_args(format: PcmFormat, device: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--format=s16le".to_string(),
        format!("--rate={}", format.sample_rate),
        format!("--channels={}", format.channels),
        "--raw".to_string(),
    ];
    if let Some(device) = device {
        args.push(format!("--device={}", device));
    }
    args
}

/// Arguments shared by `aplay` and `arecord`
fn alsa_args(format: PcmFormat, device: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-q".to_string(),
        "-t".to_string(),
        "raw".to_string(),
        "-f".to_string(),
        "S16_LE".to_string(),
        "-r".to_string(),
        format.sample_rate.to_string(),
        "-c".to_string(),
        format.channels.to_string(),
    ];
    if let Some(device) = device {
        args.push("-D".to_string());
        args.push(device.to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_args() {
        let args = pulse_args(PcmFormat::new(44_100, 1), None);
        assert_eq!(args, vec!["--format=s16le", "--rate=44100", "--channels=1", "--raw"]);

        let args = pulse_args(PcmFormat::new(44_100, 2), Some("alsa_output.usb"));
        assert_eq!(args.last().map(String::as_str), Some("--device=alsa_output.usb"));
        assert!(args.contains(&"--channels=2".to_string()));
    }

    #[test]
    fn test_alsa_args() {
        let args = alsa_args(PcmFormat::new(44_100, 1), Some("plughw:0,0"));
        assert_eq!(
            args,
            vec!["-q", "-t", "raw", "-f", "S16_LE", "-r", "44100", "-c", "1", "-D", "plughw:0,0"]
        );
    }

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new("paplay", ["--raw"]);
        assert_eq!(spec.to_string(), "paplay --raw");
    }
}
