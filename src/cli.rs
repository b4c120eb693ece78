//! Command line surface

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use crate::config::{RelayConfig, Role};
use crate::error::{Error, Result};

/// Duplex voice relay: microphone to peer, peer to speaker, over raw TCP
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
#[command(group(
    ArgGroup::new("role")
        .args(["connect", "listen", "list_devices"])
        .required(true)
        .multiple(false)
))]
pub struct Cli {
    /// Connect to a relay at host:port (hostname or IP)
    #[arg(short, long, value_name = "HOST:PORT")]
    pub connect: Option<String>,

    /// Accept connections on this port
    #[arg(short, long, value_name = "PORT")]
    pub listen: Option<u16>,

    /// Input device (default recording device when omitted)
    #[arg(short, long, value_name = "DEVICE")]
    pub input: Option<String>,

    /// Output device (default playback device when omitted)
    #[arg(short, long, value_name = "DEVICE")]
    pub output: Option<String>,

    /// Microphone channels: 1 = mono, 2 = stereo
    #[arg(short = 'a', long, value_parser = clap::value_parser!(u16).range(1..=2))]
    pub mic_channels: Option<u16>,

    /// Speaker channels: 1 = mono, 2 = stereo
    #[arg(short = 'b', long, value_parser = clap::value_parser!(u16).range(1..=2))]
    pub speaker_channels: Option<u16>,

    /// Verbose logging
    #[arg(short, long, value_name = "BOOL", default_value_t = false, action = clap::ArgAction::Set)]
    pub debug: bool,

    /// Also write the log to this file
    #[arg(short = 'g', long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE", env = "VOICE_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print available audio devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

impl Cli {
    /// Merge the flags over a base configuration (usually loaded from file).
    pub fn apply(&self, mut config: RelayConfig) -> Result<RelayConfig> {
        config.role = match (&self.connect, self.listen) {
            (Some(target), None) => Role::connect_to(target)?,
            (None, Some(port)) => Role::Listen { port },
            (None, None) if self.list_devices => config.role,
            _ => {
                return Err(Error::Config(
                    "exactly one of --connect or --listen is required".into(),
                ))
            }
        };

        if let Some(input) = self.input.as_deref().filter(|s| !s.is_empty()) {
            config.audio.input_device = Some(input.to_string());
        }
        if let Some(output) = self.output.as_deref().filter(|s| !s.is_empty()) {
            config.audio.output_device = Some(output.to_string());
        }
        if let Some(channels) = self.mic_channels {
            config.audio.mic_channels = channels;
        }
        if let Some(channels) = self.speaker_channels {
            config.audio.speaker_channels = channels;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load the config file (if any) and apply the flags on top.
    pub fn resolve(&self) -> Result<RelayConfig> {
        let base = RelayConfig::load_or_default(self.config.as_deref())?;
        self.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("relay").chain(args.iter().copied()))
    }

    #[test]
    fn test_listen_role() {
        let cli = parse(&["--listen", "3333", "--mic-channels", "1"]).unwrap();
        let config = cli.apply(RelayConfig::default()).unwrap();
        assert_eq!(config.role, Role::Listen { port: 3333 });
        assert!(!cli.debug);
    }

    #[test]
    fn test_connect_role_with_devices() {
        let cli = parse(&[
            "-c", "10.0.0.7:3333", "-i", "hw:1,0", "-o", "", "-b", "2", "-d", "true", "-g", "/tmp/voice.log",
        ])
        .unwrap();
        let config = cli.apply(RelayConfig::default()).unwrap();

        assert_eq!(config.role, Role::Connect { host: "10.0.0.7".into(), port: 3333 });
        assert_eq!(config.audio.input_device.as_deref(), Some("hw:1,0"));
        assert_eq!(config.audio.output_device, None);
        assert_eq!(config.audio.speaker_channels, 2);
        assert!(cli.debug);
        assert_eq!(cli.log.as_deref(), Some(std::path::Path::new("/tmp/voice.log")));
    }

    #[test]
    fn test_role_is_required_and_exclusive() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--listen", "3333", "--connect", "peer:3333"]).is_err());
        assert!(parse(&["--list-devices"]).is_ok());
    }

    #[test]
    fn test_channel_range_enforced() {
        assert!(parse(&["--listen", "3333", "--mic-channels", "3"]).is_err());
    }

    #[test]
    fn test_bad_connect_target_is_config_error() {
        let cli = parse(&["--connect", "peer-without-port"]).unwrap();
        let err = cli.apply(RelayConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }
}
