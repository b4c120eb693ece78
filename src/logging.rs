//! Tracing setup: console output, optionally teed to a log file

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Default filter directive when `RUST_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `debug`. When `log_file` is given the
/// file is truncated and receives the same events as the console.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| Error::Config(format!("cannot open log file {}: {}", path.display(), e)))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
    }

    #[test]
    fn test_log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voicechat.log");

        // The only test installing the global subscriber
        init(true, Some(&path)).unwrap();
        tracing::info!("log file smoke test");
        assert!(path.exists());

        assert!(init(true, None).is_err());
    }
}
