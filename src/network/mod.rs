//! Connection manager: listen or connect, one session per connection

pub mod connector;
pub mod listener;
pub mod tcp;

pub use connector::{Connector, ReconnectTimer};
pub use listener::Listener;
pub use tcp::{bind_listener, configure_stream, connect};

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{RelayConfig, Role};
use crate::error::Result;

/// Run the configured role until shutdown or a fatal error
pub async fn run(config: Arc<RelayConfig>, shutdown: watch::Receiver<bool>) -> Result<()> {
    match config.role.clone() {
        Role::Listen { port } => Listener::bind(port, config).await?.run(shutdown).await,
        Role::Connect { host, port } => Connector::new(host, port, config).run(shutdown).await,
    }
}
