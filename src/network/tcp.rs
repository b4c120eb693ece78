//! TCP socket helpers

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{ConnectFailure, NetworkError};

const LISTEN_BACKLOG: i32 = 128;

/// Apply keep-alive and low-latency options to an established connection
pub fn configure_stream(stream: &TcpStream, keepalive: Duration) -> Result<(), NetworkError> {
    let sock = SockRef::from(stream);

    let params = TcpKeepalive::new().with_time(keepalive);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios", windows))]
    let params = params.with_interval(keepalive);

    sock.set_tcp_keepalive(&params)
        .map_err(|e| NetworkError::SocketOption(format!("SO_KEEPALIVE: {}", e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| NetworkError::SocketOption(format!("TCP_NODELAY: {}", e)))?;
    Ok(())
}

/// Bind the listening socket on all interfaces.
///
/// Prefers a dual-stack `[::]` socket that also accepts IPv4 peers, and
/// falls back to `0.0.0.0` on hosts without IPv6.
pub async fn bind_listener(port: u16) -> Result<TcpListener, NetworkError> {
    match bind_dual_stack(port) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            return Err(NetworkError::AddrInUse { port })
        }
        Err(e) => tracing::debug!(error = %e, "dual-stack bind unavailable, using IPv4 only"),
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            NetworkError::AddrInUse { port }
        } else {
            NetworkError::BindFailed(format!("{}: {}", addr, e))
        }
    })
}

fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// `host:port`, bracketing IPv6 literals
pub fn display_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Dial the peer, giving up after `timeout`
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let target = display_target(host, port);
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::ConnectFailed {
            target,
            cause: ConnectFailure::classify(&e),
            detail: e.to_string(),
        }),
        Err(_) => Err(NetworkError::ConnectFailed {
            target,
            cause: ConnectFailure::TimedOut,
            detail: format!("no answer within {} ms", timeout.as_millis()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_target() {
        assert_eq!(display_target("10.0.0.5", 3333), "10.0.0.5:3333");
        assert_eq!(display_target("::1", 3333), "[::1]:3333");
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let first = bind_listener(0).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let err = bind_listener(port).await.unwrap_err();
        assert!(matches!(err, NetworkError::AddrInUse { port: p } if p == port));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_listener_accepts_ipv4_peers() {
        let listener = bind_listener(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (client, accepted) = tokio::join!(
            TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port))),
            listener.accept()
        );
        client.unwrap();
        let (_, peer) = accepted.unwrap();
        assert!(peer.ip().to_canonical().is_loopback());
    }

    #[tokio::test]
    async fn test_connect_refused_is_classified() {
        // Grab a free port, then close it so nothing listens there
        let port = {
            let closed = bind_listener(0).await.unwrap();
            closed.local_addr().unwrap().port()
        };

        let err = connect("127.0.0.1", port, Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.connect_failure(), Some(ConnectFailure::Refused));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_and_configure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect("127.0.0.1", port, Duration::from_secs(2)).await.unwrap();
        configure_stream(&stream, Duration::from_secs(5)).unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
