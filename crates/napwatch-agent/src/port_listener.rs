use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use tokio::net::TcpSocket;

const FUSER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRelease {
    Free,
    Released,
    Busy,
}

/// Wake-on-connect listener for the game port.
///
/// The listener only exists for the duration of one `listen` call, so the
/// backing server can bind the port as soon as we return.
#[derive(Debug, Clone)]
pub struct PortListener {
    force_release: bool,
}

impl PortListener {
    pub fn new(force_release: bool) -> Self {
        Self { force_release }
    }

    /// Accepts at most one connection within `timeout` and returns its peer.
    /// The accepted stream and the listening socket are closed on return.
    pub async fn listen(&self, port: u16, timeout: Duration) -> anyhow::Result<Option<SocketAddr>> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = TcpSocket::new_v4().context("create listening socket")?;
        socket.set_reuseaddr(true).context("set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("bind port {port}"))?;
        let listener = socket.listen(1).with_context(|| format!("listen on port {port}"))?;

        let accepted = tokio::time::timeout(timeout, listener.accept()).await;
        drop(listener);

        match accepted {
            Err(_) => Ok(None),
            Ok(Ok((stream, peer))) => {
                drop(stream);
                tracing::info!(%peer, port, "connection attempt on game port");
                Ok(Some(peer))
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("accept on port {port}")),
        }
    }

    /// Best-effort release of the port. Never fails; safe to call repeatedly.
    pub async fn release(&self, port: u16) -> PortRelease {
        if !is_bound(port) {
            return PortRelease::Free;
        }
        if !self.force_release {
            tracing::debug!(port, "port is held by another process; leaving it");
            return PortRelease::Busy;
        }

        let target = format!("{port}/tcp");
        let mut cmd = tokio::process::Command::new("fuser");
        cmd.arg("-k").arg(&target).kill_on_drop(true);
        match tokio::time::timeout(FUSER_TIMEOUT, cmd.output()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, port, "fuser failed"),
            Err(_) => tracing::warn!(port, "fuser timed out"),
        }

        // Give the kernel a moment to tear the socket down.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if is_bound(port) {
            tracing::warn!(port, "port still held after forced release");
            PortRelease::Busy
        } else {
            tracing::info!(port, "port released");
            PortRelease::Released
        }
    }
}

/// True when something else listens on the port (a bind attempt fails with
/// `AddrInUse`). `SO_REUSEADDR` keeps lingering TIME_WAIT sockets from
/// counting as a listener. Other bind errors are treated as "not bound".
pub fn is_bound(port: u16) -> bool {
    let probe = TcpSocket::new_v4().and_then(|s| {
        s.set_reuseaddr(true)?;
        s.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    });
    match probe {
        Ok(()) => false,
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            tracing::debug!(error = %e, port, "port probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener as StdTcpListener, time::Instant};

    use super::*;

    fn free_port() -> u16 {
        let l = StdTcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn listen_times_out_and_unbinds() {
        let port = free_port();
        let listener = PortListener::new(false);

        let started = Instant::now();
        let got = listener.listen(port, Duration::from_secs(1)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(got.is_none());
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");

        // The port must be bindable right away.
        StdTcpListener::bind(("0.0.0.0", port)).expect("port should be free after listen");
    }

    #[tokio::test]
    async fn listen_returns_peer_on_connect() {
        let port = free_port();
        let listener = PortListener::new(false);

        let connector = tokio::spawn(async move {
            for _ in 0..50 {
                if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        });

        let peer = listener.listen(port, Duration::from_secs(5)).await.unwrap();
        assert!(connector.await.unwrap());
        let peer = peer.expect("expected a connection");
        assert!(peer.ip().is_loopback());
        assert!(!is_bound(port));
    }

    #[tokio::test]
    async fn repeated_listens_do_not_leak_the_port() {
        let port = free_port();
        let listener = PortListener::new(false);
        for _ in 0..5 {
            let got = listener
                .listen(port, Duration::from_millis(50))
                .await
                .unwrap();
            assert!(got.is_none());
        }
        assert!(!is_bound(port));
    }

    #[tokio::test]
    async fn release_is_idempotent_when_free() {
        let port = free_port();
        let listener = PortListener::new(false);
        assert_eq!(listener.release(port).await, PortRelease::Free);
        assert_eq!(listener.release(port).await, PortRelease::Free);
    }

    #[tokio::test]
    async fn release_without_force_leaves_holder_alone() {
        let holder = StdTcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let listener = PortListener::new(false);
        assert_eq!(listener.release(port).await, PortRelease::Busy);
        drop(holder);
    }
}
