//! TCP relays for host ports containers must reach
//!
//! The proxy's listeners bind loopback by default, which containers cannot
//! reach through the bridge. A [`TcpRelay`] listens on another local address
//! (the bridge gateway) and pipes each connection to the loopback target.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Forwards every connection on `local_addr` to `target`. Stops when dropped.
pub struct TcpRelay {
    local_addr: SocketAddr,
    target: SocketAddr,
    task: JoinHandle<()>,
}

impl TcpRelay {
    pub async fn bind(listen: SocketAddr, target: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, %target, "Relay listening");
        let task = tokio::spawn(accept_loop(listener, target));
        Ok(Self {
            local_addr,
            target,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, target: SocketAddr) {
    loop {
        match listener.accept().await {
            Ok((inbound, peer)) => {
                tokio::spawn(relay_connection(inbound, peer, target));
            }
            Err(e) => {
                warn!(%target, error = %e, "Relay accept failed");
            }
        }
    }
}

async fn relay_connection(mut inbound: TcpStream, peer: SocketAddr, target: SocketAddr) {
    let mut outbound = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%peer, %target, error = %e, "Relay target unreachable");
            return;
        }
    };
    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((to_target, to_peer)) => {
            debug!(%peer, %target, to_target, to_peer, "Relay connection closed");
        }
        Err(e) => {
            debug!(%peer, %target, error = %e, "Relay connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn upper_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let reply = buf[..n].to_ascii_uppercase();
                        if stream.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_pipes_both_directions() {
        let target = upper_echo_server().await;
        let relay = TcpRelay::bind("127.0.0.1:0".parse().unwrap(), target)
            .await
            .unwrap();
        assert_ne!(relay.local_addr().port(), target.port());
        assert_eq!(relay.target(), target);

        for _ in 0..2 {
            let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING");
        }
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_connection() {
        let unused = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let relay = TcpRelay::bind("127.0.0.1:0".parse().unwrap(), unused)
            .await
            .unwrap();

        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("relay should close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_dropping_relay_stops_listening() {
        let target = upper_echo_server().await;
        let relay = TcpRelay::bind("127.0.0.1:0".parse().unwrap(), target)
            .await
            .unwrap();
        let addr = relay.local_addr();
        drop(relay);
        tokio::task::yield_now().await;

        // The port can be bound again once the listener is gone
        let mut rebound = false;
        for _ in 0..20 {
            if TcpListener::bind(addr).await.is_ok() {
                rebound = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert!(rebound);
    }
}
