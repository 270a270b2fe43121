//! Client listener
//!
//! Binds the listen endpoint and hands accepted sockets to the connection
//! manager. IPv6 endpoints try to disable `IPV6_V6ONLY` before binding so a
//! single socket also serves v4-mapped clients; kernels that refuse keep
//! the v6-only behavior.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::manager::ManagerEvent;

/// Bind the listen socket with reuse-addr and dual-stack options applied
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Best effort; not every platform allows flipping this.
        let _ = socket.set_only_v6(false);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

/// Accept clients until cancelled
pub async fn run(
    listener: TcpListener,
    manager_tx: mpsc::UnboundedSender<ManagerEvent>,
    cancel: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "listening for clients"),
        Err(_) => info!("listening for clients"),
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("closing client listener");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if manager_tx
                    .send(ManagerEvent::Accepted { stream, peer })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address_in_use() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let err = bind(addr).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
