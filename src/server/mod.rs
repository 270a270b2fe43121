//! Client-facing side of the gateway: listener, client sessions, the
//! connection manager and the background pollers, plus the wiring that
//! assembles them with the MRC stack into a running service.

pub mod acceptor;
pub mod client;
pub mod manager;
pub mod poller;
pub mod scanbus;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::config::GatewayConfig;
use crate::core::mrc::link::{MrcLink, MrcLinkHandle};
use crate::core::mrc::queue::RequestQueue;
use crate::core::transport::traits::MrcTransport;
use manager::ConnectionManager;
use poller::Poller;
use scanbus::ScanbusPoller;

/// Handles to a running gateway
pub struct Gateway {
    pub local_addr: SocketAddr,
    pub link: MrcLinkHandle,
    cancel: CancellationToken,
}

impl Gateway {
    /// Stop everything: the MRC link (without reconnect), the listener,
    /// all client connections and the pollers
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Wire up and spawn all gateway tasks on the current runtime
pub fn start(
    transport: Box<dyn MrcTransport>,
    listener: TcpListener,
    config: GatewayConfig,
) -> std::io::Result<Gateway> {
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();

    let (link, link_handle) = MrcLink::new(transport, config.link.clone(), cancel.child_token());
    let (queue, queue_handle) =
        RequestQueue::new(link_handle.clone(), config.link.clone(), cancel.child_token());

    let (manager_tx, manager_rx) = mpsc::unbounded_channel();

    let (poller, poller_handle) = Poller::new(
        queue_handle.clone(),
        manager_tx.clone(),
        config.poller.poll_interval,
        cancel.child_token(),
    );
    let (scanbus, scanbus_handle) = ScanbusPoller::new(
        queue_handle.clone(),
        manager_tx.clone(),
        config.poller.scanbus_interval,
        cancel.child_token(),
    );

    // The manager subscribes to status events inside new(), before the link
    // task runs, so it observes the very first transition.
    let manager = ConnectionManager::new(
        link_handle.clone(),
        queue_handle,
        poller_handle,
        scanbus_handle,
        manager_rx,
        manager_tx.clone(),
        cancel.child_token(),
    );

    tokio::spawn(manager.run());
    tokio::spawn(poller.run());
    tokio::spawn(scanbus.run());
    tokio::spawn(queue.run());
    tokio::spawn(link.run());
    tokio::spawn(acceptor::run(listener, manager_tx, cancel.child_token()));

    Ok(Gateway {
        local_addr,
        link: link_handle,
        cancel,
    })
}
