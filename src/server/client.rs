//! Client connection handling
//!
//! Each accepted socket gets a reader task and a writer task. The reader
//! decodes frames and injects the requests into the connection manager; the
//! writer drains a FIFO queue of outbound messages so every client sees its
//! messages in enqueue order with at most one write in flight.
//!
//! Protocol violations (zero-size frame, undecodable or non-request
//! payload) answer with an error message and then close the connection
//! gracefully, letting the error drain first.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::manager::ManagerEvent;
use crate::protocol::frame::{FrameCodec, FrameError};
use crate::protocol::message::{Body, Envelope, ErrorKind};

/// Identifier of one client connection, unique for the process lifetime
pub type ClientId = u64;

/// Operations accepted by a client's writer task
enum ClientOp {
    Send(Envelope),
    /// Close once every previously queued message has been written
    Drain,
}

/// Handle the manager keeps per connected client
#[derive(Clone)]
pub struct ClientHandle {
    ops: mpsc::UnboundedSender<ClientOp>,
    hard_stop: CancellationToken,
    pub peer: String,
}

impl ClientHandle {
    /// Queue a message for delivery
    pub fn send(&self, body: Body) {
        let _ = self.ops.send(ClientOp::Send(Envelope::from(body)));
    }

    /// Stop the connection. Graceful lets the outbound queue drain first.
    pub fn stop(&self, graceful: bool) {
        if graceful {
            let _ = self.ops.send(ClientOp::Drain);
        } else {
            self.hard_stop.cancel();
        }
    }
}

/// Spawn the reader/writer pair for an accepted socket
pub fn spawn(
    id: ClientId,
    stream: TcpStream,
    peer: String,
    manager_tx: mpsc::UnboundedSender<ManagerEvent>,
) -> ClientHandle {
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    let hard_stop = CancellationToken::new();

    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, FrameCodec);
    let writer = FramedWrite::new(write_half, FrameCodec);

    let handle = ClientHandle {
        ops: ops_tx.clone(),
        hard_stop: hard_stop.clone(),
        peer: peer.clone(),
    };

    tokio::spawn(read_loop(
        id,
        reader,
        ops_tx,
        manager_tx,
        hard_stop.clone(),
        peer.clone(),
    ));
    tokio::spawn(write_loop(writer, ops_rx, hard_stop, peer));

    handle
}

async fn read_loop(
    id: ClientId,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    ops: mpsc::UnboundedSender<ClientOp>,
    manager_tx: mpsc::UnboundedSender<ManagerEvent>,
    hard_stop: CancellationToken,
    peer: String,
) {
    loop {
        let item = tokio::select! {
            _ = hard_stop.cancelled() => break,
            item = reader.next() => item,
        };

        match item {
            None => {
                info!(%peer, "client disconnected");
                break;
            }
            Some(Ok(envelope)) => match envelope.body {
                Some(body) if body.is_request() && body.wire_valid() => {
                    debug!(%peer, request = body.type_name(), "client request");
                    if manager_tx
                        .send(ManagerEvent::Request { client: id, body })
                        .is_err()
                    {
                        break;
                    }
                }
                Some(body) => {
                    warn!(%peer, message = body.type_name(), "client sent a non-request message");
                    fail_client(&ops, ErrorKind::InvalidType);
                    break;
                }
                None => {
                    warn!(%peer, "client frame carried no message");
                    fail_client(&ops, ErrorKind::InvalidType);
                    break;
                }
            },
            Some(Err(FrameError::ZeroSize)) => {
                warn!(%peer, "client sent a zero-size frame");
                fail_client(&ops, ErrorKind::InvalidSize);
                break;
            }
            Some(Err(FrameError::Decode(e))) => {
                warn!(%peer, error = %e, "client frame did not decode");
                fail_client(&ops, ErrorKind::InvalidType);
                break;
            }
            Some(Err(FrameError::Oversized(_))) => {
                fail_client(&ops, ErrorKind::InvalidSize);
                break;
            }
            Some(Err(FrameError::Io(e))) => {
                error!(%peer, error = %e, "client read failed");
                break;
            }
        }
    }

    let _ = manager_tx.send(ManagerEvent::Closed { client: id });
}

/// Send a protocol-violation error and let the writer drain it before
/// closing
fn fail_client(ops: &mpsc::UnboundedSender<ClientOp>, kind: ErrorKind) {
    let _ = ops.send(ClientOp::Send(Envelope::from(Body::error(kind))));
    let _ = ops.send(ClientOp::Drain);
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut ops: mpsc::UnboundedReceiver<ClientOp>,
    hard_stop: CancellationToken,
    peer: String,
) {
    loop {
        let op = tokio::select! {
            _ = hard_stop.cancelled() => break,
            op = ops.recv() => op,
        };

        match op {
            None | Some(ClientOp::Drain) => break,
            Some(ClientOp::Send(envelope)) => {
                if let Err(e) = writer.send(envelope).await {
                    debug!(%peer, error = %e, "client write failed");
                    break;
                }
            }
        }
    }

    // Dropping the halves closes the socket; make the shutdown explicit
    // so queued data is flushed where possible.
    let _ = writer.close().await;
}
