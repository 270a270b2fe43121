//! Connection manager
//!
//! Central actor owning the client set. It classifies incoming client
//! requests (MRC commands vs. gateway control), enforces the single-writer
//! rule for state-mutating commands, fans responses back out and broadcasts
//! notifications: write-access changes, silence mode, MRC status, polled
//! values and scanbus sweeps.
//!
//! Parameter sets converge through read-after-set: the MRC's own set reply
//! does not carry the resulting memory value, so every accepted set is
//! followed by an implicit read of the same address. The set reply is
//! suppressed unless it failed; the read result becomes the originator's
//! set result and everyone else's set notification.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{self, ClientHandle, ClientId};
use super::poller::PollerHandle;
use super::scanbus::ScanbusPollerHandle;
use crate::core::mrc::link::{MrcLinkHandle, StatusEvent};
use crate::core::mrc::queue::RequestQueueHandle;
use crate::protocol::message::{
    Body, ErrorKind, LinkStatus, MrcStatus, PollItem, PolledValues, ScanbusResult, SetResult,
    MAX_BUS, MAX_DEV, MAX_PAR,
};

/// Events driving the manager task
pub enum ManagerEvent {
    /// A new client socket was accepted
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// A connected client sent a request
    Request { client: ClientId, body: Body },
    /// A client connection ended
    Closed { client: ClientId },
    /// A queued MRC command completed
    MrcResponse {
        ctx: ResponseCtx,
        request: Body,
        response: Body,
    },
    /// A poll cycle finished with these values
    PollCycle { items: Vec<PolledValues> },
    /// A scanbus sweep of one bus finished
    ScanbusSwept { result: ScanbusResult },
}

/// Routing context attached to queued MRC commands
#[derive(Debug, Clone, Copy)]
pub enum ResponseCtx {
    /// Forward the response verbatim to this client
    Direct { client: ClientId },
    /// First phase of read-after-set: the set itself
    SetPhase { set_id: u64 },
    /// Second phase of read-after-set: the implicit read
    ReadBack { set_id: u64 },
}

struct PendingSet {
    origin: ClientId,
    requested: i32,
    /// The set reply was an error; drop the implicit read's result
    failed: bool,
}

/// The connection manager task
pub struct ConnectionManager {
    rx: mpsc::UnboundedReceiver<ManagerEvent>,
    self_tx: mpsc::UnboundedSender<ManagerEvent>,
    link: MrcLinkHandle,
    queue: RequestQueueHandle,
    status_events: Option<broadcast::Receiver<StatusEvent>>,
    poller: PollerHandle,
    scanbus: ScanbusPollerHandle,
    clients: HashMap<ClientId, ClientHandle>,
    next_client_id: ClientId,
    writer: Option<ClientId>,
    pending_sets: HashMap<u64, PendingSet>,
    next_set_id: u64,
    last_status: StatusEvent,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        link: MrcLinkHandle,
        queue: RequestQueueHandle,
        poller: PollerHandle,
        scanbus: ScanbusPollerHandle,
        rx: mpsc::UnboundedReceiver<ManagerEvent>,
        self_tx: mpsc::UnboundedSender<ManagerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let status_events = Some(link.subscribe_events());
        Self {
            rx,
            self_tx,
            link,
            queue,
            status_events,
            poller,
            scanbus,
            clients: HashMap::new(),
            next_client_id: 1,
            writer: None,
            pending_sets: HashMap::new(),
            next_set_id: 1,
            last_status: StatusEvent {
                status: LinkStatus::Stopped,
                reason: None,
                version: String::new(),
                has_read_multi: false,
            },
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            let event = {
                let status_events = self.status_events.as_mut();
                let has_status = status_events.is_some();
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.stop_all();
                        return;
                    }
                    event = self.rx.recv() => match event {
                        Some(event) => Some(event),
                        None => return,
                    },
                    status = async { status_events.expect("status gate").recv().await },
                            if has_status => {
                        match status {
                            Ok(ev) => {
                                self.handle_status_event(ev);
                                None
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "lagged behind MRC status events");
                                None
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                self.status_events = None;
                                None
                            }
                        }
                    }
                }
            };

            if let Some(event) = event {
                self.handle_event(event);
            }
        }
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Accepted { stream, peer } => self.handle_accepted(stream, peer),
            ManagerEvent::Request { client, body } => self.handle_request(client, body),
            ManagerEvent::Closed { client } => self.handle_closed(client),
            ManagerEvent::MrcResponse {
                ctx,
                request,
                response,
            } => self.handle_mrc_response(ctx, request, response),
            ManagerEvent::PollCycle { items } => {
                self.broadcast(Body::NotifyPolledItems(
                    crate::protocol::message::PolledItemsNotification { items },
                ));
            }
            ManagerEvent::ScanbusSwept { result } => {
                self.broadcast(Body::NotifyScanbus(result));
            }
        }
    }

    // -- client lifecycle ---------------------------------------------------

    fn handle_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_client_id;
        self.next_client_id += 1;

        let handle = client::spawn(id, stream, peer.to_string(), self.self_tx.clone());
        info!(%peer, client = id, "client connected");

        handle.send(Body::NotifyMrcStatus(self.status_message()));
        handle.send(Body::notify_silenced(self.link.is_silenced()));

        let first_client = self.clients.is_empty();
        if first_client {
            self.writer = Some(id);
            handle.send(Body::notify_write_access(true, false));
        } else {
            handle.send(Body::notify_write_access(false, self.writer.is_none()));
        }

        self.clients.insert(id, handle);

        if first_client {
            self.maybe_start_pollers();
        }
    }

    fn handle_closed(&mut self, client: ClientId) {
        let Some(handle) = self.clients.remove(&client) else {
            return;
        };
        info!(peer = %handle.peer, client, "client removed");
        // Graceful: a final error frame may still be draining.
        handle.stop(true);
        self.poller.remove_client(client);

        if self.writer == Some(client) {
            // A lone survivor inherits write access directly.
            self.writer = if self.clients.len() == 1 {
                self.clients.keys().next().copied()
            } else {
                None
            };
            self.notify_write_access_change(Some(client));
        }

        if self.clients.is_empty() {
            self.stop_pollers();
        }
    }

    // -- request classification ---------------------------------------------

    fn handle_request(&mut self, client: ClientId, body: Body) {
        if !body.is_request() {
            // The client task already rejects these; a race on disconnect
            // may still deliver one.
            self.send_to(client, Body::error(ErrorKind::InvalidType));
            if let Some(handle) = self.clients.get(&client) {
                handle.stop(true);
            }
            return;
        }

        if body.is_mrc_request() {
            self.handle_mrc_request(client, body);
        } else {
            self.handle_control_request(client, body);
        }
    }

    fn handle_mrc_request(&mut self, client: ClientId, body: Body) {
        if let Some(kind) = body.address_error() {
            self.send_to(client, Body::error(kind));
            return;
        }

        if body.is_mrc_write_request() && self.writer != Some(client) {
            debug!(client, request = body.type_name(), "write permission denied");
            self.send_to(client, Body::error(ErrorKind::PermissionDenied));
            return;
        }

        if let Body::Set(set) = body {
            // Read-after-set: queue the set, then an implicit read of the
            // same address.
            let set_id = self.next_set_id;
            self.next_set_id += 1;
            self.pending_sets.insert(
                set_id,
                PendingSet {
                    origin: client,
                    requested: set.value,
                    failed: false,
                },
            );
            self.queue_with_ctx(Body::Set(set), ResponseCtx::SetPhase { set_id });
            self.queue_with_ctx(
                Body::read(set.bus, set.dev, set.par, set.mirror),
                ResponseCtx::ReadBack { set_id },
            );
        } else {
            self.queue_with_ctx(body, ResponseCtx::Direct { client });
        }
    }

    fn queue_with_ctx(&self, body: Body, ctx: ResponseCtx) {
        let tx = self.self_tx.clone();
        self.queue.enqueue(body, move |request, response| {
            let _ = tx.send(ManagerEvent::MrcResponse {
                ctx,
                request,
                response,
            });
        });
    }

    fn handle_control_request(&mut self, client: ClientId, body: Body) {
        match body {
            Body::HasWriteAccess(_) => {
                self.send_to(client, Body::bool_response(self.writer == Some(client)));
            }
            Body::AcquireWriteAccess(r) => {
                let granted = self.writer.is_none() || r.force;
                if granted && self.writer != Some(client) {
                    let old_writer = self.writer.replace(client);
                    self.notify_write_access_change(old_writer);
                }
                self.send_to(client, Body::bool_response(granted));
            }
            Body::ReleaseWriteAccess(_) => {
                if self.writer == Some(client) {
                    self.writer = None;
                    self.send_to(client, Body::bool_response(true));
                    self.notify_write_access_change(Some(client));
                } else {
                    self.send_to(client, Body::error(ErrorKind::PermissionDenied));
                }
            }
            Body::IsSilenced(_) => {
                self.send_to(client, Body::bool_response(self.link.is_silenced()));
            }
            Body::SetSilenced(r) => {
                if self.writer != Some(client) {
                    self.send_to(client, Body::error(ErrorKind::PermissionDenied));
                    return;
                }
                info!(silenced = r.silenced, "silent mode changed");
                self.link.set_silenced(r.silenced);
                self.broadcast(Body::notify_silenced(r.silenced));
                if r.silenced {
                    self.stop_pollers();
                } else {
                    self.maybe_start_pollers();
                }
                self.send_to(client, Body::bool_response(true));
            }
            Body::MrcStatusRequest(_) => {
                self.send_to(client, Body::MrcStatusResponse(self.status_message()));
            }
            Body::SetPollItems(r) => match expand_poll_items(&r.items) {
                Ok(set) => {
                    self.poller.set_items(client, set);
                    self.send_to(client, Body::bool_response(true));
                }
                Err(kind) => self.send_to(client, Body::error(kind)),
            },
            other => {
                warn!(request = other.type_name(), "unhandled control request");
                self.send_to(client, Body::error(ErrorKind::InvalidType));
            }
        }
    }

    // -- MRC responses ------------------------------------------------------

    fn handle_mrc_response(&mut self, ctx: ResponseCtx, _request: Body, response: Body) {
        match ctx {
            ResponseCtx::Direct { client } => {
                self.send_to(client, response);
            }
            ResponseCtx::SetPhase { set_id } => {
                if let Body::Error(_) = response {
                    // Forward the failure; the implicit read that follows is
                    // dropped when it completes.
                    if let Some(pending) = self.pending_sets.get_mut(&set_id) {
                        pending.failed = true;
                        let origin = pending.origin;
                        self.send_to(origin, response);
                    }
                }
                // The successful set reply is suppressed; the read-back
                // result is what clients get to see.
            }
            ResponseCtx::ReadBack { set_id } => {
                let Some(pending) = self.pending_sets.remove(&set_id) else {
                    return;
                };
                if pending.failed {
                    return;
                }
                match response {
                    Body::ReadResult(read) => {
                        let result = SetResult {
                            bus: read.bus,
                            dev: read.dev,
                            par: read.par,
                            value: read.value,
                            requested: pending.requested,
                            mirror: read.mirror,
                        };
                        self.send_to(pending.origin, Body::SetResult(result));
                        self.broadcast_except(pending.origin, Body::NotifySet(result));
                        self.poller
                            .parameter_changed(read.bus, read.dev, read.par, read.value);
                    }
                    other => {
                        // The set went through but the read-back failed;
                        // the originator still needs an answer.
                        self.send_to(pending.origin, other);
                    }
                }
            }
        }
    }

    // -- status & pollers ---------------------------------------------------

    fn handle_status_event(&mut self, event: StatusEvent) {
        self.last_status = event;
        self.broadcast(Body::NotifyMrcStatus(self.status_message()));

        if self.last_status.status == LinkStatus::Running {
            self.maybe_start_pollers();
        } else {
            self.stop_pollers();
        }
    }

    fn status_message(&self) -> MrcStatus {
        MrcStatus {
            code: self.last_status.status as i32,
            reason: self.last_status.reason.clone().unwrap_or_default(),
            version: self.last_status.version.clone(),
            has_read_multi: self.last_status.has_read_multi,
            info: String::new(),
        }
    }

    fn maybe_start_pollers(&self) {
        if self.last_status.status == LinkStatus::Running
            && !self.clients.is_empty()
            && !self.link.is_silenced()
        {
            self.poller.start();
            self.scanbus.start();
        }
    }

    fn stop_pollers(&self) {
        self.poller.stop();
        self.scanbus.stop();
    }

    // -- fan-out helpers ----------------------------------------------------

    fn send_to(&self, client: ClientId, body: Body) {
        if let Some(handle) = self.clients.get(&client) {
            handle.send(body);
        }
    }

    fn broadcast(&self, body: Body) {
        for handle in self.clients.values() {
            handle.send(body.clone());
        }
    }

    fn broadcast_except(&self, skip: ClientId, body: Body) {
        for (id, handle) in &self.clients {
            if *id != skip {
                handle.send(body.clone());
            }
        }
    }

    /// Notify everyone after the writer changed: the old writer learns it
    /// lost access and cannot immediately re-acquire, the new writer that it
    /// holds access, everyone else whether access is up for grabs
    fn notify_write_access_change(&self, old_writer: Option<ClientId>) {
        for (id, handle) in &self.clients {
            if Some(*id) == self.writer {
                handle.send(Body::notify_write_access(true, false));
            } else if Some(*id) == old_writer {
                handle.send(Body::notify_write_access(false, false));
            } else {
                handle.send(Body::notify_write_access(false, self.writer.is_none()));
            }
        }
    }

    fn stop_all(&mut self) {
        info!("stopping all client connections");
        self.stop_pollers();
        for handle in self.clients.values() {
            handle.stop(false);
        }
        self.clients.clear();
        self.writer = None;
    }
}

/// Expand poll items into the set of individual addresses they cover
fn expand_poll_items(items: &[PollItem]) -> Result<BTreeSet<(u32, u32, u32)>, ErrorKind> {
    let mut set = BTreeSet::new();
    for item in items {
        if item.bus > MAX_BUS {
            return Err(ErrorKind::BusOutOfRange);
        }
        if item.dev > MAX_DEV {
            return Err(ErrorKind::DevOutOfRange);
        }
        if item.par > MAX_PAR || item.par + item.count > MAX_PAR + 1 {
            return Err(ErrorKind::ReadOutOfBounds);
        }
        for par in item.par..item.par + item.count {
            set.insert((item.bus, item.dev, par));
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_poll_items() {
        let items = [
            PollItem {
                bus: 0,
                dev: 1,
                par: 10,
                count: 3,
            },
            PollItem {
                bus: 1,
                dev: 2,
                par: 5,
                count: 1,
            },
        ];
        let set = expand_poll_items(&items).unwrap();
        let expected: BTreeSet<_> = [(0, 1, 10), (0, 1, 11), (0, 1, 12), (1, 2, 5)]
            .into_iter()
            .collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn test_expand_poll_items_rejects_out_of_range() {
        assert_eq!(
            expand_poll_items(&[PollItem {
                bus: 2,
                dev: 0,
                par: 0,
                count: 1
            }]),
            Err(ErrorKind::BusOutOfRange)
        );
        assert_eq!(
            expand_poll_items(&[PollItem {
                bus: 0,
                dev: 16,
                par: 0,
                count: 1
            }]),
            Err(ErrorKind::DevOutOfRange)
        );
        assert_eq!(
            expand_poll_items(&[PollItem {
                bus: 0,
                dev: 0,
                par: 250,
                count: 10
            }]),
            Err(ErrorKind::ReadOutOfBounds)
        );
    }

    #[test]
    fn test_expand_poll_items_overlap_is_deduplicated() {
        let items = [
            PollItem {
                bus: 0,
                dev: 0,
                par: 0,
                count: 4,
            },
            PollItem {
                bus: 0,
                dev: 0,
                par: 2,
                count: 4,
            },
        ];
        let set = expand_poll_items(&items).unwrap();
        assert_eq!(set.len(), 6);
    }
}
