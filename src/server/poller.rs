//! Background parameter poller
//!
//! Clients register sets of addresses to poll; the union of all sets is
//! walked once per cycle with single reads issued through the request
//! queue. A short pause separates consecutive reads so client traffic is
//! never starved. Completed cycles hand their values to the connection
//! manager, which broadcasts them.
//!
//! A set performed by the writer mid-cycle replaces the cached value in
//! place, so a cycle never publishes a value that is already stale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::client::ClientId;
use super::manager::ManagerEvent;
use crate::core::mrc::queue::RequestQueueHandle;
use crate::protocol::message::{Body, PolledValues};

/// One polled address
pub type PollAddress = (u32, u32, u32);

enum PollerCmd {
    SetItems {
        client: ClientId,
        items: BTreeSet<PollAddress>,
    },
    RemoveClient(ClientId),
    Start,
    Stop,
    ParameterChanged { address: PollAddress, value: i32 },
}

/// Handle to the poller task
#[derive(Clone)]
pub struct PollerHandle {
    tx: mpsc::UnboundedSender<PollerCmd>,
}

impl PollerHandle {
    pub fn set_items(&self, client: ClientId, items: BTreeSet<PollAddress>) {
        let _ = self.tx.send(PollerCmd::SetItems { client, items });
    }

    pub fn remove_client(&self, client: ClientId) {
        let _ = self.tx.send(PollerCmd::RemoveClient(client));
    }

    pub fn start(&self) {
        let _ = self.tx.send(PollerCmd::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(PollerCmd::Stop);
    }

    /// The writer changed a parameter; refresh it in the running cycle
    pub fn parameter_changed(&self, bus: u32, dev: u32, par: u32, value: i32) {
        let _ = self.tx.send(PollerCmd::ParameterChanged {
            address: (bus, dev, par),
            value,
        });
    }
}

/// The poller task
pub struct Poller {
    rx: mpsc::UnboundedReceiver<PollerCmd>,
    queue: RequestQueueHandle,
    manager_tx: mpsc::UnboundedSender<ManagerEvent>,
    interval: Duration,
    per_client: HashMap<ClientId, BTreeSet<PollAddress>>,
    results: BTreeMap<PollAddress, i32>,
    running: bool,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        queue: RequestQueueHandle,
        manager_tx: mpsc::UnboundedSender<ManagerEvent>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, PollerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = Self {
            rx,
            queue,
            manager_tx,
            interval,
            per_client: HashMap::new(),
            results: BTreeMap::new(),
            running: false,
            cancel,
        };
        (poller, PollerHandle { tx })
    }

    fn flat_set(&self) -> Vec<PollAddress> {
        let mut union = BTreeSet::new();
        for items in self.per_client.values() {
            union.extend(items.iter().copied());
        }
        union.into_iter().collect()
    }

    pub async fn run(mut self) {
        'outer: loop {
            // Park until polling is both enabled and useful.
            while !self.running || self.per_client.values().all(|s| s.is_empty()) {
                let cmd = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    cmd = self.rx.recv() => cmd,
                };
                match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => return,
                }
            }

            // One cycle over a snapshot of the union set.
            let items = self.flat_set();
            self.results.clear();
            debug!(items = items.len(), "poll cycle started");

            for (bus, dev, par) in items {
                let rx = self.queue.submit(Body::read(bus, dev, par, false));
                let Some(response) = self.await_response(rx).await else {
                    return;
                };

                if let Body::ReadResult(read) = response {
                    trace!(bus, dev, par, value = read.value, "polled");
                    self.results.insert((read.bus, read.dev, read.par), read.value);
                }
                // Non-read responses (errors) are skipped; the cycle goes on.

                if !self.pause().await {
                    return;
                }
                if !self.running {
                    continue 'outer;
                }
            }

            let items = group_results(&self.results);
            debug!(groups = items.len(), "poll cycle complete");
            let _ = self.manager_tx.send(ManagerEvent::PollCycle { items });

            if !self.pause().await {
                return;
            }
        }
    }

    /// Wait for a queued read to complete while staying responsive to
    /// commands. Returns `None` when cancelled.
    async fn await_response(&mut self, mut rx: oneshot::Receiver<Body>) -> Option<Body> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => return None,
                },
                response = &mut rx => {
                    return Some(response.unwrap_or_else(|_| {
                        Body::error(crate::protocol::message::ErrorKind::RequestCanceled)
                    }));
                }
            }
        }
    }

    /// Sleep for the poll interval while staying responsive to commands.
    /// Returns `false` when cancelled.
    async fn pause(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }

    fn handle_cmd(&mut self, cmd: PollerCmd) {
        match cmd {
            PollerCmd::SetItems { client, items } => {
                debug!(client, items = items.len(), "poll items replaced");
                self.per_client.insert(client, items);
            }
            PollerCmd::RemoveClient(client) => {
                self.per_client.remove(&client);
            }
            PollerCmd::Start => self.running = true,
            PollerCmd::Stop => self.running = false,
            PollerCmd::ParameterChanged { address, value } => {
                // Only replace values already collected this cycle.
                if let Some(entry) = self.results.get_mut(&address) {
                    *entry = value;
                }
            }
        }
    }
}

/// Merge per-address values into runs of consecutive parameters on the
/// same device
fn group_results(results: &BTreeMap<PollAddress, i32>) -> Vec<PolledValues> {
    let mut groups: Vec<PolledValues> = Vec::new();
    for (&(bus, dev, par), &value) in results {
        match groups.last_mut() {
            Some(group)
                if group.bus == bus
                    && group.dev == dev
                    && group.par + group.values.len() as u32 == par =>
            {
                group.values.push(value);
            }
            _ => groups.push(PolledValues {
                bus,
                dev,
                par,
                values: vec![value],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_results_merges_consecutive_parameters() {
        let mut results = BTreeMap::new();
        results.insert((0, 1, 10), 100);
        results.insert((0, 1, 11), 101);
        results.insert((0, 1, 13), 103);
        results.insert((1, 1, 10), 200);

        let groups = group_results(&results);
        assert_eq!(groups.len(), 3);
        assert_eq!(
            (groups[0].bus, groups[0].dev, groups[0].par),
            (0, 1, 10)
        );
        assert_eq!(groups[0].values, vec![100, 101]);
        assert_eq!(groups[1].par, 13);
        assert_eq!(groups[1].values, vec![103]);
        assert_eq!(groups[2].bus, 1);
    }

    #[test]
    fn test_group_results_covers_every_address_once() {
        let mut results = BTreeMap::new();
        for par in 0..5 {
            results.insert((0, 0, par), par as i32);
        }
        let groups = group_results(&results);
        let total: usize = groups.iter().map(|g| g.values.len()).sum();
        assert_eq!(total, 5);
    }
}
