//! Periodic scanbus poller
//!
//! Sweeps both buses on a timer so every client keeps an up-to-date picture
//! of which devices are present and their remote-control state. Results are
//! rebroadcast by the connection manager as scanbus notifications.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::manager::ManagerEvent;
use crate::core::mrc::queue::RequestQueueHandle;
use crate::protocol::message::{Body, ScanbusRequest, MAX_BUS};

enum ScanbusCmd {
    Start,
    Stop,
}

/// Handle to the scanbus poller task
#[derive(Clone)]
pub struct ScanbusPollerHandle {
    tx: mpsc::UnboundedSender<ScanbusCmd>,
}

impl ScanbusPollerHandle {
    pub fn start(&self) {
        let _ = self.tx.send(ScanbusCmd::Start);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(ScanbusCmd::Stop);
    }
}

/// The scanbus poller task
pub struct ScanbusPoller {
    rx: mpsc::UnboundedReceiver<ScanbusCmd>,
    queue: RequestQueueHandle,
    manager_tx: mpsc::UnboundedSender<ManagerEvent>,
    interval: Duration,
    running: bool,
    cancel: CancellationToken,
}

impl ScanbusPoller {
    pub fn new(
        queue: RequestQueueHandle,
        manager_tx: mpsc::UnboundedSender<ManagerEvent>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, ScanbusPollerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = Self {
            rx,
            queue,
            manager_tx,
            interval,
            running: false,
            cancel,
        };
        (poller, ScanbusPollerHandle { tx })
    }

    pub async fn run(mut self) {
        'outer: loop {
            while !self.running {
                let cmd = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    cmd = self.rx.recv() => cmd,
                };
                match cmd {
                    Some(cmd) => self.handle_cmd(cmd),
                    None => return,
                }
            }

            // Timer first, then the sweep.
            if !self.pause().await {
                return;
            }
            if !self.running {
                continue 'outer;
            }

            for bus in 0..=MAX_BUS {
                trace!(bus, "scanbus sweep");
                let rx = self.queue.submit(Body::Scanbus(ScanbusRequest { bus }));
                let Some(response) = self.await_response(rx).await else {
                    return;
                };

                if let Body::ScanbusResult(result) = response {
                    let _ = self.manager_tx.send(ManagerEvent::ScanbusSwept { result });
                } else {
                    debug!(bus, "scanbus sweep failed");
                }

                if !self.running {
                    continue 'outer;
                }
            }
        }
    }

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

    fn handle_cmd(&mut self, cmd: ScanbusCmd) {
        match cmd {
            ScanbusCmd::Start => self.running = true,
            ScanbusCmd::Stop => self.running = false,
        }
    }
}
