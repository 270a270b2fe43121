//! MRC request queue
//!
//! Serializes heterogeneous client and poller requests onto the single MRC
//! link: strict FIFO, at most one command on the wire. While the link is
//! still initializing the head entry is retried on a timer instead of being
//! failed, so commands issued during a reconnect settle once the link comes
//! up. Other non-running link states fail the head immediately with the
//! matching error.
//!
//! Response handlers are invoked inside the queue task, in completion
//! order, which equals enqueue order.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::link::MrcLinkHandle;
use crate::core::config::LinkConfig;
use crate::protocol::message::{Body, ErrorKind, LinkStatus};

/// Callback receiving `(request, response)` when an entry completes
pub type ResponseHandler = Box<dyn FnOnce(Body, Body) + Send>;

struct QueueEntry {
    request: Body,
    handler: ResponseHandler,
}

/// Handle for submitting requests to the queue task
#[derive(Clone)]
pub struct RequestQueueHandle {
    tx: mpsc::UnboundedSender<QueueEntry>,
}

impl RequestQueueHandle {
    /// Enqueue an MRC command with a completion handler
    pub fn enqueue(&self, request: Body, handler: impl FnOnce(Body, Body) + Send + 'static) {
        if !request.is_mrc_request() {
            error!(
                request = request.type_name(),
                "non-MRC request handed to the request queue"
            );
            handler(request, Body::error(ErrorKind::InvalidType));
            return;
        }

        let entry = QueueEntry {
            request,
            handler: Box::new(handler),
        };
        if let Err(mpsc::error::SendError(entry)) = self.tx.send(entry) {
            // Queue task is gone (shutdown); answer in its stead.
            (entry.handler)(entry.request, Body::error(ErrorKind::RequestCanceled));
        }
    }

    /// Enqueue and receive the response through a oneshot channel
    pub fn submit(&self, request: Body) -> oneshot::Receiver<Body> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(request, move |_, response| {
            let _ = tx.send(response);
        });
        rx
    }

    /// Enqueue and wait for the response
    pub async fn request(&self, request: Body) -> Body {
        self.submit(request)
            .await
            .unwrap_or_else(|_| Body::error(ErrorKind::RequestCanceled))
    }
}

/// The request queue task
pub struct RequestQueue {
    rx: mpsc::UnboundedReceiver<QueueEntry>,
    link: MrcLinkHandle,
    config: LinkConfig,
    queue: VecDeque<QueueEntry>,
    inflight: Option<oneshot::Receiver<Body>>,
    retry_at: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestQueue {
    pub fn new(
        link: MrcLinkHandle,
        config: LinkConfig,
        cancel: CancellationToken,
    ) -> (Self, RequestQueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            rx,
            link,
            config,
            queue: VecDeque::new(),
            inflight: None,
            retry_at: None,
            cancel,
        };
        (queue, RequestQueueHandle { tx })
    }

    pub async fn run(mut self) {
        loop {
            let inflight = self.inflight.as_mut();
            let has_inflight = inflight.is_some();
            let retry_deadline = self.retry_at.unwrap_or_else(Instant::now);
            let has_retry = self.retry_at.is_some();

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.fail_all(ErrorKind::RequestCanceled);
                    return;
                }

                entry = self.rx.recv() => {
                    match entry {
                        Some(entry) => self.queue.push_back(entry),
                        None => return,
                    }
                }

                response = async { inflight.expect("inflight checked").await },
                        if has_inflight => {
                    self.inflight = None;
                    let response =
                        response.unwrap_or_else(|_| Body::error(ErrorKind::CommError));
                    self.complete_head(response);
                }

                _ = tokio::time::sleep_until(retry_deadline), if has_retry => {
                    self.retry_at = None;
                }
            }

            self.dispatch().await;
        }
    }

    /// Dispatch as far as the link state allows
    async fn dispatch(&mut self) {
        loop {
            if self.queue.is_empty() || self.inflight.is_some() || self.retry_at.is_some() {
                return;
            }

            let status = self.link.status();
            match status {
                LinkStatus::Running => {
                    let head = self.queue.front().expect("queue non-empty");
                    trace!(request = head.request.type_name(), "dispatching to MRC");
                    let rx = self.link.submit(head.request.clone()).await;
                    self.inflight = Some(rx);
                    return;
                }
                LinkStatus::Initializing => {
                    debug!("MRC still initializing, retrying later");
                    self.retry_at = Some(Instant::now() + self.config.retry_timeout);
                    return;
                }
                LinkStatus::ConnectFailed => {
                    self.fail_head(ErrorKind::ConnectError);
                }
                LinkStatus::InitFailed => {
                    self.fail_head(ErrorKind::CommError);
                }
                LinkStatus::Connecting => {
                    self.fail_head(ErrorKind::Connecting);
                }
                LinkStatus::Stopped => {
                    self.fail_head(ErrorKind::Unknown);
                }
            }
        }
    }

    fn fail_head(&mut self, kind: ErrorKind) {
        error!(error = ?kind, "MRC connection not running, failing request");
        self.complete_head(Body::error(kind));
    }

    fn complete_head(&mut self, response: Body) {
        if let Some(entry) = self.queue.pop_front() {
            (entry.handler)(entry.request, response);
        }
    }

    fn fail_all(&mut self, kind: ErrorKind) {
        while let Some(entry) = self.queue.pop_front() {
            (entry.handler)(entry.request, Body::error(kind));
        }
    }
}
