//! MRC link state machine
//!
//! Owns the byte link and runs the connection lifecycle:
//!
//! ```text
//! Stopped ─start─► Connecting ─ok─► Initializing ─ok─► Running
//!    ▲                │ fail            │ fail            │ io error
//!    │                ▼                 ▼                 ▼
//!    └─reconnect── ConnectFailed     InitFailed       Stopped(error)
//! ```
//!
//! Failed states re-enter `Connecting` after the reconnect timeout unless
//! the link was cancelled. In `Running` the task accepts one command at a
//! time: render, write, read until the prompt, feed the reply parser, answer.
//!
//! Status transitions are published twice: a `watch` snapshot for components
//! that only need the current state, and an ordered `broadcast` stream for
//! the connection manager, which must observe every transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::config::LinkConfig;
use crate::core::mrc::command;
use crate::core::mrc::parser::ReplyParser;
use crate::core::transport::comm::{CommError, MrcComm};
use crate::core::transport::traits::MrcTransport;
use crate::protocol::message::{Body, ErrorKind, LinkStatus};

/// Capacity of the status event stream; far more than the manager can lag
const STATUS_EVENT_CAPACITY: usize = 64;

/// One MRC link status transition
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub status: LinkStatus,
    /// Failure detail for stopped/failed states
    pub reason: Option<String>,
    /// Firmware version when known
    pub version: String,
    /// Whether the firmware supports block reads
    pub has_read_multi: bool,
}

impl StatusEvent {
    fn new(status: LinkStatus, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            version: String::new(),
            has_read_multi: false,
        }
    }
}

/// A command submitted to the link task
struct LinkCommand {
    request: Body,
    reply: oneshot::Sender<Body>,
}

/// Handle to a running MRC link task
#[derive(Clone)]
pub struct MrcLinkHandle {
    cmd_tx: mpsc::Sender<LinkCommand>,
    status_rx: watch::Receiver<LinkStatus>,
    event_tx: broadcast::Sender<StatusEvent>,
    silenced: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl MrcLinkHandle {
    /// Current link status snapshot
    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    /// Watch receiver over the current status
    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Subscribe to the ordered stream of status transitions
    pub fn subscribe_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_silenced(&self) -> bool {
        self.silenced.load(Ordering::Acquire)
    }

    /// Enter or leave silent mode. While silenced the link refuses to touch
    /// the bus and answers every command with a silenced error.
    pub fn set_silenced(&self, silenced: bool) {
        self.silenced.store(silenced, Ordering::Release);
    }

    /// Submit a command for execution. The returned receiver yields the
    /// response; it yields a comm error if the link dies first.
    pub async fn submit(&self, request: Body) -> oneshot::Receiver<Body> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = LinkCommand {
            request,
            reply: reply_tx,
        };
        if let Err(mpsc::error::SendError(cmd)) = self.cmd_tx.send(cmd).await {
            // Link task is gone; answer in its stead.
            let _ = cmd.reply.send(Body::error(ErrorKind::CommError));
        }
        reply_rx
    }

    /// Stop the link permanently; no reconnect is scheduled
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The MRC link task
pub struct MrcLink {
    comm: MrcComm,
    config: LinkConfig,
    parser: ReplyParser,
    cmd_rx: mpsc::Receiver<LinkCommand>,
    status_tx: watch::Sender<LinkStatus>,
    event_tx: broadcast::Sender<StatusEvent>,
    silenced: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl MrcLink {
    /// Build the link task and its handle. The task does nothing until
    /// spawned via [`MrcLink::run`], so callers can subscribe to status
    /// events before the first transition fires.
    pub fn new(
        transport: Box<dyn MrcTransport>,
        config: LinkConfig,
        cancel: CancellationToken,
    ) -> (Self, MrcLinkHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Stopped);
        let (event_tx, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let silenced = Arc::new(AtomicBool::new(false));

        let comm = MrcComm::new(transport, config.prompt_timeout);

        let handle = MrcLinkHandle {
            cmd_tx,
            status_rx,
            event_tx: event_tx.clone(),
            silenced: Arc::clone(&silenced),
            cancel: cancel.clone(),
        };

        let link = Self {
            comm,
            config,
            parser: ReplyParser::new(),
            cmd_rx,
            status_tx,
            event_tx,
            silenced,
            cancel,
        };

        (link, handle)
    }

    /// Drive the link until cancelled
    pub async fn run(mut self) {
        info!(endpoint = %self.comm.describe(), "Starting MRC link");

        loop {
            self.set_status(LinkStatus::Connecting, None);

            if let Err(e) = self.comm.connect().await {
                self.set_status(LinkStatus::ConnectFailed, Some(e.to_string()));
                if !self.sleep_reconnect().await {
                    return;
                }
                continue;
            }

            self.set_status(LinkStatus::Initializing, None);
            info!("Initializing MRC");

            match self.initialize().await {
                Ok(()) => {}
                Err(reason) => {
                    warn!(%reason, "MRC initialization failed");
                    self.comm.note_init_failure();
                    self.comm.disconnect().await;
                    self.set_status(LinkStatus::InitFailed, Some(reason));
                    if !self.sleep_reconnect().await {
                        return;
                    }
                    continue;
                }
            }

            self.set_status(LinkStatus::Running, None);
            info!("MRC connection ready");

            let reason = self.run_command_loop().await;
            self.fail_pending_commands();
            self.comm.disconnect().await;

            match reason {
                Some(reason) => {
                    self.set_status(LinkStatus::Stopped, Some(reason));
                    if !self.sleep_reconnect().await {
                        return;
                    }
                }
                None => {
                    // Cancelled: stop for good.
                    self.set_status(LinkStatus::Stopped, None);
                    return;
                }
            }
        }
    }

    /// Send the init script and check that the MRC answers with a prompt.
    /// Each write is followed by a burst read; after the last write the
    /// accumulated output must end in a prompt line.
    async fn initialize(&mut self) -> Result<(), String> {
        // Flush partial input, enable the prompt, disable echo, then force
        // an error reply which proves the link works.
        const INIT_SCRIPT: [&[u8]; 4] = [b"\r", b"p1\r", b"x0\r", b"\r"];

        let mut output = Vec::new();
        for data in INIT_SCRIPT {
            self.comm.write(data).await.map_err(|e| e.to_string())?;
            let burst = self.comm.read_burst().await.map_err(|e| e.to_string())?;
            output.extend_from_slice(&burst);
        }

        let text = String::from_utf8_lossy(&output);
        let last_line = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last();

        match last_line {
            Some(line) if line.starts_with("mrc-1>") => Ok(()),
            Some(line) => Err(format!("unexpected init output {line:?}")),
            None => Err("no init output".to_string()),
        }
    }

    /// Serve commands while running. Returns the failure reason, or `None`
    /// when the link was cancelled.
    async fn run_command_loop(&mut self) -> Option<String> {
        loop {
            let cmd = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    // All handles dropped; treat like a stop.
                    None => return None,
                },
            };

            if self.silenced.load(Ordering::Acquire) {
                let _ = cmd.reply.send(Body::error(ErrorKind::Silenced));
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = cmd.reply.send(Body::error(ErrorKind::CommError));
                    return None;
                }
                result = Self::execute(&mut self.comm, &mut self.parser, &cmd.request) => result,
            };

            match result {
                Ok(response) => {
                    let _ = cmd.reply.send(response);
                }
                Err(e) => {
                    let kind = e.error_kind();
                    let _ = cmd.reply.send(Body::error_with_info(kind, e.to_string()));
                    warn!(error = %e, "MRC command IO failed");
                    return Some(e.to_string());
                }
            }
        }
    }

    /// One command transaction: write the line, read the prompt-terminated
    /// reply, run it through the parser.
    async fn execute(
        comm: &mut MrcComm,
        parser: &mut ReplyParser,
        request: &Body,
    ) -> Result<Body, CommError> {
        let Some(line) = command::render_line(request) else {
            // Not an MRC command; the queue never lets these through.
            return Ok(Body::error(ErrorKind::Unknown));
        };

        trace!(command = line.trim_end(), "writing MRC command");
        parser.set_request(request.clone());

        comm.write(line.as_bytes()).await?;
        let reply = comm.read_until_prompt().await?;

        for part in reply.split(['\r', '\n']) {
            let part = part.trim();
            if part.is_empty() || part.starts_with("mrc-1>") {
                continue;
            }
            debug!(line = part, "reply parser input");
            if parser.parse_line(part) {
                return Ok(parser.take_response());
            }
        }

        // The prompt arrived but the reply was shorter than the parser
        // expected.
        warn!("MRC reply ended before parsing completed");
        Ok(Body::error(ErrorKind::ParseError))
    }

    /// Fail commands that raced into the channel while the link was dying
    fn fail_pending_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            let _ = cmd.reply.send(Body::error(ErrorKind::CommError));
        }
    }

    /// Wait out the reconnect delay. Returns `false` when cancelled.
    async fn sleep_reconnect(&mut self) -> bool {
        debug!(
            delay_ms = self.config.reconnect_timeout.as_millis() as u64,
            "Reconnecting after delay"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {
                if *self.status_tx.borrow() != LinkStatus::Stopped {
                    self.set_status(LinkStatus::Stopped, None);
                }
                false
            }
            _ = tokio::time::sleep(self.config.reconnect_timeout) => {
                self.fail_pending_commands();
                true
            }
        }
    }

    fn set_status(&mut self, status: LinkStatus, reason: Option<String>) {
        let old = *self.status_tx.borrow();
        info!(
            from = ?old,
            to = ?status,
            reason = reason.as_deref().unwrap_or(""),
            "MRC status changed"
        );
        let _ = self.status_tx.send(status);
        let _ = self.event_tx.send(StatusEvent::new(status, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::mock::{MockMrc, MockTransport};
    use std::time::Duration;

    fn test_config() -> LinkConfig {
        LinkConfig {
            reconnect_timeout: Duration::from_millis(30),
            prompt_timeout: Duration::from_millis(200),
            retry_timeout: Duration::from_millis(50),
        }
    }

    fn spawn_link(mrc_setup: impl FnOnce(&MockMrc)) -> (MrcLinkHandle, MockMrc) {
        let (transport, mrc) = MockTransport::new();
        mrc_setup(&mrc);
        let (link, handle) = MrcLink::new(
            Box::new(transport),
            test_config(),
            CancellationToken::new(),
        );
        tokio::spawn(link.run());
        (handle, mrc)
    }

    async fn wait_for_status(handle: &MrcLinkHandle, status: LinkStatus) {
        let mut rx = handle.watch_status();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *rx.borrow() != status {
                rx.changed().await.expect("status channel closed");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {status:?}"));
    }

    #[tokio::test]
    async fn test_link_initializes_and_runs_command() {
        let (handle, mrc) = spawn_link(|mrc| {
            mrc.expect_init_ok();
            mrc.expect("RE 0 0 42", "RE 0 0 42 1234\n\rmrc-1>");
        });

        wait_for_status(&handle, LinkStatus::Running).await;

        let rx = handle.submit(Body::read(0, 0, 42, false)).await;
        let response = rx.await.unwrap();
        match response {
            Body::ReadResult(r) => {
                assert_eq!((r.bus, r.dev, r.par, r.value), (0, 0, 42, 1234));
            }
            other => panic!("unexpected response {}", other.type_name()),
        }
        assert!(mrc.unexpected().is_empty());
    }

    #[tokio::test]
    async fn test_silenced_command_does_not_touch_the_bus() {
        let (handle, mrc) = spawn_link(|mrc| {
            mrc.expect_init_ok();
        });
        wait_for_status(&handle, LinkStatus::Running).await;

        handle.set_silenced(true);
        let rx = handle.submit(Body::read(0, 0, 1, false)).await;
        match rx.await.unwrap() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::Silenced),
            other => panic!("unexpected response {}", other.type_name()),
        }
        // Only the init exchange reached the device.
        assert_eq!(mrc.commands_seen().len(), 4);
    }

    #[tokio::test]
    async fn test_init_failure_rotates_and_recovers() {
        let (handle, mrc) = spawn_link(|mrc| {
            mrc.expect_init_fail();
            mrc.expect_init_ok();
        });

        wait_for_status(&handle, LinkStatus::Running).await;
        assert_eq!(mrc.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_schedules_reconnect() {
        let (handle, mrc) = spawn_link(|mrc| {
            mrc.fail_next_connects(2);
            mrc.expect_init_ok();
        });

        wait_for_status(&handle, LinkStatus::Running).await;
        assert_eq!(mrc.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_io_error_fails_command_and_reconnects() {
        let (handle, mrc) = spawn_link(|mrc| {
            mrc.expect_init_ok();
        });
        wait_for_status(&handle, LinkStatus::Running).await;

        let mut events = handle.subscribe_events();
        mrc.break_link();
        mrc.expect_init_ok();

        let rx = handle.submit(Body::read(0, 0, 1, false)).await;
        match rx.await.unwrap() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::CommError),
            other => panic!("unexpected response {}", other.type_name()),
        }

        wait_for_status(&handle, LinkStatus::Running).await;

        // The full transition sequence was observable in order.
        let mut seen = Vec::new();
        while let Ok(ev) = events.try_recv() {
            seen.push(ev.status);
        }
        assert_eq!(
            seen,
            vec![
                LinkStatus::Stopped,
                LinkStatus::Connecting,
                LinkStatus::Initializing,
                LinkStatus::Running,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_disables_reconnect() {
        let (handle, mrc) = spawn_link(|mrc| {
            mrc.expect_init_ok();
        });
        wait_for_status(&handle, LinkStatus::Running).await;

        handle.stop();
        wait_for_status(&handle, LinkStatus::Stopped).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mrc.connect_count(), 1);
    }
}
