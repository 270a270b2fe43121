//! Scripted MRC transport for tests
//!
//! Plays the role of the hardware: whenever a full command line (terminated
//! by `\r`) arrives, the head of the exchange script is matched against it
//! and the scripted reply bytes become readable. Link failures and connect
//! failures can be injected to exercise the reconnect path.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::traits::{IoTimeouts, MrcTransport, TransportError};

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    broken: bool,
    fail_connects: usize,
    connects: usize,
    script: VecDeque<(String, Vec<u8>)>,
    rx: VecDeque<u8>,
    line: Vec<u8>,
    seen: Vec<String>,
    unexpected: Vec<String>,
}

/// Test handle controlling a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockMrc {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockMrc {
    /// Script one exchange: when `command` arrives, emit `reply`
    pub fn expect(&self, command: &str, reply: &str) {
        let mut st = self.state.lock().expect("mock state poisoned");
        st.script
            .push_back((command.to_string(), reply.as_bytes().to_vec()));
    }

    /// Script a successful init handshake (`\r`, `p1`, `x0`, `\r`)
    pub fn expect_init_ok(&self) {
        self.expect("", "");
        self.expect("p1", "");
        self.expect("x0", "");
        self.expect("", "ERROR!\n\rmrc-1>");
    }

    /// Script an init handshake whose final output is not the prompt
    pub fn expect_init_fail(&self) {
        self.expect("", "");
        self.expect("p1", "");
        self.expect("x0", "");
        self.expect("", "@\x07garbage");
    }

    /// Break the link: all IO fails until the next connect
    pub fn break_link(&self) {
        let mut st = self.state.lock().expect("mock state poisoned");
        st.broken = true;
        drop(st);
        self.notify.notify_waiters();
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().expect("mock state poisoned").fail_connects = n;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().expect("mock state poisoned").connects
    }

    /// All complete command lines received so far
    pub fn commands_seen(&self) -> Vec<String> {
        self.state.lock().expect("mock state poisoned").seen.clone()
    }

    /// Lines that did not match the script head; should stay empty
    pub fn unexpected(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .unexpected
            .clone()
    }
}

/// Byte transport backed by a [`MockMrc`] script
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> (Self, MockMrc) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let notify = Arc::new(Notify::new());
        let handle = MockMrc {
            state: Arc::clone(&state),
            notify: Arc::clone(&notify),
        };
        (Self { state, notify }, handle)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mock link broken")
}

#[async_trait]
impl MrcTransport for MockTransport {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn io_timeouts(&self) -> IoTimeouts {
        IoTimeouts {
            read: Duration::from_millis(20),
            write: Duration::from_millis(100),
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut st = self.state.lock().expect("mock state poisoned");
        st.connects += 1;
        if st.fail_connects > 0 {
            st.fail_connects -= 1;
            return Err(TransportError::ConnectionFailed(
                "mock connect refused".to_string(),
            ));
        }
        st.connected = true;
        st.broken = false;
        st.rx.clear();
        st.line.clear();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().expect("mock state poisoned").connected = false;
    }

    async fn read_byte(&mut self) -> io::Result<u8> {
        loop {
            // Register for wakeups before checking state so a concurrent
            // notify between check and await cannot be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().expect("mock state poisoned");
                if st.broken || !st.connected {
                    return Err(broken_pipe());
                }
                if let Some(b) = st.rx.pop_front() {
                    return Ok(b);
                }
            }
            notified.await;
        }
    }

    async fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        let mut st = self.state.lock().expect("mock state poisoned");
        if st.broken || !st.connected {
            return Err(broken_pipe());
        }

        if byte != b'\r' {
            st.line.push(byte);
            return Ok(());
        }

        let line = String::from_utf8_lossy(&std::mem::take(&mut st.line)).into_owned();
        st.seen.push(line.clone());

        let head_matches = st
            .script
            .front()
            .is_some_and(|(expected, _)| *expected == line);
        if head_matches {
            let (_, reply) = st.script.pop_front().expect("script head vanished");
            st.rx.extend(reply);
        } else {
            st.unexpected.push(line);
        }
        drop(st);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_exchange() {
        let (mut transport, mrc) = MockTransport::new();
        mrc.expect("RE 0 0 1", "RE 0 0 1 5\n\rmrc-1>");

        transport.connect().await.unwrap();
        for b in b"RE 0 0 1\r" {
            transport.write_byte(*b).await.unwrap();
        }

        let mut reply = Vec::new();
        for _ in 0.."RE 0 0 1 5\n\rmrc-1>".len() {
            reply.push(transport.read_byte().await.unwrap());
        }
        assert_eq!(reply, b"RE 0 0 1 5\n\rmrc-1>");
        assert!(mrc.unexpected().is_empty());
    }

    #[tokio::test]
    async fn test_broken_link_fails_io() {
        let (mut transport, mrc) = MockTransport::new();
        transport.connect().await.unwrap();
        mrc.break_link();
        assert!(transport.write_byte(b'X').await.is_err());
        assert!(transport.read_byte().await.is_err());

        // Reconnecting clears the fault.
        transport.connect().await.unwrap();
        assert!(transport.write_byte(b'X').await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_connects_are_counted() {
        let (mut transport, mrc) = MockTransport::new();
        mrc.fail_next_connects(2);
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(mrc.connect_count(), 3);
    }
}
