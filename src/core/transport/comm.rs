//! Framed byte link to the MRC
//!
//! The MRC output has no framing: replies arrive as asynchronous bursts of
//! characters. [`MrcComm`] layers the three timing-based operations the link
//! state machine needs on top of a raw byte transport:
//!
//! - `write`: character-at-a-time with a per-character deadline,
//! - `read_burst`: accumulate until an inter-character gap marks the end of
//!   the burst (a timeout here is not an error),
//! - `read_until_prompt`: accumulate until the `mrc-1>` prompt appears at
//!   the start of a line, bounded by one overall deadline.
//!
//! Exclusive access is guaranteed by `&mut self`; the operations cannot
//! overlap.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};

use super::traits::{IoTimeouts, MrcTransport, TransportError};
use crate::protocol::message::ErrorKind;

/// The prompt token the MRC emits at the end of a command transaction
pub const PROMPT: &[u8] = b"mrc-1>";

/// Communication failure on the byte link
#[derive(Debug, Error)]
pub enum CommError {
    #[error("write timed out after {written} bytes")]
    WriteTimeout { written: usize },

    #[error("write failed at offset {offset}: {source}")]
    WriteFailed {
        offset: usize,
        source: std::io::Error,
    },

    #[error("read failed after {} bytes: {source}", .partial.len())]
    ReadFailed {
        source: std::io::Error,
        partial: Vec<u8>,
    },

    #[error("timed out waiting for the MRC prompt")]
    PromptTimeout,
}

impl CommError {
    /// Closest client-visible error classification
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CommError::WriteTimeout { .. } | CommError::PromptTimeout => ErrorKind::CommTimeout,
            CommError::WriteFailed { .. } | CommError::ReadFailed { .. } => ErrorKind::CommError,
        }
    }
}

/// True when `buf` ends with the prompt at the start of a line. No trailing
/// whitespace is required after the prompt.
pub fn ends_with_prompt(buf: &[u8]) -> bool {
    if !buf.ends_with(PROMPT) {
        return false;
    }
    match buf.len().checked_sub(PROMPT.len() + 1) {
        None => true, // prompt at the very start of the buffer
        Some(i) => buf[i] == b'\n' || buf[i] == b'\r',
    }
}

/// Timed byte-level IO over an MRC transport
#[derive(Debug)]
pub struct MrcComm {
    transport: Box<dyn MrcTransport>,
    timeouts: IoTimeouts,
    prompt_timeout: Duration,
}

impl MrcComm {
    pub fn new(transport: Box<dyn MrcTransport>, prompt_timeout: Duration) -> Self {
        let timeouts = transport.io_timeouts();
        Self {
            transport,
            timeouts,
            prompt_timeout,
        }
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
    }

    pub fn note_init_failure(&mut self) {
        self.transport.note_init_failure();
    }

    /// Write all of `data`, one character at a time
    pub async fn write(&mut self, data: &[u8]) -> Result<(), CommError> {
        for (offset, byte) in data.iter().enumerate() {
            match timeout(self.timeouts.write, self.transport.write_byte(*byte)).await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(CommError::WriteFailed { offset, source }),
                Err(_) => return Err(CommError::WriteTimeout { written: offset }),
            }
        }
        Ok(())
    }

    /// Read one burst of output. The inter-character timeout marks the end
    /// of the burst; an empty burst is a valid result.
    pub async fn read_burst(&mut self) -> Result<Vec<u8>, CommError> {
        let mut buf = Vec::new();
        loop {
            match timeout(self.timeouts.read, self.transport.read_byte()).await {
                Ok(Ok(byte)) => buf.push(byte),
                Ok(Err(source)) => {
                    return Err(CommError::ReadFailed {
                        source,
                        partial: buf,
                    })
                }
                Err(_) => return Ok(buf),
            }
        }
    }

    /// Read until the MRC prompt terminates the reply
    pub async fn read_until_prompt(&mut self) -> Result<String, CommError> {
        let deadline = Instant::now() + self.prompt_timeout;
        let mut buf = Vec::new();
        loop {
            match timeout_at(deadline, self.transport.read_byte()).await {
                Ok(Ok(byte)) => buf.push(byte),
                Ok(Err(source)) => {
                    return Err(CommError::ReadFailed {
                        source,
                        partial: buf,
                    })
                }
                Err(_) => return Err(CommError::PromptTimeout),
            }
            if ends_with_prompt(&buf) {
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::mock::MockTransport;

    #[test]
    fn test_prompt_detection() {
        assert!(ends_with_prompt(b"mrc-1>"));
        assert!(ends_with_prompt(b"RE 0 0 1 5\n\rmrc-1>"));
        assert!(ends_with_prompt(b"foo\nmrc-1>"));
        assert!(!ends_with_prompt(b"RE 0 0 1 5"));
        // The prompt must sit at the start of a line.
        assert!(!ends_with_prompt(b"xmrc-1>"));
        assert!(!ends_with_prompt(b"mrc-1> "));
    }

    #[tokio::test]
    async fn test_write_then_burst() {
        let (transport, mrc) = MockTransport::new();
        mrc.expect("p1", "ok\n\r");

        let mut comm = MrcComm::new(Box::new(transport), Duration::from_millis(200));
        comm.connect().await.unwrap();
        comm.write(b"p1\r").await.unwrap();

        let burst = comm.read_burst().await.unwrap();
        assert_eq!(burst, b"ok\n\r");
    }

    #[tokio::test]
    async fn test_empty_burst_is_ok() {
        let (transport, _mrc) = MockTransport::new();
        let mut comm = MrcComm::new(Box::new(transport), Duration::from_millis(200));
        comm.connect().await.unwrap();
        assert!(comm.read_burst().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_until_prompt_without_trailing_whitespace() {
        let (transport, mrc) = MockTransport::new();
        mrc.expect("RE 0 0 42", "RE 0 0 42 1234\n\rmrc-1>");

        let mut comm = MrcComm::new(Box::new(transport), Duration::from_millis(200));
        comm.connect().await.unwrap();
        comm.write(b"RE 0 0 42\r").await.unwrap();

        let reply = comm.read_until_prompt().await.unwrap();
        assert!(reply.ends_with("mrc-1>"));
        assert!(reply.contains("RE 0 0 42 1234"));
    }

    #[tokio::test]
    async fn test_prompt_timeout() {
        let (transport, _mrc) = MockTransport::new();
        let mut comm = MrcComm::new(Box::new(transport), Duration::from_millis(50));
        comm.connect().await.unwrap();
        match comm.read_until_prompt().await {
            Err(CommError::PromptTimeout) => {}
            other => panic!("expected prompt timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_io_error_maps_to_comm_error() {
        let (transport, mrc) = MockTransport::new();
        let mut comm = MrcComm::new(Box::new(transport), Duration::from_millis(50));
        comm.connect().await.unwrap();
        mrc.break_link();

        let err = comm.write(b"RE\r").await.unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::CommError);
    }
}
