//! Upstream transport traits
//!
//! The MRC speaks its line protocol over either a serial port or a raw TCP
//! socket. This module defines the byte-transport trait both implement. The
//! MRC emits asynchronously in bursts without any framing, so the transport
//! surface is deliberately byte-at-a-time; burst boundaries are detected by
//! the comm layer through inter-character timeouts.

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Per-byte IO deadlines of a transport
#[derive(Debug, Clone, Copy)]
pub struct IoTimeouts {
    /// Inter-character read timeout; expiry marks the end of a burst
    pub read: Duration,
    /// Per-character write timeout; expiry is a communication error
    pub write: Duration,
}

/// Byte transport to the MRC
#[async_trait]
pub trait MrcTransport: Send + fmt::Debug {
    /// Human-readable endpoint description for logging
    fn describe(&self) -> String;

    /// Per-byte IO deadlines appropriate for this transport kind
    fn io_timeouts(&self) -> IoTimeouts;

    /// Open the transport. Called before every (re)connect attempt.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the transport, dropping any buffered data
    async fn disconnect(&mut self);

    /// Read a single byte. Blocks until data arrives or the transport fails;
    /// deadlines are enforced by the caller.
    async fn read_byte(&mut self) -> io::Result<u8>;

    /// Write a single byte
    async fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    /// Called when the MRC init sequence failed on this connection. Serial
    /// transports use this to rotate through the baud-rate list.
    fn note_init_failure(&mut self) {}
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport not connected")
}
