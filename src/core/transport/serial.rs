//! Serial transport to the MRC
//!
//! Opens the device 8N1 without flow control, matching the MRC's fixed line
//! settings. When no baud rate is requested the transport rotates through
//! the known MRC rates: every failed init sequence advances to the next
//! rate, so the link eventually recovers when the hardware default changes.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::traits::{not_connected, IoTimeouts, MrcTransport, TransportError};

/// Baud rates tried in order during auto-detection
pub const DEFAULT_BAUD_RATES: [u32; 5] = [115200, 9600, 19200, 38400, 57600];

/// Inter-character read timeout for serial lines
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(50);
/// Per-character write timeout for serial lines
pub const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (e.g. "/dev/ttyUSB0")
    pub port: String,
    /// Requested baud rate; 0 enables auto-detection
    pub baud_rate: u32,
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::ConfigError(
                "Serial port path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serial byte transport with baud-rate discovery
#[derive(Debug)]
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
    baud_index: usize,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            port: None,
            baud_index: 0,
        })
    }

    /// The rate used for the next open: the requested one, or the current
    /// entry of the detection list
    pub fn current_baud_rate(&self) -> u32 {
        if self.config.baud_rate != 0 {
            self.config.baud_rate
        } else {
            DEFAULT_BAUD_RATES[self.baud_index]
        }
    }
}

#[async_trait]
impl MrcTransport for SerialTransport {
    fn describe(&self) -> String {
        format!("{}@{}", self.config.port, self.current_baud_rate())
    }

    fn io_timeouts(&self) -> IoTimeouts {
        IoTimeouts {
            read: SERIAL_READ_TIMEOUT,
            write: SERIAL_WRITE_TIMEOUT,
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let baud_rate = self.current_baud_rate();
        info!(port = %self.config.port, baud_rate, "Opening serial port");

        let mut port = tokio_serial::new(&self.config.port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to open serial port {}: {e}",
                    self.config.port
                ))
            })?;

        #[cfg(unix)]
        port.set_exclusive(true).map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to set exclusive mode: {e}"))
        })?;

        self.port = Some(port);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.config.port, "Closed serial port");
        }
    }

    async fn read_byte(&mut self) -> io::Result<u8> {
        match self.port.as_mut() {
            Some(port) => port.read_u8().await,
            None => Err(not_connected()),
        }
    }

    async fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        match self.port.as_mut() {
            Some(port) => {
                port.write_all(std::slice::from_ref(&byte)).await?;
                port.flush().await
            }
            None => Err(not_connected()),
        }
    }

    fn note_init_failure(&mut self) {
        if self.config.baud_rate != 0 {
            return;
        }
        self.baud_index = (self.baud_index + 1) % DEFAULT_BAUD_RATES.len();
        info!(
            baud_rate = self.current_baud_rate(),
            "Init failed, advancing to next baud rate"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_validation() {
        let config = SerialConfig {
            port: String::new(),
            baud_rate: 0,
        };
        assert!(config.validate().is_err());

        let config = SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 0,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_baud_rotation_wraps() {
        let mut transport = SerialTransport::new(SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 0,
        })
        .unwrap();

        let mut seen = Vec::new();
        for _ in 0..DEFAULT_BAUD_RATES.len() + 1 {
            seen.push(transport.current_baud_rate());
            transport.note_init_failure();
        }
        assert_eq!(&seen[..DEFAULT_BAUD_RATES.len()], &DEFAULT_BAUD_RATES);
        // Wraps back to the first entry after the list is exhausted.
        assert_eq!(seen[DEFAULT_BAUD_RATES.len()], DEFAULT_BAUD_RATES[0]);
    }

    #[test]
    fn test_explicit_baud_rate_is_sticky() {
        let mut transport = SerialTransport::new(SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
        })
        .unwrap();

        assert_eq!(transport.current_baud_rate(), 38400);
        transport.note_init_failure();
        assert_eq!(transport.current_baud_rate(), 38400);
    }
}
