//! TCP transport to the MRC
//!
//! Used when the MRC sits behind a serial-device server. Nagle is disabled
//! because the command protocol is strictly request/response with tiny
//! writes; keep-alive detects a silently vanished device server.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::traits::{not_connected, IoTimeouts, MrcTransport, TransportError};

/// Inter-character read timeout for TCP upstreams
pub const TCP_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Per-character write timeout for TCP upstreams
pub const TCP_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host name or address of the serial-device server
    pub host: String,
    /// TCP port, conventionally 4001
    pub port: u16,
}

impl TcpConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::ConfigError(
                "Host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::ConfigError(
                "Port must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// TCP byte transport
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            config,
            stream: None,
        })
    }
}

#[async_trait]
impl MrcTransport for TcpTransport {
    fn describe(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn io_timeouts(&self) -> IoTimeouts {
        IoTimeouts {
            read: TCP_READ_TIMEOUT,
            write: TCP_WRITE_TIMEOUT,
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        info!(host = %self.config.host, port = self.config.port, "Connecting to MRC");

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Could not connect to {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })?;

        let sock = SockRef::from(&stream);
        if let Err(e) = sock.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {e}");
        }
        if let Err(e) = sock.set_keepalive(true) {
            warn!("Failed to set keep-alive: {e}");
        }

        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(host = %self.config.host, "Closed MRC connection");
        }
    }

    async fn read_byte(&mut self) -> io::Result<u8> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_u8().await,
            None => Err(not_connected()),
        }
    }

    async fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(std::slice::from_ref(&byte)).await,
            None => Err(not_connected()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_validation() {
        assert!(TcpConfig {
            host: String::new(),
            port: 4001
        }
        .validate()
        .is_err());
        assert!(TcpConfig {
            host: "mrc.example".to_string(),
            port: 0
        }
        .validate()
        .is_err());
        assert!(TcpConfig {
            host: "mrc.example".to_string(),
            port: 4001
        }
        .validate()
        .is_ok());
    }

    #[tokio::test]
    async fn test_connect_and_exchange_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let b = sock.read_u8().await.unwrap();
            sock.write_u8(b + 1).await.unwrap();
        });

        let mut transport = TcpTransport::new(TcpConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        })
        .unwrap();

        transport.connect().await.unwrap();
        transport.write_byte(41).await.unwrap();
        assert_eq!(transport.read_byte().await.unwrap(), 42);
        transport.disconnect().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_before_connect_fails() {
        let mut transport = TcpTransport::new(TcpConfig {
            host: "localhost".to_string(),
            port: 4001,
        })
        .unwrap();
        assert!(transport.read_byte().await.is_err());
    }
}
