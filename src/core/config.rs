//! Service configuration
//!
//! Configuration structs for the gateway: upstream link behavior, background
//! polling and the client listen endpoint. All carry defaults matching the
//! MRC hardware's expectations and a `validate()` used at startup.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::MrcSrvError;

/// Default delay between reconnect attempts to the MRC
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default overall timeout for a prompt-terminated command reply
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default retry delay while the MRC link is still initializing
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

/// Default pause between background parameter reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default interval between scanbus sweeps
pub const DEFAULT_SCANBUS_INTERVAL: Duration = Duration::from_secs(2);

/// MRC link timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Delay between reconnect attempts after a connection or init failure
    pub reconnect_timeout: Duration,
    /// Overall timeout for reading a prompt-terminated reply
    pub prompt_timeout: Duration,
    /// Retry delay for queued requests while the link is initializing
    pub retry_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), MrcSrvError> {
        if self.prompt_timeout.is_zero() {
            return Err(MrcSrvError::ConfigError(
                "Prompt timeout must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_timeout.is_zero() {
            return Err(MrcSrvError::ConfigError(
                "Reconnect timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Background poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Minimum pause between consecutive poll reads and between cycles
    pub poll_interval: Duration,
    /// Interval between scanbus sweeps over both buses
    pub scanbus_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            scanbus_interval: DEFAULT_SCANBUS_INTERVAL,
        }
    }
}

/// Client listen endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Listen address, IPv4 dotted decimal or IPv6 hex notation
    pub address: String,
    /// Listen port
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "::".to_string(),
            port: 23000,
        }
    }
}

impl ListenConfig {
    /// Parse into a socket address, rejecting malformed listen addresses
    pub fn socket_addr(&self) -> Result<SocketAddr, MrcSrvError> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| MrcSrvError::BadListenAddress(self.address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub link: LinkConfig,
    pub poller: PollerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_config_parsing() {
        let config = ListenConfig::default();
        let addr = config.socket_addr().unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 23000);

        let bad = ListenConfig {
            address: "not-an-address".to_string(),
            port: 1,
        };
        assert!(bad.socket_addr().is_err());
    }

    #[test]
    fn test_link_config_validation() {
        assert!(LinkConfig::default().validate().is_ok());

        let mut config = LinkConfig::default();
        config.prompt_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
