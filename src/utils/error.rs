//! Error handling for the MRC gateway service
//!
//! Service-level error type used by the bootstrap path and returned from
//! fallible setup operations. Protocol-level errors travel as wire messages
//! (`protocol::message::ErrorKind`), not through this type.

use thiserror::Error;

use crate::core::transport::traits::TransportError;

/// MRC gateway service error type
#[derive(Error, Debug)]
pub enum MrcSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Upstream transport errors
    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    /// Listen address could not be parsed
    #[error("Bad listen address: {0}")]
    BadListenAddress(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias using the service error
pub type Result<T> = std::result::Result<T, MrcSrvError>;
