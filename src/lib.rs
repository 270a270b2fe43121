//! MRC gateway service library
//!
//! Bridges framed TCP clients to a single MRC remote-control unit speaking
//! its line-oriented ASCII protocol over a serial port or a raw TCP
//! transport. Client requests are serialized onto the one upstream link,
//! replies are parsed into typed responses, write access is arbitrated to a
//! single client and background pollers broadcast parameter values and bus
//! topology to everyone connected.

pub mod core;
pub mod protocol;
pub mod server;
pub mod utils;

pub use crate::core::config::GatewayConfig;
pub use crate::server::{start, Gateway};
pub use crate::utils::error::{MrcSrvError, Result};

use tracing::error;

/// Wait for a shutdown signal: Ctrl+C, or SIGTERM/SIGQUIT on unix
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                None
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!("Failed to install SIGQUIT handler: {e}");
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match term.as_mut() {
                    Some(sig) => { sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            _ = async {
                match quit.as_mut() {
                    Some(sig) => { sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
