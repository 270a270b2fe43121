//! Byte transports to the MRC and the timed comm layer on top of them

pub mod comm;
pub mod mock;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use comm::{CommError, MrcComm};
pub use serial::{SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{IoTimeouts, MrcTransport, TransportError};
