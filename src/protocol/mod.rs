//! Client-facing wire protocol: message types and frame codec

pub mod frame;
pub mod message;

pub use frame::{FrameCodec, FrameError};
pub use message::{Body, Envelope, ErrorKind, LinkStatus, RcState};
