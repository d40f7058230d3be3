//! Framed bidirectional I/O over a single Unix domain socket fd, plus the
//! local-socket address types used to reach it.
//!
//! This crate has no knowledge of the pool, spawn protocol, or RPC
//! commands layered on top of it in `apppool-spawn` and `apppool-server`;
//! it only knows how to frame array/scalar/raw messages and pass one file
//! descriptor per call.

pub mod address;
pub mod error;
pub mod message_channel;

pub use address::ListenerAddress;
pub use error::{ChannelError, ChannelResult};
pub use message_channel::MessageChannel;
