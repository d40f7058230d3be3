//! The authenticated local-socket RPC layer on top of `apppool-pool`:
//! a generic [`message_server::MessageServer`] accept loop, the
//! [`pool_server::PoolServer`] handler that exposes `Pool` operations over
//! it, and the [`pool_client::PoolClient`] that speaks the same protocol
//! from the web-server worker side.

pub mod error;
pub mod message_server;
pub mod pool_client;
pub mod pool_server;

pub use error::{ServerError, ServerResult};
pub use message_server::{ClientInfo, MessageHandler, MessageServer};
pub use pool_client::{ClientSession, PoolClient};
pub use pool_server::PoolServer;
