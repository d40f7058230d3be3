//! ServerError: the RPC-layer error kinds, one thiserror enum matching
//! the abstract kinds 1:1 the same way `apppool_core::PoolError` does for
//! the pool layer.

use apppool_channel::ChannelError;
use apppool_core::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("security error: {0}")]
    Security(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
