#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("fd-passing error: {0}")]
    FdPassing(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;
