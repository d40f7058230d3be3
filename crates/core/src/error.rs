//! Error kinds shared by every layer of the pool.
//!
//! Each variant corresponds 1:1 to an abstract error kind from the design:
//! `SystemError`, `IOError`, `TimeoutError`, `SecurityError`, `SpawnError`,
//! `BusyError`, `FileSystemError`.

use std::path::PathBuf;

/// Top-level error type returned by the pool, spawn manager and RPC layers.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("system call failed: {0}")]
    System(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("security error: {0}")]
    Security(String),

    #[error("cannot spawn application '{app_root}': {message}")]
    Spawn {
        app_root: String,
        message: String,
        /// Rendered HTML error page, if the spawner produced one.
        error_page: Option<String>,
    },

    #[error("pool busy: no capacity became available within the deadline")]
    Busy,

    #[error("file system error on '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    pub fn spawn(app_root: impl Into<String>, message: impl Into<String>) -> Self {
        PoolError::Spawn {
            app_root: app_root.into(),
            message: message.into(),
            error_page: None,
        }
    }

    pub fn spawn_with_page(
        app_root: impl Into<String>,
        message: impl Into<String>,
        error_page: impl Into<String>,
    ) -> Self {
        PoolError::Spawn {
            app_root: app_root.into(),
            message: message.into(),
            error_page: Some(error_page.into()),
        }
    }

    /// Re-prefixes a spawn error with an outer appRoot; the message
    /// accumulates context as it crosses layers.
    pub fn with_app_root_prefix(self, app_root: &str) -> Self {
        match self {
            PoolError::Spawn {
                app_root: inner_root,
                message,
                error_page,
            } => PoolError::Spawn {
                app_root: inner_root,
                message: format!("cannot spawn application '{app_root}': {message}"),
                error_page,
            },
            other => other,
        }
    }

    pub fn file_system(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PoolError::FileSystem {
            path: path.into(),
            source,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
