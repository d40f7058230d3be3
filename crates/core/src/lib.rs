//! Shared data model and error types for the application pool.
//!
//! This crate has no I/O dependencies of its own beyond `std::fs` for path
//! canonicalization and directory-layout bookkeeping; the socket/process
//! machinery lives in `apppool-channel`, `apppool-spawn`, `apppool-pool`
//! and `apppool-server`.

pub mod account;
pub mod app_root;
pub mod cached_stat;
pub mod error;
pub mod instance_dir;
pub mod restart;
pub mod spawn_options;

pub use account::{Account, AccountsDatabase, Rights};
pub use app_root::AppRoot;
pub use cached_stat::{CachedFileStat, StatResult};
pub use error::{PoolError, PoolResult};
pub use instance_dir::{GenerationDir, ServerInstanceDir};
pub use restart::RestartChecker;
pub use spawn_options::{AppType, SpawnMethod, SpawnOptions, SpawnerTimeout};
