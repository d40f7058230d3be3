//! The application pool: scheduling, admission control and the
//! idle reaper layered on top of `apppool-spawn`'s process handles.

mod pool;
mod state;

pub use pool::Pool;
