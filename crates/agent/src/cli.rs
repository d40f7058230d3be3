//! Command-line surface of the helper/watchdog binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "apppool-agent",
    version,
    about = "Watchdog + application pool helper process"
)]
pub struct Args {
    /// Log verbosity; drives `tracing_subscriber::EnvFilter` when
    /// `RUST_LOG` itself is unset.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Fd inherited from the embedding web server. A single byte read from
    /// it means graceful shutdown; unexpected EOF means the web server
    /// crashed. Absent means run standalone (no supervision shutdown
    /// trigger other than signals).
    #[arg(long = "feedback-fd")]
    pub feedback_fd: Option<i32>,

    /// Pid of the embedding web server, logged for diagnostics only.
    #[arg(long = "web-server-pid")]
    pub web_server_pid: Option<u32>,

    /// Base directory for the server-instance directory. Falls back to
    /// `TMPDIR`/`TMP`/`/tmp` when unset.
    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    /// Whether backends run as the app owner rather than this process's
    /// user; affects the mode of the generation directory's `backends`
    /// subdirectory.
    #[arg(long = "user-switching")]
    pub user_switching: bool,

    /// Fallback account used when privilege lowering to the app owner
    /// fails or is disabled.
    #[arg(long = "default-user", default_value = "nobody")]
    pub default_user: String,

    #[arg(long = "worker-uid")]
    pub worker_uid: Option<u32>,

    #[arg(long = "worker-gid")]
    pub worker_gid: Option<u32>,

    /// Installation root, used to locate the spawn server when
    /// `--spawn-server-command` is a bare relative name.
    #[arg(long = "passenger-root")]
    pub passenger_root: Option<PathBuf>,

    /// Interpreter used by the spawn server; passed through as a tag, not
    /// interpreted here (spawner internals are out of scope).
    #[arg(long = "ruby-command")]
    pub ruby_command: Option<String>,

    /// Generation number of the server-instance directory to create.
    #[arg(long = "generation-number", default_value_t = 0)]
    pub generation_number: u32,

    #[arg(long = "max-pool-size", default_value_t = 6)]
    pub max_pool_size: usize,

    /// 0 = unlimited.
    #[arg(long = "max-instances-per-app", default_value_t = 0)]
    pub max_instances_per_app: usize,

    #[arg(long = "pool-idle-time", default_value_t = 300)]
    pub pool_idle_time: u64,

    #[arg(long = "analytics-log-dir")]
    pub analytics_log_dir: Option<PathBuf>,

    /// Path to the spawn-server executable. If unset, resolved from
    /// `--passenger-root` or, failing that, `PATH` (see
    /// [`Args::resolved_spawn_server_command`]).
    #[arg(long = "spawn-server-command")]
    pub spawn_server_command: Option<PathBuf>,
}

impl Args {
    pub fn resolved_temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(|| {
            std::env::var_os("TMPDIR")
                .or_else(|| std::env::var_os("TMP"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
        })
    }

    /// Resolves the spawn-server executable: an explicit
    /// `--spawn-server-command` wins outright; otherwise it is looked up
    /// under `--passenger-root`, and failing that by scanning `PATH` for a
    /// `passenger-spawn-server` binary. Only absolute `PATH` entries are
    /// considered, as a deliberate precaution against picking up a binary
    /// from a relative, attacker-influenced directory.
    pub fn resolved_spawn_server_command(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.spawn_server_command {
            return Some(explicit.clone());
        }
        if let Some(root) = &self.passenger_root {
            let candidate = root.join("spawn-server").join("passenger-spawn-server");
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        std::env::var_os("PATH").and_then(|path| {
            std::env::split_paths(&path)
                .filter(|dir| dir.is_absolute())
                .map(|dir| dir.join("passenger-spawn-server"))
                .find(|candidate| candidate.is_file())
        })
    }
}
