//! Builds and runs one generation's helper: the PoolServer hosted on a
//! MessageServer listening on the generation directory's socket.

use std::sync::Arc;
use std::time::Duration;

use apppool_core::{AccountsDatabase, GenerationDir, PoolError, PoolResult, ServerInstanceDir};
use apppool_pool::Pool;
use apppool_server::{MessageServer, PoolServer};
use apppool_spawn::{ProcessLauncher, SpawnManager};
use tokio::net::UnixListener;
use tracing::info;

use crate::cli::Args;

pub struct Helper {
    pub pool: Pool,
    pub generation_dir: GenerationDir,
    pub server_task: tokio::task::JoinHandle<()>,
}

/// Starts a fresh generation: a new generation directory, a new
/// SpawnManager (and its spawn-server subprocess), a new Pool, and the
/// MessageServer task accepting connections on its socket.
pub async fn start(
    args: &Args,
    accounts: Arc<AccountsDatabase>,
    instance_dir: &ServerInstanceDir,
) -> PoolResult<Helper> {
    let generation_dir = instance_dir.generation(args.generation_number, args.user_switching)?;

    let spawn_server_command = args.resolved_spawn_server_command().ok_or_else(|| {
        PoolError::Io(
            "could not locate the spawn-server executable: pass --spawn-server-command, \
             --passenger-root, or put it on PATH"
                .to_string(),
        )
    })?;
    let launcher = ProcessLauncher {
        command: spawn_server_command,
        args: spawn_server_args(args),
    };
    let manager = SpawnManager::start(Box::new(launcher)).await?;
    info!(pid = manager.spawn_server_pid().await, "spawn server started");

    let pool = Pool::new(
        manager,
        args.max_pool_size,
        args.max_instances_per_app,
        Duration::from_secs(args.pool_idle_time),
    );

    let socket_path = generation_dir.socket_path();
    let listener = UnixListener::bind(&socket_path).map_err(PoolError::System)?;
    secure_rpc_socket(&socket_path);

    std::fs::write(generation_dir.helper_pid_path(), std::process::id().to_string())
        .map_err(|e| PoolError::file_system(generation_dir.helper_pid_path(), e))?;

    let server = MessageServer::new(listener, accounts, vec![Arc::new(PoolServer::new(pool.clone()))]);
    let server_task = tokio::spawn(server.run());

    info!(
        socket = %socket_path.display(),
        "helper listening for pool RPC connections"
    );

    Ok(Helper {
        pool,
        generation_dir,
        server_task,
    })
}

fn spawn_server_args(args: &Args) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(ruby_command) = &args.ruby_command {
        out.push("--ruby-command".to_string());
        out.push(ruby_command.clone());
    }
    out
}

/// Authentication, not filesystem permissions, is the security boundary
/// for the RPC socket (per the MessageServer login contract), so it is
/// left world-connectable.
fn secure_rpc_socket(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777));
}
