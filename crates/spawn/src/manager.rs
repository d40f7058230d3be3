//! SpawnManager: owns the one long-running spawn-server subprocess and
//! the recovery protocol when it dies.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use apppool_channel::{ChannelError, ChannelResult, ListenerAddress, MessageChannel};
use apppool_core::{PoolError, PoolResult, SpawnOptions};
use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::instance::ApplicationInstance;
use crate::protocol;

/// How long to wait for a graceful exit after SIGTERM before escalating to
/// SIGKILL.
const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running spawn-server child process, abstracted so tests can substitute
/// an in-process fake without a real subprocess (see [`crate::testing`]).
#[async_trait]
pub trait SpawnServerProcess: Send {
    fn pid(&self) -> u32;
    async fn terminate(&mut self);
}

/// Knows how to start (or restart) the spawn-server child and hand back
/// its control channel. One implementation execs a real binary; the
/// `test-support` feature provides one backed by an in-process fake.
#[async_trait]
pub trait SpawnServerLauncher: Send + Sync {
    async fn launch(&self) -> PoolResult<(Box<dyn SpawnServerProcess>, MessageChannel)>;
}

/// Forks a socketpair and execs the configured spawn-server binary with
/// the child's end of the pair on fd 3.
pub struct ProcessLauncher {
    pub command: PathBuf,
    pub args: Vec<String>,
}

struct ChildProcess(tokio::process::Child);

#[async_trait]
impl SpawnServerProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.0.id().unwrap_or(0)
    }

    async fn terminate(&mut self) {
        let Some(pid) = self.0.id() else { return };
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        if tokio::time::timeout(CHILD_SHUTDOWN_GRACE, self.0.wait())
            .await
            .is_err()
        {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            let _ = self.0.wait().await;
        }
    }
}

#[async_trait]
impl SpawnServerLauncher for ProcessLauncher {
    async fn launch(&self) -> PoolResult<(Box<dyn SpawnServerProcess>, MessageChannel)> {
        let (parent, child_sock) =
            std::os::unix::net::UnixStream::pair().map_err(PoolError::System)?;
        parent.set_nonblocking(true).map_err(PoolError::System)?;
        let child_fd = child_sock.as_raw_fd();

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args);
        cmd.stdin(std::process::Stdio::null());
        // SAFETY: the closure runs in the forked child before exec and only
        // calls dup2, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(child_fd, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(PoolError::System)?;
        drop(child_sock);

        let tokio_stream = UnixStream::from_std(parent).map_err(PoolError::System)?;
        let channel = MessageChannel::new(tokio_stream);
        Ok((Box::new(ChildProcess(child)), channel))
    }
}

struct ManagerState {
    process: Box<dyn SpawnServerProcess>,
    channel: MessageChannel,
}

/// Owns the spawn-server control channel. Serialized by an internal mutex:
/// at most one in-flight `spawn`/`reload` at a time.
pub struct SpawnManager {
    launcher: Box<dyn SpawnServerLauncher>,
    state: Mutex<ManagerState>,
}

impl SpawnManager {
    pub async fn start(launcher: Box<dyn SpawnServerLauncher>) -> PoolResult<Self> {
        let (process, channel) = launcher.launch().await?;
        info!(pid = process.pid(), "spawn server started");
        Ok(SpawnManager {
            launcher,
            state: Mutex::new(ManagerState { process, channel }),
        })
    }

    pub async fn spawn_server_pid(&self) -> u32 {
        self.state.lock().await.process.pid()
    }

    /// Sends `spawn_application` and returns the resulting instance.
    /// Retries exactly once, after restarting the child, if the control
    /// channel itself failed.
    pub async fn spawn(&self, options: &mut SpawnOptions) -> PoolResult<ApplicationInstance> {
        let mut guard = self.state.lock().await;
        match Self::try_spawn(&mut guard, options).await {
            Ok(instance) => Ok(instance),
            Err(e) if is_recoverable(&e) => {
                warn!(error = %e, "spawn-server control channel failed, restarting");
                self.restart(&mut guard).await?;
                Self::try_spawn(&mut guard, options).await
            }
            Err(e) => Err(e),
        }
    }

    /// Sends `reload` for `app_root`; no reply is expected.
    pub async fn reload(&self, app_root: &str) -> PoolResult<()> {
        let mut guard = self.state.lock().await;
        match Self::try_reload(&mut guard, app_root).await {
            Ok(()) => Ok(()),
            Err(e) if is_recoverable(&e) => {
                warn!(error = %e, "spawn-server control channel failed, restarting");
                self.restart(&mut guard).await?;
                Self::try_reload(&mut guard, app_root).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_spawn(
        guard: &mut ManagerState,
        options: &mut SpawnOptions,
    ) -> PoolResult<ApplicationInstance> {
        let args = protocol::spawn_application_args(options);
        guard
            .channel
            .write_array(&args)
            .await
            .map_err(channel_to_pool_err)?;

        let reply = read_array_or_closed(&mut guard.channel).await?;
        match reply.first().map(String::as_str) {
            Some("ok") => {
                let info_args = read_array_or_closed(&mut guard.channel).await?;
                let info = protocol::SpawnedInstanceInfo::parse(&info_args).ok_or_else(|| {
                    PoolError::Io(format!("malformed spawn reply: {info_args:?}"))
                })?;
                let owner_pipe = guard
                    .channel
                    .recv_fd()
                    .await
                    .map_err(channel_to_pool_err)?;
                let addr = ListenerAddress::from_wire(
                    info.listener_address,
                    info.using_abstract_namespace,
                );
                if let ListenerAddress::Path(path) = &addr {
                    secure_listener_socket(path);
                }
                Ok(ApplicationInstance::new(info.pid, addr, owner_pipe))
            }
            Some("error_page") => {
                let page = guard
                    .channel
                    .read_scalar()
                    .await
                    .map_err(channel_to_pool_err)?
                    .ok_or_else(|| PoolError::Io("spawn server closed mid-reply".to_string()))?;
                let html = String::from_utf8_lossy(&page).into_owned();
                Err(PoolError::spawn_with_page(
                    options.app_root.to_string(),
                    "spawn server returned an error page",
                    html,
                ))
            }
            _ => Err(PoolError::spawn(
                options.app_root.to_string(),
                format!("spawn server protocol error: unexpected reply {reply:?}"),
            )),
        }
    }

    async fn try_reload(guard: &mut ManagerState, app_root: &str) -> PoolResult<()> {
        let args = protocol::reload_args(app_root);
        guard
            .channel
            .write_array(&args)
            .await
            .map_err(channel_to_pool_err)
    }

    async fn restart(&self, guard: &mut ManagerState) -> PoolResult<()> {
        guard.process.terminate().await;
        let (process, channel) = self.launcher.launch().await?;
        info!(pid = process.pid(), "spawn server restarted");
        guard.process = process;
        guard.channel = channel;
        Ok(())
    }
}

async fn read_array_or_closed(channel: &mut MessageChannel) -> PoolResult<Vec<String>> {
    channel
        .read_array()
        .await
        .map_err(channel_to_pool_err)?
        .ok_or_else(|| PoolError::Io("spawn server closed control channel".to_string()))
}

fn is_recoverable(e: &PoolError) -> bool {
    matches!(e, PoolError::System(_) | PoolError::Io(_))
}

fn channel_to_pool_err(e: ChannelError) -> PoolError {
    match e {
        ChannelError::Io(io) => PoolError::System(io),
        ChannelError::ConnectionClosed => PoolError::Io("connection closed".to_string()),
        ChannelError::Timeout(d) => PoolError::Timeout(format!("{d:?}")),
        other => PoolError::Io(other.to_string()),
    }
}

/// chmod 0600 + chown to euid/egid, best-effort retrying EINTR.
fn secure_listener_socket(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    loop {
        match std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            Ok(()) => break,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to chmod listener socket");
                break;
            }
        }
    }
    let euid = nix::unistd::geteuid();
    let egid = nix::unistd::getegid();
    loop {
        match nix::unistd::chown(path, Some(euid), Some(egid)) {
            Ok(()) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to chown listener socket");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSpawnLauncher;
    use apppool_core::AppRoot;

    fn opts() -> SpawnOptions {
        SpawnOptions::new(AppRoot::normalize(std::env::temp_dir()).unwrap(), "production")
    }

    #[tokio::test]
    async fn spawn_returns_instance_from_fake_server() {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        let mut options = opts();
        let instance = manager.spawn(&mut options).await.unwrap();
        assert!(instance.pid() > 0);
    }

    #[tokio::test]
    async fn two_spawns_yield_different_pids() {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        let a = manager.spawn(&mut opts()).await.unwrap();
        let b = manager.spawn(&mut opts()).await.unwrap();
        assert_ne!(a.pid(), b.pid());
    }

    #[tokio::test]
    async fn reload_does_not_error_on_healthy_server() {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        manager.reload("/app").await.unwrap();
    }

    #[tokio::test]
    async fn error_page_spawn_request_surfaces_spawn_exception() {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        let mut options = opts();
        options.app_root = AppRoot::normalize(std::env::temp_dir()).unwrap();
        options.environment = "error_page".to_string();
        let err = manager.spawn(&mut options).await.unwrap_err();
        match err {
            PoolError::Spawn { error_page, .. } => assert!(error_page.is_some()),
            other => panic!("expected Spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_channel_failure_triggers_restart_and_retry() {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        // Kill the fake server's side of the channel out from under it.
        {
            let mut guard = manager.state.lock().await;
            guard.process.terminate().await;
        }
        let instance = manager.spawn(&mut opts()).await.unwrap();
        assert!(instance.pid() > 0);
    }
}
