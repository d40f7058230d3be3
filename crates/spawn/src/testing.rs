//! In-process fake spawn server.
//!
//! Speaks exactly the spawn-server wire protocol over a provided channel so
//! `SpawnManager`/`Pool` tests exercise the real framing and fd-passing
//! code paths without a Ruby/Rack/WSGI dependency. Each fake backend is a
//! tiny unix-socket echo server with its own owner pipe, optionally
//! reading two test-only marker files under the app root:
//! `FAKE_RESPONSE_MARKER` (appended to every echoed response, so tests
//! can observe a "code change" by rewriting it) and `FAKE_MAX_REQUESTS`
//! (after which the backend voluntarily stops accepting connections, so
//! the next `connect()` fails and the Pool evicts it).

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use apppool_channel::MessageChannel;
use apppool_core::{PoolError, PoolResult};
use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::manager::{SpawnServerLauncher, SpawnServerProcess};
use crate::protocol;

/// Starts a fresh in-process fake spawn server on every `launch()`, with
/// pids drawn from a shared counter so successive spawns (including ones
/// that follow a restart) never collide.
pub struct FakeSpawnLauncher {
    next_pid: Arc<AtomicU32>,
}

impl FakeSpawnLauncher {
    pub fn new() -> Self {
        FakeSpawnLauncher {
            next_pid: Arc::new(AtomicU32::new(20_000)),
        }
    }
}

impl Default for FakeSpawnLauncher {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeProcess {
    pid: u32,
    task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl SpawnServerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn terminate(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SpawnServerLauncher for FakeSpawnLauncher {
    async fn launch(&self) -> PoolResult<(Box<dyn SpawnServerProcess>, MessageChannel)> {
        let (parent, child) = UnixStream::pair().map_err(PoolError::System)?;
        let pid_counter = self.next_pid.clone();
        let fake_pid = pid_counter.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(run_fake_server(child, pid_counter));
        Ok((
            Box::new(FakeProcess {
                pid: fake_pid,
                task,
            }),
            MessageChannel::new(parent),
        ))
    }
}

async fn run_fake_server(stream: UnixStream, pid_counter: Arc<AtomicU32>) {
    let mut channel = MessageChannel::new(stream);
    loop {
        let args = match channel.read_array().await {
            Ok(Some(args)) => args,
            _ => return,
        };
        match args.first().map(String::as_str) {
            Some("spawn_application") => {
                let app_root = args.get(1).map(PathBuf::from).unwrap_or_default();
                let environment = args.get(4).cloned().unwrap_or_default();

                if environment == "error_page" {
                    if channel.write_array(&["error_page"]).await.is_err() {
                        return;
                    }
                    let html = b"<html><body>fake spawn failure</body></html>".to_vec();
                    if channel.write_scalar(&html).await.is_err() {
                        return;
                    }
                    continue;
                }

                let pid = pid_counter.fetch_add(1, Ordering::SeqCst);
                match spawn_fake_backend(pid, &app_root) {
                    Ok((socket_path, owner_write)) => {
                        let info = protocol::SpawnedInstanceInfo {
                            pid,
                            listener_address: socket_path.display().to_string(),
                            using_abstract_namespace: false,
                        };
                        if channel.write_array(&["ok"]).await.is_err() {
                            return;
                        }
                        if channel.write_array(&info.to_args()).await.is_err() {
                            return;
                        }
                        if channel.send_fd(owner_write.as_raw_fd()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "fake backend failed to start");
                        if channel.write_array(&["error_page"]).await.is_err() {
                            return;
                        }
                        if channel
                            .write_scalar(format!("<html>{e}</html>").as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            Some("reload") => {
                // No reply expected
            }
            _ => return,
        }
    }
}

fn spawn_fake_backend(pid: u32, app_root: &Path) -> std::io::Result<(PathBuf, OwnedFd)> {
    let marker =
        std::fs::read_to_string(app_root.join("FAKE_RESPONSE_MARKER")).unwrap_or_default();
    let max_requests: Option<u32> = std::fs::read_to_string(app_root.join("FAKE_MAX_REQUESTS"))
        .ok()
        .and_then(|s| s.trim().parse().ok());

    let socket_path = std::env::temp_dir().join(format!(
        "apppool-fake-backend-{pid}-{}.sock",
        rand::random::<u32>()
    ));
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    let (owner_read, owner_write) = nix::unistd::pipe()?;

    tokio::spawn(run_fake_backend(
        listener,
        socket_path.clone(),
        owner_read,
        marker,
        max_requests,
    ));

    Ok((socket_path, owner_write))
}

async fn run_fake_backend(
    listener: UnixListener,
    socket_path: PathBuf,
    owner_read: OwnedFd,
    marker: String,
    max_requests: Option<u32>,
) {
    use tokio::io::unix::AsyncFd;

    let owner_read = match AsyncFd::new(owner_read) {
        Ok(v) => v,
        Err(_) => return,
    };
    let mut served = 0u32;

    loop {
        if let Some(max) = max_requests {
            if served >= max {
                break;
            }
        }
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        served += 1;
                        let marker = marker.clone();
                        tokio::spawn(echo_connection(stream, marker));
                    }
                    Err(_) => break,
                }
            }
            guard = owner_read.readable() => {
                let Ok(mut guard) = guard else { break };
                let mut byte = [0u8; 1];
                let result = guard.try_io(|inner| {
                    let raw = inner.get_ref().as_raw_fd();
                    let n = unsafe { libc::read(raw, byte.as_mut_ptr() as *mut _, 1) };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n)
                    }
                });
                if matches!(result, Ok(Ok(0))) {
                    break; // Pool closed the owner pipe: shut down.
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
}

/// Echoes the CGI header block followed by the request body, with the
/// test's response marker appended, mirroring a real backend's response.
async fn echo_connection(mut stream: UnixStream, marker: String) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut header = vec![0u8; len];
    if stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let mut body = Vec::new();
    let _ = stream.read_to_end(&mut body).await;

    let mut response = header;
    response.extend_from_slice(&body);
    response.extend_from_slice(marker.as_bytes());
    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use apppool_channel::ListenerAddress;

    #[tokio::test]
    async fn fake_backend_echoes_request_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("FAKE_RESPONSE_MARKER"), b"v1").unwrap();
        let (socket_path, _owner_write) = spawn_fake_backend(1, dir.path()).unwrap();

        let addr = ListenerAddress::Path(socket_path);
        let mut stream = UnixStream::connect(addr.to_unix_addr().unwrap().path().unwrap())
            .await
            .unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let header = b"REQUEST_METHOD\0GET\0";
        stream
            .write_all(&(header.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(header).await.unwrap();
        stream.write_all(b"body").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"REQUEST_METHOD\0GET\0bodyv1");
    }
}
