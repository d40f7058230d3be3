//! PoolClient: a local object speaking the PoolServer wire protocol.
//!
//! Every method is a synchronous (from the caller's point of view)
//! request/reply round trip over one persistent connection. `get()` hands
//! back a [`ClientSession`] wrapping the fd the server passed plus a
//! reference back to this connection, so dropping it sends `["close",
//! sessionId]` without the caller having to remember to.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use apppool_channel::{ChannelError, ListenerAddress, MessageChannel};
use apppool_core::{PoolError, PoolResult, SpawnMethod};
use tokio::sync::Mutex;
use tracing::warn;

/// One authenticated connection to a PoolServer.
pub struct PoolClient {
    conn: Arc<Mutex<MessageChannel>>,
}

impl PoolClient {
    /// Connects, logs in, and waits for the server's `["ok"]`/rejection.
    pub async fn connect(
        address: &ListenerAddress,
        username: &str,
        password: &str,
    ) -> PoolResult<Self> {
        let mut channel = MessageChannel::connect(address).map_err(channel_to_pool_err)?;

        let _version = channel
            .read_array()
            .await
            .map_err(channel_to_pool_err)?
            .ok_or_else(|| PoolError::Io("server closed connection before handshake".to_string()))?;

        channel
            .write_scalar(username.as_bytes())
            .await
            .map_err(channel_to_pool_err)?;
        channel
            .write_scalar(password.as_bytes())
            .await
            .map_err(channel_to_pool_err)?;

        let reply = channel
            .read_array()
            .await
            .map_err(channel_to_pool_err)?
            .ok_or_else(|| PoolError::Io("server closed connection during login".to_string()))?;
        if reply.first().map(String::as_str) != Some("ok") {
            return Err(PoolError::Security(
                reply.first().cloned().unwrap_or_default(),
            ));
        }

        Ok(PoolClient {
            conn: Arc::new(Mutex::new(channel)),
        })
    }

    /// Requests an instance for `app_root`, returning a session socket to
    /// it. Mirrors `SpawnOptions`'s fields that travel over the wire.
    pub async fn get(
        &self,
        app_root: &str,
        environment: &str,
        spawn_method: SpawnMethod,
        lower_privilege: bool,
        lowest_user: &str,
    ) -> PoolResult<ClientSession> {
        let mut channel = self.conn.lock().await;
        channel
            .write_array(&[
                "get",
                app_root,
                bool_str(lower_privilege),
                lowest_user,
                environment,
                spawn_method.as_wire_str(),
            ])
            .await
            .map_err(channel_to_pool_err)?;

        let reply = read_reply(&mut channel).await?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                let pid: u32 = reply
                    .get(1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| PoolError::Io("malformed get reply".to_string()))?;
                let session_id: u64 = reply
                    .get(2)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| PoolError::Io("malformed get reply".to_string()))?;
                let fd = channel.recv_fd().await.map_err(channel_to_pool_err)?;
                drop(channel);
                Ok(ClientSession::new(fd, pid, session_id, self.conn.clone()))
            }
            Some("SpawnException") => {
                let message = reply.get(1).cloned().unwrap_or_default();
                let has_page = reply.get(2).map(String::as_str) == Some("true");
                let error_page = if has_page {
                    let page = channel.read_scalar().await.map_err(channel_to_pool_err)?;
                    page.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    None
                };
                match error_page {
                    Some(page) => Err(PoolError::spawn_with_page(app_root, message, page)),
                    None => Err(PoolError::spawn(app_root, message)),
                }
            }
            Some("IOException") => {
                Err(PoolError::Io(reply.get(1).cloned().unwrap_or_default()))
            }
            _ => Err(PoolError::Io(format!("unexpected get reply: {reply:?}"))),
        }
    }

    async fn simple_command(&self, args: &[String]) -> PoolResult<Vec<String>> {
        let mut channel = self.conn.lock().await;
        channel.write_array(args).await.map_err(channel_to_pool_err)?;
        read_reply(&mut channel).await
    }

    pub async fn clear(&self) -> PoolResult<()> {
        self.simple_command(&["clear".to_string()]).await?;
        Ok(())
    }

    pub async fn set_max_idle_time(&self, seconds: u64) -> PoolResult<()> {
        self.simple_command(&["setMaxIdleTime".to_string(), seconds.to_string()])
            .await?;
        Ok(())
    }

    pub async fn set_max(&self, max: usize) -> PoolResult<()> {
        self.simple_command(&["setMax".to_string(), max.to_string()])
            .await?;
        Ok(())
    }

    pub async fn set_max_per_app(&self, max: usize) -> PoolResult<()> {
        self.simple_command(&["setMaxPerApp".to_string(), max.to_string()])
            .await?;
        Ok(())
    }

    pub async fn get_active(&self) -> PoolResult<usize> {
        parse_single(self.simple_command(&["getActive".to_string()]).await?)
    }

    pub async fn get_count(&self) -> PoolResult<usize> {
        parse_single(self.simple_command(&["getCount".to_string()]).await?)
    }

    pub async fn get_spawn_server_pid(&self) -> PoolResult<u32> {
        parse_single(self.simple_command(&["getSpawnServerPid".to_string()]).await?)
    }
}

fn parse_single<T: std::str::FromStr>(reply: Vec<String>) -> PoolResult<T> {
    reply
        .first()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PoolError::Io(format!("malformed reply: {reply:?}")))
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Reads one reply, transparently consuming the `["Passed security"]`
/// frame a rights-gated command emits ahead of its actual reply, and
/// turning `["SecurityException", msg]` into an error.
async fn read_reply(channel: &mut MessageChannel) -> PoolResult<Vec<String>> {
    let first = channel
        .read_array()
        .await
        .map_err(channel_to_pool_err)?
        .ok_or_else(|| PoolError::Io("server closed connection".to_string()))?;
    match first.first().map(String::as_str) {
        Some("SecurityException") => Err(PoolError::Security(
            first.get(1).cloned().unwrap_or_default(),
        )),
        Some("Passed security") => channel
            .read_array()
            .await
            .map_err(channel_to_pool_err)?
            .ok_or_else(|| PoolError::Io("server closed connection".to_string())),
        _ => Ok(first),
    }
}

fn channel_to_pool_err(e: ChannelError) -> PoolError {
    match e {
        ChannelError::Io(io) => PoolError::System(io),
        ChannelError::ConnectionClosed => PoolError::Io("connection closed".to_string()),
        ChannelError::Timeout(d) => PoolError::Timeout(format!("{d:?}")),
        other => PoolError::Io(other.to_string()),
    }
}

/// A handed-out Session on the client side: owns the passed fd and, on
/// drop, tells the server it is done with the session. Reusing this
/// app's spawn options against a different framework tag is done by
/// calling `PoolClient::get` again, not by mutating this type.
pub struct ClientSession {
    fd: Option<OwnedFd>,
    pid: u32,
    session_id: u64,
    conn: Arc<Mutex<MessageChannel>>,
}

impl ClientSession {
    fn new(fd: OwnedFd, pid: u32, session_id: u64, conn: Arc<Mutex<MessageChannel>>) -> Self {
        ClientSession {
            fd: Some(fd),
            pid,
            session_id,
            conn,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Gives up fd ownership without notifying the server (e.g. the caller
    /// is handing the fd to another process). The server still thinks the
    /// session is open until the connection itself closes.
    pub fn discard(mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.fd.take();
        let session_id = self.session_id;
        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut channel = conn.lock().await;
                    let _ = channel
                        .write_array(&["close".to_string(), session_id.to_string()])
                        .await;
                });
            }
            Err(_) => {
                warn!(
                    session_id,
                    "session dropped with no Tokio runtime active; close notice skipped"
                );
            }
        }
    }
}
