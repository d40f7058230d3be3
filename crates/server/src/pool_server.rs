//! PoolServer: exposes `Pool` operations as a `MessageServer` handler.

use std::collections::HashMap;
use std::os::fd::AsRawFd;

use apppool_channel::MessageChannel;
use apppool_core::{AppRoot, PoolError, Rights, SpawnMethod, SpawnOptions};
use apppool_pool::Pool;
use apppool_spawn::Session;
use async_trait::async_trait;
use tracing::warn;

use crate::error::{ServerError, ServerResult};
use crate::message_server::{ClientInfo, HandlerContext, MessageHandler};

/// Per-connection state: the sessions this connection has been handed,
/// keyed by the id the server assigned them, plus the id counter.
#[derive(Default)]
struct Connection {
    sessions: HashMap<u64, Session>,
    next_session_id: u64,
}

impl Connection {
    fn store(&mut self, session: Session) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(id, session);
        id
    }
}

pub struct PoolServer {
    pool: Pool,
}

impl PoolServer {
    pub fn new(pool: Pool) -> Self {
        PoolServer { pool }
    }

    fn parse_spawn_method(s: &str) -> SpawnMethod {
        match s {
            "smart-lv2" => SpawnMethod::SmartLv2,
            "conservative" => SpawnMethod::Conservative,
            _ => SpawnMethod::Smart,
        }
    }

    async fn handle_get(
        &self,
        conn: &mut Connection,
        args: &[String],
        channel: &mut MessageChannel,
    ) -> ServerResult<()> {
        let [app_root, lower_privilege, lowest_user, environment, spawn_method] = args else {
            return Err(ServerError::Protocol("malformed get request".to_string()));
        };

        let app_root = match AppRoot::normalize(app_root) {
            Ok(root) => root,
            Err(e) => {
                channel
                    .write_array(&["IOException".to_string(), format!("invalid appRoot: {e}")])
                    .await?;
                return Ok(());
            }
        };

        let mut options = SpawnOptions::new(app_root.clone(), environment.clone());
        options.lower_privilege = apppool_spawn::protocol::parse_bool_str(lower_privilege);
        options.lowest_user = lowest_user.clone();
        options.spawn_method = Self::parse_spawn_method(spawn_method);

        match self.pool.get(options).await {
            Ok(session) => {
                let pid = session.pid();
                let Some(fd) = session.as_raw_fd() else {
                    channel
                        .write_array(&["IOException".to_string(), "session has no socket".to_string()])
                        .await?;
                    return Ok(());
                };
                let session_id = conn.store(session);
                channel
                    .write_array(&["ok".to_string(), pid.to_string(), session_id.to_string()])
                    .await?;
                channel.send_fd(fd).await?;
            }
            Err(PoolError::Spawn {
                message,
                error_page,
                ..
            }) => {
                channel
                    .write_array(&[
                        "SpawnException".to_string(),
                        message,
                        if error_page.is_some() { "true" } else { "false" }.to_string(),
                    ])
                    .await?;
                if let Some(page) = error_page {
                    channel.write_scalar(page.as_bytes()).await?;
                }
            }
            Err(e) => {
                channel
                    .write_array(&["IOException".to_string(), e.to_string()])
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for PoolServer {
    async fn new_client(&self, _client: &ClientInfo) -> HandlerContext {
        Some(Box::new(Connection::default()))
    }

    async fn process_message(
        &self,
        client: &ClientInfo,
        context: &mut HandlerContext,
        args: &[String],
        channel: &mut MessageChannel,
    ) -> ServerResult<bool> {
        let Some(conn) = context
            .as_mut()
            .and_then(|ctx| ctx.downcast_mut::<Connection>())
        else {
            return Ok(false);
        };

        match args.first().map(String::as_str) {
            Some("get") => {
                client.require_rights(channel, Rights::GET).await?;
                self.handle_get(conn, &args[1..], channel).await?;
                Ok(true)
            }
            Some("close") => {
                if let Some(id) = args.get(1).and_then(|s| s.parse::<u64>().ok()) {
                    conn.sessions.remove(&id);
                }
                Ok(true)
            }
            Some("clear") => {
                client.require_rights(channel, Rights::CLEAR).await?;
                self.pool.clear().await;
                channel.write_array(&["ok"]).await?;
                Ok(true)
            }
            Some("setMaxIdleTime") => {
                client.require_rights(channel, Rights::SET_PARAMETERS).await?;
                if let Some(seconds) = args.get(1).and_then(|s| s.parse::<u64>().ok()) {
                    self.pool.set_max_idle_time(seconds).await;
                }
                channel.write_array(&["ok"]).await?;
                Ok(true)
            }
            Some("setMax") => {
                client.require_rights(channel, Rights::SET_PARAMETERS).await?;
                if let Some(n) = args.get(1).and_then(|s| s.parse::<usize>().ok()) {
                    self.pool.set_max(n).await;
                }
                channel.write_array(&["ok"]).await?;
                Ok(true)
            }
            Some("setMaxPerApp") => {
                client.require_rights(channel, Rights::SET_PARAMETERS).await?;
                if let Some(n) = args.get(1).and_then(|s| s.parse::<usize>().ok()) {
                    self.pool.set_max_per_app(n).await;
                }
                channel.write_array(&["ok"]).await?;
                Ok(true)
            }
            Some("getActive") => {
                client
                    .require_rights(channel, Rights::INSPECT_BASIC_INFO)
                    .await?;
                let active = self.pool.get_active().await;
                channel.write_array(&[active.to_string()]).await?;
                Ok(true)
            }
            Some("getCount") => {
                client
                    .require_rights(channel, Rights::INSPECT_BASIC_INFO)
                    .await?;
                let count = self.pool.get_count().await;
                channel.write_array(&[count.to_string()]).await?;
                Ok(true)
            }
            Some("getSpawnServerPid") => {
                client
                    .require_rights(channel, Rights::INSPECT_BASIC_INFO)
                    .await?;
                let pid = self.pool.get_spawn_server_pid().await;
                channel.write_array(&[pid.to_string()]).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn client_disconnected(&self, _client: &ClientInfo, context: &mut HandlerContext) {
        let Some(conn) = context.as_mut().and_then(|ctx| ctx.downcast_mut::<Connection>()) else {
            return;
        };
        if !conn.sessions.is_empty() {
            warn!(count = conn.sessions.len(), "dropping sessions left open by disconnecting client");
        }
        conn.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use apppool_channel::ListenerAddress;
    use apppool_core::{Account, AccountsDatabase, Rights};
    use apppool_spawn::testing::FakeSpawnLauncher;
    use apppool_spawn::SpawnManager;
    use tokio::net::UnixListener;

    use super::*;
    use crate::message_server::MessageServer;
    use crate::pool_client::PoolClient;

    async fn start_test_server(socket_path: std::path::PathBuf) -> Arc<AccountsDatabase> {
        let manager = SpawnManager::start(Box::new(FakeSpawnLauncher::new()))
            .await
            .unwrap();
        let pool = Pool::new(manager, 10, 10, Duration::from_secs(60));

        let accounts = Arc::new(AccountsDatabase::new());
        accounts.add(Account::with_plain_password(
            "worker",
            "s3cret",
            Rights::GET | Rights::CLEAR | Rights::SET_PARAMETERS | Rights::INSPECT_BASIC_INFO,
        ));

        let listener = UnixListener::bind(&socket_path).unwrap();
        let server = MessageServer::new(listener, accounts.clone(), vec![Arc::new(PoolServer::new(pool))]);
        tokio::spawn(server.run());
        accounts
    }

    #[tokio::test]
    async fn get_round_trips_a_session_fd_and_close_releases_it() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("pool.sock");
        start_test_server(socket_path.clone()).await;

        let app_root = tempfile::tempdir().unwrap();

        let client = PoolClient::connect(
            &ListenerAddress::Path(socket_path),
            "worker",
            "s3cret",
        )
        .await
        .unwrap();

        let session = client
            .get(
                app_root.path().to_str().unwrap(),
                "production",
                apppool_core::SpawnMethod::Smart,
                true,
                "nobody",
            )
            .await
            .unwrap();
        assert!(session.pid() > 0);
        assert!(session.as_raw_fd().is_some());

        // Give the background reaper/close-handling a moment to settle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.get_active().await.unwrap(), 1);

        drop(session);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.get_active().await.unwrap(), 0);
        assert_eq!(client.get_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("pool.sock");
        start_test_server(socket_path.clone()).await;

        let err = PoolClient::connect(&ListenerAddress::Path(socket_path), "worker", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Security(_)));
    }

    #[tokio::test]
    async fn clear_requires_the_clear_right() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("pool.sock");
        let accounts = start_test_server(socket_path.clone()).await;
        accounts.add(Account::with_plain_password(
            "readonly",
            "pw",
            Rights::INSPECT_BASIC_INFO,
        ));

        let client = PoolClient::connect(&ListenerAddress::Path(socket_path), "readonly", "pw")
            .await
            .unwrap();
        let err = client.clear().await.unwrap_err();
        assert!(matches!(err, PoolError::Security(_)));
    }
}
