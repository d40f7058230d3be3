//! Generic authenticated RPC accept loop.
//!
//! Each accepted connection is authenticated against an `AccountsDatabase`,
//! then every request is offered to an ordered chain of handlers until one
//! of them consumes it. Handlers are registered once at server startup and
//! shared across all connections; each connection gets its own
//! per-handler context.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use apppool_channel::MessageChannel;
use apppool_core::{AccountsDatabase, Rights};
use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, warn};

use crate::error::{ServerError, ServerResult};

/// Usernames/passwords above this size are rejected before the total
/// login deadline even has a chance to expire.
pub const MAX_USERNAME_SIZE: usize = 100;
pub const MAX_PASSWORD_SIZE: usize = 100;

/// Total time budget for the username+password exchange.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection identity, handed to every handler on every call.
pub struct ClientInfo {
    pub username: String,
    pub rights: Rights,
}

impl ClientInfo {
    /// Checks `required` against the connection's rights, writing the
    /// client-visible security verdict as a side effect. On failure this
    /// both replies `["SecurityException", msg]` and returns an error that
    /// the caller should propagate (MessageServer disconnects on it).
    pub async fn require_rights(
        &self,
        channel: &mut MessageChannel,
        required: Rights,
    ) -> ServerResult<()> {
        if self.rights.contains(required) {
            channel.write_array(&["Passed security"]).await?;
            Ok(())
        } else {
            let msg = format!("account '{}' lacks the rights for this operation", self.username);
            channel
                .write_array(&["SecurityException", msg.as_str()])
                .await?;
            Err(ServerError::Security(msg))
        }
    }
}

/// Per-connection opaque state a handler wants to keep between messages.
pub type HandlerContext = Option<Box<dyn Any + Send + Sync>>;

/// One pluggable command handler in the chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once, right after authentication succeeds. A handler with
    /// nothing to track returns `None`.
    async fn new_client(&self, client: &ClientInfo) -> HandlerContext;

    /// Tries to handle one request. `Ok(true)` means the handler consumed
    /// it (and already wrote a reply, if any); `Ok(false)` lets the next
    /// handler in the chain try; `Err` disconnects the client.
    async fn process_message(
        &self,
        client: &ClientInfo,
        context: &mut HandlerContext,
        args: &[String],
        channel: &mut MessageChannel,
    ) -> ServerResult<bool>;

    /// Called on clean disconnect for every handler whose `new_client` ran.
    async fn client_disconnected(&self, client: &ClientInfo, context: &mut HandlerContext) {
        let _ = (client, context);
    }
}

/// Listens on an already-bound Unix socket, authenticating and dispatching
/// every connection through `handlers` in registration order.
pub struct MessageServer {
    listener: UnixListener,
    accounts: Arc<AccountsDatabase>,
    handlers: Arc<Vec<Arc<dyn MessageHandler>>>,
    login_timeout: Duration,
}

impl MessageServer {
    pub fn new(
        listener: UnixListener,
        accounts: Arc<AccountsDatabase>,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> Self {
        MessageServer {
            listener,
            accounts,
            handlers: Arc::new(handlers),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Runs the accept loop until the listener itself errors out (e.g. the
    /// socket was removed from under it). One task per connection.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let accounts = self.accounts.clone();
                    let handlers = self.handlers.clone();
                    let login_timeout = self.login_timeout;
                    tokio::spawn(async move {
                        match handle_connection(stream, accounts, handlers, login_timeout).await {
                            Ok(()) => {}
                            Err(ServerError::Channel(apppool_channel::ChannelError::ConnectionClosed)) => {
                                debug!("client disconnected");
                            }
                            Err(ServerError::Security(msg)) => {
                                warn!(error = %msg, "client rejected");
                            }
                            Err(ServerError::Protocol(msg)) => {
                                warn!(error = %msg, "protocol error on connection");
                            }
                            Err(e) => {
                                error!(error = %e, "connection ended with an error");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept() failed");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    accounts: Arc<AccountsDatabase>,
    handlers: Arc<Vec<Arc<dyn MessageHandler>>>,
    login_timeout: Duration,
) -> ServerResult<()> {
    let mut channel = MessageChannel::new(stream);
    let client = authenticate(&mut channel, &accounts, login_timeout).await?;

    let mut contexts: Vec<HandlerContext> = Vec::with_capacity(handlers.len());
    for handler in handlers.iter() {
        contexts.push(handler.new_client(&client).await);
    }

    let result = message_loop(&mut channel, &client, &handlers, &mut contexts).await;

    for (handler, context) in handlers.iter().zip(contexts.iter_mut()) {
        handler.client_disconnected(&client, context).await;
    }

    result
}

async fn authenticate(
    channel: &mut MessageChannel,
    accounts: &AccountsDatabase,
    login_timeout: Duration,
) -> ServerResult<ClientInfo> {
    let login = async {
        channel.write_array(&["version", "1"]).await?;

        let username = match channel.read_scalar_bounded(MAX_USERNAME_SIZE).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(ServerError::Channel(apppool_channel::ChannelError::ConnectionClosed)),
            Err(apppool_channel::ChannelError::Protocol(_)) => {
                channel.write_array(&["Username too long."]).await.ok();
                return Err(ServerError::Protocol("username too long".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let password = match channel.read_scalar_bounded(MAX_PASSWORD_SIZE).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(ServerError::Channel(apppool_channel::ChannelError::ConnectionClosed)),
            Err(apppool_channel::ChannelError::Protocol(_)) => {
                channel.write_array(&["Password too long."]).await.ok();
                return Err(ServerError::Protocol("password too long".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok((
            String::from_utf8_lossy(&username).into_owned(),
            String::from_utf8_lossy(&password).into_owned(),
        ))
    };

    let (username, password) = tokio::time::timeout(login_timeout, login)
        .await
        .map_err(|_| ServerError::Protocol("login timed out".to_string()))??;

    match accounts.authenticate(&username, &password) {
        Some(rights) => {
            channel.write_array(&["ok"]).await?;
            Ok(ClientInfo { username, rights })
        }
        None => {
            channel
                .write_array(&["Invalid username or password."])
                .await
                .ok();
            Err(ServerError::Security(
                "invalid username or password".to_string(),
            ))
        }
    }
}

async fn message_loop(
    channel: &mut MessageChannel,
    client: &ClientInfo,
    handlers: &[Arc<dyn MessageHandler>],
    contexts: &mut [HandlerContext],
) -> ServerResult<()> {
    loop {
        let args = match channel.read_array().await? {
            Some(args) => args,
            None => return Ok(()),
        };

        let mut consumed = false;
        for (handler, context) in handlers.iter().zip(contexts.iter_mut()) {
            if handler
                .process_message(client, context, &args, channel)
                .await?
            {
                consumed = true;
                break;
            }
        }

        if !consumed {
            warn!(?args, "no handler accepted this message");
            return Err(ServerError::Protocol(format!(
                "unrecognized command: {args:?}"
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apppool_core::Account;

    fn accounts_with_one_user() -> Arc<AccountsDatabase> {
        let accounts = Arc::new(AccountsDatabase::new());
        accounts.add(Account::with_plain_password("alice", "s3cret", Rights::GET));
        accounts
    }

    async fn run_login(client: UnixStream, accounts: Arc<AccountsDatabase>) -> ServerResult<ClientInfo> {
        let mut channel = MessageChannel::new(client);
        authenticate(&mut channel, &accounts, DEFAULT_LOGIN_TIMEOUT).await
    }

    #[tokio::test]
    async fn correct_credentials_authenticate() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let accounts = accounts_with_one_user();
        let server = tokio::spawn(run_login(server_side, accounts));

        let mut client = MessageChannel::new(client_side);
        client.read_array().await.unwrap().unwrap();
        client.write_scalar(b"alice").await.unwrap();
        client.write_scalar(b"s3cret").await.unwrap();
        let reply = client.read_array().await.unwrap().unwrap();
        assert_eq!(reply, vec!["ok".to_string()]);

        let client_info = server.await.unwrap().unwrap();
        assert_eq!(client_info.username, "alice");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_with_no_distinguishing_detail() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let accounts = accounts_with_one_user();
        let server = tokio::spawn(run_login(server_side, accounts));

        let mut client = MessageChannel::new(client_side);
        client.read_array().await.unwrap().unwrap();
        client.write_scalar(b"alice").await.unwrap();
        client.write_scalar(b"wrong").await.unwrap();
        let reply = client.read_array().await.unwrap().unwrap();
        assert_eq!(reply, vec!["Invalid username or password.".to_string()]);

        assert!(matches!(server.await.unwrap(), Err(ServerError::Security(_))));
    }

    #[tokio::test]
    async fn unknown_username_is_rejected_with_the_same_message_as_wrong_password() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let accounts = accounts_with_one_user();
        let server = tokio::spawn(run_login(server_side, accounts));

        let mut client = MessageChannel::new(client_side);
        client.read_array().await.unwrap().unwrap();
        client.write_scalar(b"bob").await.unwrap();
        client.write_scalar(b"whatever").await.unwrap();
        let reply = client.read_array().await.unwrap().unwrap();
        assert_eq!(reply, vec!["Invalid username or password.".to_string()]);

        assert!(matches!(server.await.unwrap(), Err(ServerError::Security(_))));
    }

    #[tokio::test]
    async fn oversized_username_disconnects_before_the_password_is_even_read() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let accounts = accounts_with_one_user();
        let server = tokio::spawn(run_login(server_side, accounts));

        let mut client = MessageChannel::new(client_side);
        client.read_array().await.unwrap().unwrap();
        client
            .write_scalar(&vec![b'x'; MAX_USERNAME_SIZE + 1])
            .await
            .unwrap();
        let reply = client.read_array().await.unwrap().unwrap();
        assert_eq!(reply, vec!["Username too long.".to_string()]);

        assert!(matches!(server.await.unwrap(), Err(ServerError::Protocol(_))));
    }

    #[tokio::test]
    async fn oversized_password_disconnects() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let accounts = accounts_with_one_user();
        let server = tokio::spawn(run_login(server_side, accounts));

        let mut client = MessageChannel::new(client_side);
        client.read_array().await.unwrap().unwrap();
        client.write_scalar(b"alice").await.unwrap();
        client
            .write_scalar(&vec![b'x'; MAX_PASSWORD_SIZE + 1])
            .await
            .unwrap();
        let reply = client.read_array().await.unwrap().unwrap();
        assert_eq!(reply, vec!["Password too long.".to_string()]);

        assert!(matches!(server.await.unwrap(), Err(ServerError::Protocol(_))));
    }

    #[tokio::test]
    async fn login_deadline_disconnects_a_client_that_never_sends_credentials() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let accounts = accounts_with_one_user();
        let mut channel = MessageChannel::new(server_side);

        // `client_side` is kept open but never written to, so the server's
        // read of the username blocks until the login deadline fires.
        let result = authenticate(&mut channel, &accounts, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ServerError::Protocol(_))));
        drop(client_side);
    }
}
