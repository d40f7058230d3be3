//! ApplicationInstance (a handle to one backend process) and Session (the
//! per-request socket to it).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use apppool_channel::address::ListenerAddress;
use apppool_channel::error::{ChannelError, ChannelResult};
use tokio::net::UnixStream;

/// A handle to one live backend process, as returned by the spawn server.
///
/// Deliberately has no scheduling state of its own (no `active_sessions`,
/// no `last_used`) — that bookkeeping belongs to `apppool-pool`, which
/// wraps this in its own record. This type only knows how to reach the
/// backend and how to signal it to exit.
pub struct ApplicationInstance {
    pid: u32,
    listener_address: ListenerAddress,
    /// Write end of the owner pipe. Closing it (dropping the fd) is the
    /// shutdown signal the backend is waiting on.
    owner_pipe: OwnedFd,
}

impl ApplicationInstance {
    pub fn new(pid: u32, listener_address: ListenerAddress, owner_pipe: OwnedFd) -> Self {
        ApplicationInstance {
            pid,
            listener_address,
            owner_pipe,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn listener_address(&self) -> &ListenerAddress {
        &self.listener_address
    }

    /// Open a fresh socket to this instance's listener and wrap it in a
    /// [`Session`]. Each call produces an independent connection; backends
    /// handle one Session at a time.
    pub async fn connect<F>(&self, close_callback: F) -> ChannelResult<Session>
    where
        F: FnOnce() + Send + 'static,
    {
        let stream = connect_unix(&self.listener_address).await?;
        Ok(Session::new(stream, self.pid, Box::new(close_callback)))
    }
}

impl Drop for ApplicationInstance {
    /// Closing `owner_pipe` (signalling the backend to exit) happens for
    /// free via `OwnedFd`'s own drop. The filesystem listener socket does
    /// not clean itself up, so it is unlinked here explicitly; abstract-
    /// namespace sockets have nothing on disk to remove.
    fn drop(&mut self) {
        tracing::debug!(
            pid = self.pid,
            owner_pipe_fd = self.owner_pipe.as_raw_fd(),
            "destroying application instance"
        );
        if let ListenerAddress::Path(path) = &self.listener_address {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn connect_unix(addr: &ListenerAddress) -> ChannelResult<UnixStream> {
    match addr {
        ListenerAddress::Path(path) => UnixStream::connect(path)
            .await
            .map_err(ChannelError::from),
        ListenerAddress::Abstract(_) => {
            // tokio::net::UnixStream has no abstract-namespace constructor;
            // build the socket manually and hand it to tokio.
            let unix_addr = addr.to_unix_addr()?;
            let sock = nix::sys::socket::socket(
                nix::sys::socket::AddressFamily::Unix,
                nix::sys::socket::SockType::Stream,
                nix::sys::socket::SockFlag::SOCK_NONBLOCK,
                None,
            )
            .map_err(|e| ChannelError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
            match nix::sys::socket::connect(sock.as_raw_fd(), &unix_addr) {
                Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => {}
                Err(e) => {
                    return Err(ChannelError::Io(std::io::Error::from_raw_os_error(e as i32)))
                }
            }
            let std_stream: std::os::unix::net::UnixStream = sock.into();
            Ok(UnixStream::from_std(std_stream)?)
        }
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Full-duplex socket to one backend, for the lifetime of one HTTP request.
///
/// The close callback runs exactly once: either when the caller explicitly
/// closes the stream and drops the Session, or when the Session is dropped
/// without an explicit close. [`discard_stream`](Session::discard_stream)
/// gives up fd ownership without ever running the callback (the caller
/// takes over responsibility for the fd and, implicitly, for notifying the
/// pool some other way).
pub struct Session {
    stream: Option<UnixStream>,
    pid: u32,
    reader_timeout: Option<std::time::Duration>,
    writer_timeout: Option<std::time::Duration>,
    close_callback: Option<CloseCallback>,
}

impl Session {
    fn new(stream: UnixStream, pid: u32, close_callback: CloseCallback) -> Self {
        Session {
            stream: Some(stream),
            pid,
            reader_timeout: None,
            writer_timeout: None,
            close_callback: Some(close_callback),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends the CGI header block as a scalar message. Must be the first
    /// call made on a fresh Session.
    pub async fn send_headers(&mut self, header_block: &[u8]) -> ChannelResult<()> {
        use tokio::io::AsyncWriteExt;
        let len = u32::try_from(header_block.len())
            .map_err(|_| ChannelError::Protocol("header block too large".to_string()))?;
        let timeout = self.writer_timeout;
        let stream = self.stream_mut()?;
        with_timeout(timeout, async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(header_block).await
        })
        .await
    }

    /// Sends a raw block of request body bytes. Callable zero or more
    /// times after `send_headers`.
    pub async fn send_body_block(&mut self, block: &[u8]) -> ChannelResult<()> {
        use tokio::io::AsyncWriteExt;
        let timeout = self.writer_timeout;
        let stream = self.stream_mut()?;
        with_timeout(timeout, stream.write_all(block)).await
    }

    /// Half-closes the write side, signalling end-of-body to the backend.
    pub fn shutdown_writer(&mut self) -> ChannelResult<()> {
        let stream = self.stream.as_ref().ok_or(ChannelError::ConnectionClosed)?;
        stream.shutdown_write(); // best-effort; see helper below
        Ok(())
    }

    pub fn shutdown_reader(&mut self) -> ChannelResult<()> {
        let stream = self.stream.as_ref().ok_or(ChannelError::ConnectionClosed)?;
        stream.shutdown_read();
        Ok(())
    }

    pub fn set_reader_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.reader_timeout = timeout.filter(|d| *d != std::time::Duration::ZERO);
    }

    pub fn set_writer_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.writer_timeout = timeout.filter(|d| *d != std::time::Duration::ZERO);
    }

    /// The underlying fd, for the caller to read the HTTP response from.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn stream(&self) -> Option<&UnixStream> {
        self.stream.as_ref()
    }

    /// Idempotent: closes the stream fd if still owned. Does not run the
    /// close callback (that only happens on drop or explicit `close`).
    pub fn close_stream(&mut self) {
        self.stream = None;
    }

    /// Gives up fd ownership entirely: the caller now owns it (e.g. to
    /// pass it across an RPC boundary via fd-passing), and the Session's
    /// own drop will neither close it nor double-close anything.
    pub fn discard_stream(&mut self) -> Option<UnixStream> {
        self.stream.take()
    }

    /// Closes the stream and runs the close callback now, exactly once.
    pub fn close(mut self) {
        self.close_stream();
        self.run_close_callback();
    }

    fn run_close_callback(&mut self) {
        if let Some(cb) = self.close_callback.take() {
            cb();
        }
    }

    fn stream_mut(&mut self) -> ChannelResult<&mut UnixStream> {
        self.stream.as_mut().ok_or(ChannelError::ConnectionClosed)
    }
}

async fn with_timeout<F, T>(timeout: Option<std::time::Duration>, fut: F) -> ChannelResult<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| ChannelError::Timeout(d))?
            .map_err(ChannelError::Io),
        None => fut.await.map_err(ChannelError::Io),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_stream();
        self.run_close_callback();
    }
}

/// Small extension trait so `shutdown_writer`/`shutdown_reader` read as
/// one-liners above; `tokio::net::UnixStream` exposes the raw fd for this.
trait ShutdownHalf {
    fn shutdown_write(&self);
    fn shutdown_read(&self);
}

impl ShutdownHalf for UnixStream {
    fn shutdown_write(&self) {
        let _ = nix::sys::socket::shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Write);
    }

    fn shutdown_read(&self) {
        let _ = nix::sys::socket::shutdown(self.as_raw_fd(), nix::sys::socket::Shutdown::Read);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn close_callback_runs_exactly_once_on_drop() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let session = Session::new(a, 1234, Box::new(move || ran2.store(true, Ordering::SeqCst)));
        drop(session);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn explicit_close_runs_callback_and_drop_does_not_double_run() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let session = Session::new(a, 1, Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        session.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discard_stream_prevents_double_close_but_still_runs_callback() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut session = Session::new(a, 1, Box::new(move || ran2.store(true, Ordering::SeqCst)));
        let taken = session.discard_stream();
        assert!(taken.is_some());
        drop(session);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn header_and_body_round_trip_through_echoing_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut session = Session::new(a, 1, Box::new(|| {}));

        let echo = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut b = b;
            let mut len_buf = [0u8; 4];
            b.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut header_buf = vec![0u8; len];
            b.read_exact(&mut header_buf).await.unwrap();
            let mut body_buf = Vec::new();
            b.read_to_end(&mut body_buf).await.unwrap();
            b.write_all(&header_buf).await.unwrap();
            b.write_all(&body_buf).await.unwrap();
        });

        session
            .send_headers(b"REQUEST_METHOD\0GET\0")
            .await
            .unwrap();
        session.send_body_block(b"hello body").await.unwrap();
        session.shutdown_writer().unwrap();
        echo.await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        session.stream_mut().unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"REQUEST_METHOD\0GET\0hello body");
    }
}
