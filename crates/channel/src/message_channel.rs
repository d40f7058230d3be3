//! Framed bidirectional I/O over one Unix domain socket fd.
//!
//! Wire formats:
//! - array message: `u16_be totalPayloadLen || (cstring NUL)*`
//! - scalar message: `u32_be len || len bytes`
//! - raw bytes: no framing at all, caller-delimited
//! - one passed file descriptor per call, using a one-byte dummy iovec
//!   payload (required on Linux/Solaris, where an empty iovec alongside
//!   `SCM_RIGHTS` ancillary data is rejected)

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::error::{ChannelError, ChannelResult};

const MAX_ARRAY_PAYLOAD: usize = u16::MAX as usize;

/// A single logical connection, framed per the wire formats above.
pub struct MessageChannel {
    stream: UnixStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl MessageChannel {
    pub fn new(stream: UnixStream) -> Self {
        MessageChannel {
            stream,
            read_timeout: None,
            write_timeout: None,
        }
    }

    pub fn connect(addr: &crate::address::ListenerAddress) -> ChannelResult<Self> {
        let unix_addr: UnixAddr = addr.to_unix_addr()?;
        let sock = nix::sys::socket::socket(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            nix::sys::socket::SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| ChannelError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        match nix::sys::socket::connect(sock.as_raw_fd(), &unix_addr) {
            Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => {}
            Err(e) => return Err(ChannelError::Io(std::io::Error::from_raw_os_error(e as i32))),
        }
        let std_stream: std::os::unix::net::UnixStream = sock.into();
        let stream = UnixStream::from_std(std_stream)?;
        Ok(Self::new(stream))
    }

    /// Zero/`None` means unbounded, per the design.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout.filter(|d| *d != Duration::ZERO);
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout.filter(|d| *d != Duration::ZERO);
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }

    /// Reads raw bytes of an exact length. Returns `Ok(None)` only if EOF
    /// is hit before a single byte is read; a partial frame after that is
    /// an error, not a clean close.
    async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> ChannelResult<bool> {
        if buf.is_empty() {
            return Ok(true);
        }
        let timeout = self.read_timeout;
        let first = with_timeout(timeout, self.stream.read(&mut buf[..1])).await?;
        if first == 0 {
            return Ok(false);
        }
        if buf.len() > 1 {
            with_timeout(timeout, self.stream.read_exact(&mut buf[1..])).await?;
        }
        Ok(true)
    }

    /// Writes raw bytes with no framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> ChannelResult<()> {
        let timeout = self.write_timeout;
        with_timeout(timeout, self.stream.write_all(bytes)).await
    }

    /// Reads exactly `len` raw bytes.
    pub async fn read_raw(&mut self, len: usize) -> ChannelResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let timeout = self.read_timeout;
        with_timeout(timeout, self.stream.read_exact(&mut buf)).await?;
        Ok(buf)
    }

    /// Writes an array message: at least one argument, none containing NUL.
    pub async fn write_array(&mut self, args: &[impl AsRef<str>]) -> ChannelResult<()> {
        if args.is_empty() {
            return Err(ChannelError::Protocol(
                "array message requires at least one argument".to_string(),
            ));
        }
        let mut payload = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            if arg.contains('\0') {
                return Err(ChannelError::Protocol(
                    "array message argument may not contain NUL".to_string(),
                ));
            }
            payload.extend_from_slice(arg.as_bytes());
            payload.push(0);
        }
        if payload.len() > MAX_ARRAY_PAYLOAD {
            return Err(ChannelError::Protocol(format!(
                "array message payload too large: {} bytes",
                payload.len()
            )));
        }
        let len = payload.len() as u16;
        let timeout = self.write_timeout;
        let stream = &mut self.stream;
        with_timeout(timeout, async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&payload).await
        })
        .await
    }

    /// Reads an array message. Returns `Ok(None)` on clean EOF before any
    /// bytes of the length prefix arrive.
    pub async fn read_array(&mut self) -> ChannelResult<Option<Vec<String>>> {
        let mut len_buf = [0u8; 2];
        if !self.read_exact_or_eof(&mut len_buf).await? {
            return Ok(None);
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let payload = self.read_raw(len).await?;
        if len == 0 {
            return Err(ChannelError::Protocol(
                "array message requires at least one argument".to_string(),
            ));
        }
        if payload.last() != Some(&0) {
            return Err(ChannelError::Protocol(
                "array message payload must end with NUL".to_string(),
            ));
        }
        let args = payload[..payload.len() - 1]
            .split(|b| *b == 0)
            .map(|chunk| {
                String::from_utf8(chunk.to_vec())
                    .map_err(|e| ChannelError::Protocol(format!("non-UTF8 argument: {e}")))
            })
            .collect::<ChannelResult<Vec<_>>>()?;
        Ok(Some(args))
    }

    /// Writes a scalar message: arbitrary bytes framed by a u32 length.
    pub async fn write_scalar(&mut self, bytes: &[u8]) -> ChannelResult<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| ChannelError::Protocol("scalar message too large".to_string()))?;
        let timeout = self.write_timeout;
        let stream = &mut self.stream;
        with_timeout(timeout, async {
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(bytes).await
        })
        .await
    }

    /// Reads a scalar message. Returns `Ok(None)` on clean EOF before any
    /// bytes of the length prefix arrive.
    pub async fn read_scalar(&mut self) -> ChannelResult<Option<Vec<u8>>> {
        self.read_scalar_bounded(usize::MAX).await
    }

    /// Like [`read_scalar`](Self::read_scalar), but rejects the frame based
    /// on its length prefix alone, before allocating or reading its
    /// payload. Used on paths (e.g. the login handshake) where the sender
    /// is not yet trusted and an oversized length must not itself cause an
    /// oversized allocation.
    pub async fn read_scalar_bounded(
        &mut self,
        max_len: usize,
    ) -> ChannelResult<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut len_buf).await? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_len {
            return Err(ChannelError::Protocol(format!(
                "scalar message of {len} bytes exceeds the {max_len}-byte limit"
            )));
        }
        Ok(Some(self.read_raw(len).await?))
    }

    /// Sends exactly one file descriptor, plus a one-byte dummy payload.
    pub async fn send_fd(&mut self, fd: RawFd) -> ChannelResult<()> {
        let raw = self.stream.as_raw_fd();
        loop {
            self.stream.writable().await?;
            let result = self.stream.try_io(Interest::WRITABLE, || {
                let iov_buf = [1u8];
                let iov = [std::io::IoSlice::new(&iov_buf)];
                let cmsg = [ControlMessage::ScmRights(std::slice::from_ref(&fd))];
                sendmsg::<()>(raw, &iov, &cmsg, MsgFlags::empty(), None)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Receives exactly one file descriptor. Any other ancillary-data shape
    /// (zero or more than one fd) is a protocol error.
    pub async fn recv_fd(&mut self) -> ChannelResult<OwnedFd> {
        let raw = self.stream.as_raw_fd();
        loop {
            self.stream.readable().await?;
            let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
            let mut iov_buf = [0u8; 1];
            let result = self.stream.try_io(Interest::READABLE, || {
                let mut iov = [std::io::IoSliceMut::new(&mut iov_buf)];
                recvmsg::<()>(raw, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                    .map(|msg| {
                        let fds: Vec<RawFd> = msg
                            .cmsgs()
                            .ok()
                            .into_iter()
                            .flatten()
                            .filter_map(|cmsg| match cmsg {
                                ControlMessageOwned::ScmRights(fds) => Some(fds),
                                _ => None,
                            })
                            .flatten()
                            .collect();
                        fds
                    })
            });
            match result {
                Ok(fds) => {
                    if fds.len() != 1 {
                        let got = fds.len();
                        for fd in fds {
                            // SAFETY: freshly received fds we are discarding
                            // because the frame was malformed.
                            unsafe {
                                libc::close(fd);
                            }
                        }
                        return Err(ChannelError::FdPassing(format!(
                            "expected exactly one file descriptor, got {got}"
                        )));
                    }
                    // SAFETY: fd came from a just-completed recvmsg() with
                    // SCM_RIGHTS; we are the sole owner.
                    return Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }
}

async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> ChannelResult<T>
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    async fn pair() -> (MessageChannel, MessageChannel) {
        let (a, b) = UnixStream::pair().unwrap();
        (MessageChannel::new(a), MessageChannel::new(b))
    }

    #[tokio::test]
    async fn array_round_trip() {
        let (mut a, mut b) = pair().await;
        let args = vec!["spawn_application".to_string(), "/app".to_string()];
        a.write_array(&args).await.unwrap();
        let got = b.read_array().await.unwrap().unwrap();
        assert_eq!(got, args);
    }

    #[tokio::test]
    async fn scalar_round_trip() {
        let (mut a, mut b) = pair().await;
        let payload = b"CONTENT_TYPE\0text/html\0".to_vec();
        a.write_scalar(&payload).await.unwrap();
        let got = b.read_scalar().await.unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn read_scalar_bounded_rejects_an_oversized_length_prefix_without_reading_payload() {
        let (mut a, mut b) = pair().await;
        a.write_scalar(&vec![0u8; 1024]).await.unwrap();
        let err = b.read_scalar_bounded(100).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[tokio::test]
    async fn read_array_returns_none_on_clean_eof() {
        let (a, mut b) = pair().await;
        drop(a);
        let got = b.read_array().await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn array_rejects_nul_in_argument() {
        let (mut a, _b) = pair().await;
        let err = a.write_array(&["bad\0arg"]).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[tokio::test]
    async fn fd_passing_round_trip() {
        let (mut a, mut b) = pair().await;
        let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();

        a.send_fd(pipe_w.into_raw_fd()).await.unwrap();
        let received = b.recv_fd().await.unwrap();

        // Write on the original read-end's pair: write via the fd we just
        // received, and confirm it shows up on pipe_r.
        use tokio::io::unix::AsyncFd;
        let async_received = AsyncFd::new(received).unwrap();
        async_received
            .writable()
            .await
            .unwrap()
            .try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(raw, b"hi".as_ptr() as *const _, 2) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n)
                }
            })
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 2];
        let async_reader = AsyncFd::new(pipe_r).unwrap();
        async_reader
            .readable()
            .await
            .unwrap()
            .try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut _, 2) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n)
                }
            })
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hi");
    }
}
