//! Monitoring of the `--feedback-fd` inherited from the embedding web
//! server: a single byte means graceful shutdown, EOF means the web
//! server died and this process should tear everything down.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

pub enum Event {
    GracefulShutdown,
    WebServerGone,
}

pub enum Monitor {
    Disabled,
    Fd(AsyncFd<OwnedFd>),
}

impl Monitor {
    /// # Safety-relevant note
    /// `fd` must be a valid, open file descriptor owned by this process
    /// (as it is when inherited across exec from the embedding web
    /// server); it is taken over and closed when the monitor is dropped.
    pub fn new(fd: Option<RawFd>) -> std::io::Result<Self> {
        match fd {
            None => Ok(Monitor::Disabled),
            Some(raw) => {
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                Ok(Monitor::Fd(AsyncFd::new(owned)?))
            }
        }
    }

    /// Resolves once a feedback event is observed. Never resolves if no
    /// fd was configured, so selecting against it is a no-op in that case.
    pub async fn wait(&self) -> Event {
        match self {
            Monitor::Disabled => std::future::pending().await,
            Monitor::Fd(async_fd) => loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => return Event::WebServerGone,
                };
                let result = guard.try_io(|inner| {
                    use std::os::fd::AsRawFd;
                    let mut byte = [0u8; 1];
                    let n = unsafe { libc::read(inner.get_ref().as_raw_fd(), byte.as_mut_ptr() as *mut _, 1) };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n)
                    }
                });
                match result {
                    Ok(Ok(0)) => return Event::WebServerGone,
                    Ok(Ok(_)) => return Event::GracefulShutdown,
                    Ok(Err(_)) => return Event::WebServerGone,
                    Err(_would_block) => continue,
                }
            },
        }
    }
}
