//! Local-socket addresses: either a filesystem path or, on Linux, an
//! abstract-namespace name.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAddress {
    Path(PathBuf),
    /// Linux-only abstract namespace socket, named without the leading NUL.
    Abstract(String),
}

impl ListenerAddress {
    pub fn is_abstract(&self) -> bool {
        matches!(self, ListenerAddress::Abstract(_))
    }

    /// Build a [`nix`] socket address usable with `connect()`/`bind()`.
    pub fn to_unix_addr(&self) -> std::io::Result<nix::sys::socket::UnixAddr> {
        match self {
            ListenerAddress::Path(path) => nix::sys::socket::UnixAddr::new(path)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32)),
            ListenerAddress::Abstract(name) => {
                #[cfg(target_os = "linux")]
                {
                    nix::sys::socket::UnixAddr::new_abstract(name.as_bytes())
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let _ = name;
                    Err(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "abstract namespace sockets require Linux",
                    ))
                }
            }
        }
    }

    /// Human-readable form for logging, matching the wire representation
    /// used when the spawn server reports `usingAbstractNamespace`.
    pub fn wire_repr(&self) -> (String, bool) {
        match self {
            ListenerAddress::Path(path) => (path.display().to_string(), false),
            ListenerAddress::Abstract(name) => (name.clone(), true),
        }
    }

    pub fn from_wire(addr: String, using_abstract_namespace: bool) -> Self {
        if using_abstract_namespace {
            ListenerAddress::Abstract(addr)
        } else {
            ListenerAddress::Path(PathBuf::from(addr))
        }
    }
}

impl std::fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerAddress::Path(path) => write!(f, "{}", path.display()),
            ListenerAddress::Abstract(name) => write!(f, "abstract:{name}"),
        }
    }
}
