//! Socket addresses and synchronous listener construction.
//!
//! Listener setup (socket/bind/listen) happens synchronously before any ring
//! submission; only the resulting descriptor and address are handed to the
//! reactor. Peer addresses cross the kernel boundary as raw `sockaddr`
//! storage owned by the operation records ([`RawSockAddr`]) and surface to
//! callers as the [`PeerAddr`] sum type.

use std::ffi::OsString;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::sockopt::ReuseAddr;
use nix::sys::socket::{
    bind, getsockname, listen, setsockopt, socket, AddressFamily, Backlog, SockFlag, SockProtocol,
    SockType, SockaddrIn, UnixAddr,
};

use crate::error::{Error, Result};
use crate::fd::Socket;

pub const DEFAULT_BACKLOG: i32 = 32;

/// Peer address of an accepted or connected socket, one case per supported
/// address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddrV4),
    Unix(PathBuf),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Listening TCP socket plus the address it is bound to.
#[derive(Debug, Clone, Copy)]
pub struct TcpListener {
    socket: Socket,
    address: SocketAddrV4,
}

impl TcpListener {
    pub fn socket(&self) -> Socket {
        self.socket
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }
}

/// Listening Unix-domain socket plus its filesystem path.
#[derive(Debug, Clone)]
pub struct UnixListener {
    socket: Socket,
    path: PathBuf,
}

impl UnixListener {
    pub fn socket(&self) -> Socket {
        self.socket
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Create a TCP listener bound to `addr:port`.
#[tracing::instrument(level = "debug")]
pub fn tcp_listen(addr: Ipv4Addr, port: u16, backlog: i32) -> Result<TcpListener> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        SockProtocol::Tcp,
    )
    .map_err(|e| Error::from_errno("socket", e))?;

    setsockopt(&sock, ReuseAddr, &true)
        .map_err(|e| Error::from_errno("setsockopt(SO_REUSEADDR)", e))?;

    bind(
        sock.as_raw_fd(),
        &SockaddrIn::from(SocketAddrV4::new(addr, port)),
    )
    .map_err(|e| Error::from_errno("bind", e))?;
    listen(
        &sock,
        Backlog::new(backlog).map_err(|e| Error::from_errno("listen", e))?,
    )
    .map_err(|e| Error::from_errno("listen", e))?;

    // Read the address back so an ephemeral port (bind to port 0) is
    // reported correctly.
    let bound = getsockname::<SockaddrIn>(sock.as_raw_fd())
        .map_err(|e| Error::from_errno("getsockname", e))?;
    let address = SocketAddrV4::new(bound.ip(), bound.port());

    let listener = TcpListener {
        socket: Socket::from_raw(sock.into_raw_fd()),
        address,
    };
    tracing::debug!(socket = %listener.socket, %address, "tcp listener ready");
    Ok(listener)
}

/// Create a TCP listener on `INADDR_ANY:port`.
pub fn tcp_listen_any(port: u16, backlog: i32) -> Result<TcpListener> {
    tcp_listen(Ipv4Addr::UNSPECIFIED, port, backlog)
}

/// Create a Unix-domain listener at `path`, replacing a stale socket file if
/// one is present.
#[tracing::instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
pub fn unix_listen(path: impl AsRef<Path>, backlog: i32) -> Result<UnixListener> {
    let path = path.as_ref();
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| Error::from_errno("socket", e))?;

    match nix::unistd::unlink(path) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(e) => return Err(Error::from_errno("unlink", e)),
    }

    let address = UnixAddr::new(path).map_err(|e| Error::from_errno("bind", e))?;
    bind(sock.as_raw_fd(), &address).map_err(|e| Error::from_errno("bind", e))?;
    listen(
        &sock,
        Backlog::new(backlog).map_err(|e| Error::from_errno("listen", e))?,
    )
    .map_err(|e| Error::from_errno("listen", e))?;

    let listener = UnixListener {
        socket: Socket::from_raw(sock.into_raw_fd()),
        path: path.to_path_buf(),
    };
    tracing::debug!(socket = %listener.socket, "unix listener ready");
    Ok(listener)
}

/// Create a datagram socket bound to `addr:port`. Receive-only in this core;
/// the returned socket is handed straight to
/// [`Reactor::receive`](crate::reactor::Reactor::receive).
#[tracing::instrument(level = "debug")]
pub fn udp_receiver(addr: Ipv4Addr, port: u16) -> Result<Socket> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        SockProtocol::Udp,
    )
    .map_err(|e| Error::from_errno("socket", e))?;

    bind(sock.as_raw_fd(), &SockaddrIn::from(SocketAddrV4::new(addr, port)))
        .map_err(|e| Error::from_errno("bind", e))?;

    Ok(Socket::from_raw(sock.into_raw_fd()))
}

/// Create an unconnected stream socket for the given family; used by the
/// connect operations before submission.
pub(crate) fn client_socket(family: AddressFamily) -> Result<Socket> {
    let protocol = match family {
        AddressFamily::Inet => Some(SockProtocol::Tcp),
        _ => None,
    };
    let sock = socket(family, SockType::Stream, SockFlag::empty(), protocol)
        .map_err(|e| Error::from_errno("socket", e))?;
    Ok(Socket::from_raw(sock.into_raw_fd()))
}

/// Raw `sockaddr` storage embedded in operation records. The kernel reads
/// (connect) or writes (accept) these bytes after the submit call returns,
/// so the storage must stay at a stable address until completion; records
/// are boxed, which pins it.
pub(crate) enum RawSockAddr {
    Inet(libc::sockaddr_in),
    Unix(libc::sockaddr_un),
}

impl RawSockAddr {
    pub(crate) fn inet(addr: SocketAddrV4) -> RawSockAddr {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        raw.sin_family = libc::AF_INET as libc::sa_family_t;
        raw.sin_port = addr.port().to_be();
        raw.sin_addr = libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        };
        RawSockAddr::Inet(raw)
    }

    pub(crate) fn unix(path: &Path) -> Result<RawSockAddr> {
        let mut raw: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        raw.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_os_str().as_bytes();
        // One byte stays reserved for the terminating NUL.
        if bytes.len() >= raw.sun_path.len() {
            return Err(Error::os("connect", libc::ENAMETOOLONG));
        }
        for (dst, src) in raw.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(RawSockAddr::Unix(raw))
    }

    /// Zeroed staging for an incoming peer address of the given family.
    pub(crate) fn staging_inet() -> RawSockAddr {
        RawSockAddr::Inet(unsafe { std::mem::zeroed() })
    }

    pub(crate) fn staging_unix() -> RawSockAddr {
        RawSockAddr::Unix(unsafe { std::mem::zeroed() })
    }

    /// Zero the staging bytes between accept re-arms.
    pub(crate) fn clear(&mut self) {
        match self {
            RawSockAddr::Inet(raw) => *raw = unsafe { std::mem::zeroed() },
            RawSockAddr::Unix(raw) => *raw = unsafe { std::mem::zeroed() },
        }
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            RawSockAddr::Inet(raw) => std::ptr::from_ref(raw).cast(),
            RawSockAddr::Unix(raw) => std::ptr::from_ref(raw).cast(),
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        match self {
            RawSockAddr::Inet(raw) => std::ptr::from_mut(raw).cast(),
            RawSockAddr::Unix(raw) => std::ptr::from_mut(raw).cast(),
        }
    }

    pub(crate) fn socklen(&self) -> libc::socklen_t {
        match self {
            RawSockAddr::Inet(_) => std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            RawSockAddr::Unix(_) => std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        }
    }

    pub(crate) fn to_peer(&self) -> PeerAddr {
        match self {
            RawSockAddr::Inet(raw) => PeerAddr::Inet(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
                u16::from_be(raw.sin_port),
            )),
            RawSockAddr::Unix(raw) => {
                let bytes: Vec<u8> = raw
                    .sun_path
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                PeerAddr::Unix(PathBuf::from(OsString::from_vec(bytes)))
            }
        }
    }
}
