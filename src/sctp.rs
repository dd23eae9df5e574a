//! Linux kernel SCTP transport (feature `kernel-sctp`)
//!
//! One-to-one style SCTP sockets using the kernel's SCTP stack. Requires the
//! SCTP kernel module to be loaded (`modprobe sctp`). Multihoming is done
//! through the bindx/connectx socket options so a server can listen on an
//! endpoint list and a client can offer a candidate address list.
//!
//! TODO: subscribe to SCTP_PEER_ADDR_CHANGE notifications and surface them
//! as EndpointChange events instead of keeping the initial candidate list.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::ptr;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{AgentError, AgentResult};

/// SCTP socket option level
const SOL_SCTP: c_int = 132;

/// SCTP socket options
const SCTP_NODELAY: c_int = 3;
const SCTP_SOCKOPT_BINDX_ADD: c_int = 100;
const SCTP_SOCKOPT_CONNECTX: c_int = 110;

/// Pack socket addresses back-to-back the way bindx/connectx expect them
fn pack_sockaddrs(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::new();
    for addr in addrs {
        match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                let raw = unsafe {
                    std::slice::from_raw_parts(
                        &sin as *const _ as *const u8,
                        mem::size_of::<libc::sockaddr_in>(),
                    )
                };
                buf.extend_from_slice(raw);
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                let raw = unsafe {
                    std::slice::from_raw_parts(
                        &sin6 as *const _ as *const u8,
                        mem::size_of::<libc::sockaddr_in6>(),
                    )
                };
                buf.extend_from_slice(raw);
            }
        }
    }
    buf
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(sin.sin_addr.s_addr);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip.into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                sin6.sin6_addr.s6_addr.into(),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {other}"),
        )),
    }
}

fn new_socket(family: c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_SCTP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn setsockopt_raw(fd: RawFd, level: c_int, opt: c_int, value: &[u8]) -> io::Result<()> {
    let rv = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            value.as_ptr() as *const c_void,
            value.len() as socklen_t,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let rv = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage)
}

fn peer_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let rv = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage)
}

fn socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let rv = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Connected one-to-one SCTP association usable as a byte stream
pub struct SctpStream {
    inner: AsyncFd<OwnedFd>,
    local_eps: Vec<SocketAddr>,
    remote_eps: Vec<SocketAddr>,
}

impl SctpStream {
    /// Connect over a candidate address list, bounded by `timeout`
    pub async fn connect(addrs: &[SocketAddr], timeout: Duration) -> AgentResult<Self> {
        let family = match addrs.first() {
            Some(SocketAddr::V4(_)) => libc::AF_INET,
            Some(SocketAddr::V6(_)) => libc::AF_INET6,
            None => return Err(AgentError::ConnectFailed("no candidate endpoints".into())),
        };

        let fd = new_socket(family)?;
        let nodelay: c_int = 1;
        setsockopt_raw(
            fd.as_raw_fd(),
            SOL_SCTP,
            SCTP_NODELAY,
            unsafe {
                std::slice::from_raw_parts(
                    &nodelay as *const _ as *const u8,
                    mem::size_of::<c_int>(),
                )
            },
        )?;

        let packed = pack_sockaddrs(addrs);
        let rv = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_SCTP,
                SCTP_SOCKOPT_CONNECTX,
                packed.as_ptr() as *const c_void,
                packed.len() as socklen_t,
            )
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(AgentError::ConnectFailed(err.to_string()));
            }
        }

        let async_fd = AsyncFd::new(fd)?;
        let wait = async {
            loop {
                let mut guard = async_fd.writable().await?;
                match guard.try_io(|inner| socket_error(inner.as_raw_fd())) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AgentError::ConnectTimeout)?
            .map_err(|e: io::Error| AgentError::ConnectFailed(e.to_string()))?;

        let local = local_addr_of(async_fd.get_ref().as_raw_fd())?;
        Ok(Self {
            inner: async_fd,
            local_eps: vec![local],
            remote_eps: addrs.to_vec(),
        })
    }

    fn from_fd(fd: OwnedFd) -> AgentResult<Self> {
        let local = local_addr_of(fd.as_raw_fd())?;
        let remote = peer_addr_of(fd.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
            local_eps: vec![local],
            remote_eps: vec![remote],
        })
    }

    /// Local endpoint set
    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.local_eps.clone()
    }

    /// Remote endpoint set
    pub fn remote_endpoints(&self) -> Vec<SocketAddr> {
        self.remote_eps.clone()
    }
}

impl AsyncRead for SctpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            let mut guard = ready!(me.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut c_void,
                        unfilled.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SctpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        loop {
            let mut guard = ready!(me.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        data.as_ptr() as *const c_void,
                        data.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let rv = unsafe { libc::shutdown(self.inner.get_ref().as_raw_fd(), libc::SHUT_WR) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Poll::Ready(Err(err));
            }
        }
        Poll::Ready(Ok(()))
    }
}

/// Listening SCTP socket bound over an endpoint list
pub struct SctpListener {
    inner: AsyncFd<OwnedFd>,
    local_eps: Vec<SocketAddr>,
}

impl SctpListener {
    /// Bind and listen on `port` across the given endpoint list
    pub fn bind(port: u16, endpoints: &[IpAddr]) -> AgentResult<Self> {
        if endpoints.is_empty() {
            return Err(AgentError::ConnectFailed("no bind endpoints".into()));
        }

        let family = if endpoints.iter().any(|ip| ip.is_ipv6()) {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let fd = new_socket(family)?;

        let reuse: c_int = 1;
        setsockopt_raw(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            unsafe {
                std::slice::from_raw_parts(
                    &reuse as *const _ as *const u8,
                    mem::size_of::<c_int>(),
                )
            },
        )?;

        let addrs: Vec<SocketAddr> = endpoints.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
        let packed = pack_sockaddrs(&addrs);
        setsockopt_raw(fd.as_raw_fd(), SOL_SCTP, SCTP_SOCKOPT_BINDX_ADD, &packed)?;

        let rv = unsafe { libc::listen(fd.as_raw_fd(), 5) };
        if rv < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            inner: AsyncFd::new(fd)?,
            local_eps: addrs,
        })
    }

    /// Accept one association
    pub async fn accept(&self) -> AgentResult<SctpStream> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let fd = unsafe {
                    libc::accept4(
                        inner.as_raw_fd(),
                        ptr::null_mut(),
                        ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                if fd < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(fd)
                }
            }) {
                Ok(Ok(fd)) => {
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    return SctpStream::from_fd(owned);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// First bound address
    pub fn local_addr(&self) -> AgentResult<SocketAddr> {
        self.local_eps
            .first()
            .copied()
            .ok_or_else(|| AgentError::ConnectFailed("no bind endpoints".into()))
    }
}
