//! Hosted IPv6 UDP transport.
//!
//! Wraps a nonblocking `std::net::UdpSocket` in `async_io::Async`. The
//! socket is created through `libc` because `SO_REUSEADDR` and the
//! multicast options must be applied before and around `bind(2)`, which
//! the std builder does not expose.

use std::io;
use std::mem;
use std::net::UdpSocket as StdUdpSocket;
use std::os::fd::FromRawFd;

use async_io::Async;

use crate::error::{KnxError, Result};
use crate::net::netif;
use crate::net::transport::AsyncTransport;
use crate::net::{IpEndpoint, Ipv6Addr};
use crate::protocol::constants::MULTICAST_HOPS;

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn setsockopt<T>(fd: libc::c_int, level: libc::c_int, opt: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: `value` points to a live, correctly-sized option struct and
    // the kernel copies it before returning.
    check(unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    })
    .map(|_| ())
}

/// Closes the descriptor unless it was handed over to a `UdpSocket`.
struct FdGuard(libc::c_int);

impl FdGuard {
    fn release(self) -> libc::c_int {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by this guard and not yet
        // wrapped in a UdpSocket.
        unsafe {
            libc::close(self.0);
        }
    }
}

/// An async IPv6 UDP socket configured for KNXnet/IP service.
///
/// Bound to `[::]:<port>` with `SO_REUSEADDR`, a multicast hop limit of
/// 10, multicast loopback enabled and, when an interface name is given,
/// `IPV6_MULTICAST_IF` pinned to it.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Async<StdUdpSocket>,
    ifindex: u32,
    joined: Option<Ipv6Addr>,
}

impl UdpTransport {
    /// Open and configure the socket.
    ///
    /// `port` 0 binds an ephemeral port. An empty interface name means
    /// default routing.
    pub fn bind(port: u16, interface: Option<&str>) -> io::Result<Self> {
        let ifindex = match interface {
            Some(name) if !name.is_empty() => netif::interface_index(name).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "unknown interface")
            })?,
            _ => 0,
        };

        // SAFETY: plain socket(2); the result is checked below.
        let fd = check(unsafe { libc::socket(libc::AF_INET6, libc::SOCK_DGRAM, 0) })?;
        let guard = FdGuard(fd);

        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &(1 as libc::c_int))?;
        setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MULTICAST_HOPS,
            &(MULTICAST_HOPS as libc::c_int),
        )?;
        setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, &(1 as libc::c_int))?;
        if ifindex != 0 {
            setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MULTICAST_IF,
                &(ifindex as libc::c_int),
            )?;
        }

        // SAFETY: sockaddr_in6 is valid when zeroed; family and port are
        // filled in before use.
        let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa.sin6_port = port.to_be();

        // SAFETY: `sa` outlives the call and the length matches the struct.
        check(unsafe {
            libc::bind(
                fd,
                &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        })?;

        // SAFETY: the descriptor is open, bound and exclusively ours.
        let socket = unsafe { StdUdpSocket::from_raw_fd(guard.release()) };

        Ok(Self {
            socket: Async::new(socket)?,
            ifindex,
            joined: None,
        })
    }

    /// The locally bound port (useful after binding port 0).
    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().local_addr().ok().map(|a| a.port())
    }
}

fn classify_io(err: &io::Error, fallback: KnxError) -> KnxError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
            KnxError::Timeout
        }
        _ => fallback,
    }
}

impl AsyncTransport for UdpTransport {
    async fn send_to(&mut self, data: &[u8], addr: IpEndpoint) -> Result<()> {
        self.socket
            .send_to(data, std::net::SocketAddr::from(addr))
            .await
            .map(|_| ())
            .map_err(|e| classify_io(&e, KnxError::send_failed()))
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint)> {
        let (len, src) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(|e| classify_io(&e, KnxError::receive_failed()))?;
        let src = IpEndpoint::try_from(src).map_err(|_| KnxError::receive_failed())?;
        Ok((len, src))
    }

    fn join_multicast(&mut self, group: Ipv6Addr) -> Result<()> {
        self.socket
            .as_ref()
            .join_multicast_v6(&group.into(), self.ifindex)
            .map_err(|_| KnxError::not_bound())?;
        self.joined = Some(group);
        Ok(())
    }

    fn leave_multicast(&mut self, group: Ipv6Addr) -> Result<()> {
        self.socket
            .as_ref()
            .leave_multicast_v6(&group.into(), self.ifindex)
            .map_err(|_| KnxError::not_bound())?;
        self.joined = None;
        Ok(())
    }

    fn local_endpoint(&self) -> Option<IpEndpoint> {
        self.socket
            .as_ref()
            .local_addr()
            .ok()
            .and_then(|a| IpEndpoint::try_from(a).ok())
    }

    fn close(&mut self) {
        if let Some(group) = self.joined.take() {
            let _ = self
                .socket
                .as_ref()
                .leave_multicast_v6(&group.into(), self.ifindex);
        }
    }
}
