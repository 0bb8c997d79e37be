use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::proto::{canonical, Family};

pub(crate) const MAX_DATAGRAM: usize = 2048;

/// Upper bound on one poll, so the exit flag is noticed promptly.
const POLL_SLICE_MS: u16 = 200;

/// The v4 and v6 sockets of an engine. Either may be missing when the
/// family is unavailable on this host, both are gone once the engine failed.
pub(crate) struct DualSocket {
    v4: RwLock<Option<UdpSocket>>,
    v6: RwLock<Option<UdpSocket>>,
}

impl DualSocket {
    /// Bind both families on `port`. Only fails when neither can be bound.
    ///
    /// `reuse` sets SO_REUSEADDR, for clients sharing a local port.
    pub fn bind(port: u16, reuse: bool) -> Result<Self> {
        let v4 = bind_or_warn(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), reuse);
        let v6 = bind_or_warn(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port), reuse);

        if v4.is_none() && v6.is_none() {
            return Err(Error::new(
                ErrorKind::AddrNotAvailable,
                "could not bind either address family",
            ));
        }

        Ok(Self {
            v4: RwLock::new(v4),
            v6: RwLock::new(v6),
        })
    }

    fn slot(&self, family: Family) -> &RwLock<Option<UdpSocket>> {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    pub fn has(&self, family: Family) -> bool {
        self.slot(family).read().unwrap().is_some()
    }

    pub fn local_addr(&self, family: Family) -> Option<SocketAddr> {
        self.slot(family).read().unwrap().as_ref()?.local_addr().ok()
    }

    /// Fire and forget, errors are only logged.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) {
        let addr = canonical(addr);
        let family = Family::of(&addr);
        let socket = self.slot(family).read().unwrap();
        let Some(socket) = socket.as_ref() else {
            log::trace!("no {} socket for {}", family, addr);
            return;
        };

        if let Err(e) = socket.send_to(buf, addr) {
            log::trace!("send to {} failed: {}", addr, e);
        }
    }

    /// Close both sockets. Later sends are dropped.
    pub fn close(&self) {
        for slot in [&self.v4, &self.v6] {
            let mut socket = slot.write().unwrap_or_else(|e| e.into_inner());
            *socket = None;
        }
    }

    /// Poll both sockets, feeding datagrams to `on_datagram` and calling `on_tick` every
    /// `interval`, until `exit` is set.
    ///
    /// A receive that fails for good, or a panic in either callback, sets `errored` and
    /// closes the sockets.
    pub fn run<D, T>(
        &self,
        exit: &AtomicBool,
        errored: &AtomicBool,
        interval: Duration,
        on_datagram: D,
        on_tick: T,
    ) -> Result<()>
    where
        D: FnMut(&[u8], SocketAddr),
        T: FnMut(),
    {
        let mut failed = Failed {
            sockets: self,
            errored,
            armed: true,
        };
        let res = self.poll_loop(exit, interval, on_datagram, on_tick);
        failed.armed = res.is_err();
        res
    }

    fn poll_loop<D, T>(
        &self,
        exit: &AtomicBool,
        interval: Duration,
        mut on_datagram: D,
        mut on_tick: T,
    ) -> Result<()>
    where
        D: FnMut(&[u8], SocketAddr),
        T: FnMut(),
    {
        let v4 = self.v4.read().unwrap();
        let v6 = self.v6.read().unwrap();
        let sockets: Vec<&UdpSocket> = v4.iter().chain(v6.iter()).collect();
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut next_tick = Instant::now();

        while !exit.load(Relaxed) {
            if Instant::now() >= next_tick {
                on_tick();
                next_tick = Instant::now() + interval;
            }

            let wait = next_tick
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(POLL_SLICE_MS as u128) as u16;

            let mut fds: Vec<PollFd> = sockets
                .iter()
                .map(|s| PollFd::new(s.as_fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, PollTimeout::from(wait)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<bool> = fds
                .iter()
                .map(|fd| {
                    fd.revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
                })
                .collect();

            for (socket, _) in sockets.iter().zip(ready).filter(|(_, ready)| *ready) {
                drain(socket, &mut buf, &mut on_datagram)?;
            }
        }

        Ok(())
    }
}

/// Marks the engine errored and closes its sockets unless disarmed, unwinding included.
struct Failed<'a> {
    sockets: &'a DualSocket,
    errored: &'a AtomicBool,
    armed: bool,
}

impl Drop for Failed<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.errored.store(true, Relaxed);
            self.sockets.close();
        }
    }
}

fn drain<D>(socket: &UdpSocket, buf: &mut [u8], on_datagram: &mut D) -> Result<()>
where
    D: FnMut(&[u8], SocketAddr),
{
    loop {
        match socket.recv_from(buf) {
            Ok((n, from)) => on_datagram(&buf[..n], from),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock => return Ok(()),
                // ICMP unreachable from an earlier send, nothing to do with this receive
                ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => {
                    log::trace!("recv: {}", e)
                }
                ErrorKind::Interrupted => {}
                _ => return Err(e),
            },
        }
    }
}

fn bind_or_warn(addr: SocketAddr, reuse: bool) -> Option<UdpSocket> {
    match bind(addr, reuse) {
        Ok(socket) => Some(socket),
        Err(e) => {
            log::warn!("disabling {}: {}", Family::of(&addr), e);
            None
        }
    }
}

pub(crate) fn bind(addr: SocketAddr, reuse: bool) -> Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    if domain == Domain::IPV6 {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}
