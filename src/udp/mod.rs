//! UDP hole punching.
//!
//! use `Server` to run a rendezvous coordinator.
//!
//! use `Client` to register, get paired, punch, and obtain a `Session` with the peer.

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Client, State};

#[cfg(feature = "client")]
mod session;
#[cfg(feature = "client")]
pub use session::{classify_line, Incoming, Input, Session, Termination};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{Pairing, Registration, Registry, Server};

#[cfg(feature = "client")]
use crate::error::{Error, Result};
#[cfg(feature = "client")]
use socket2::{Domain, Protocol, Socket, Type};
#[cfg(feature = "client")]
use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

/// Bind a udp socket with SO_REUSEADDR so a port released a moment ago can be
/// taken again.
#[cfg(feature = "client")]
pub(crate) fn bind_socket(local_addr: SocketAddr) -> Result<UdpSocket> {
    let bind_err = |source| Error::Bind {
        addr: local_addr,
        source,
    };

    let socket = Socket::new(Domain::for_address(local_addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&local_addr.into()).map_err(bind_err)?;

    Ok(socket.into())
}

/// One receive attempt on a non-blocking socket.
///
/// `Ok(None)` means nothing has arrived yet; in that case the call first waits up
/// to `wait` so callers can loop on it without spinning.
#[cfg(feature = "client")]
pub(crate) fn poll_recv(
    socket: &UdpSocket,
    buf: &mut [u8],
    wait: Duration,
) -> io::Result<Option<(usize, SocketAddr)>> {
    match socket.recv_from(buf) {
        Ok(r) => Ok(Some(r)),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            wait_readable(socket, wait);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(all(feature = "client", unix))]
fn wait_readable(socket: &UdpSocket, wait: Duration) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsFd;

    let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
    if let Err(e) = poll(&mut fds, PollTimeout::from(millis)) {
        log::trace!("poll failed: {}", e);
        std::thread::sleep(wait);
    }
}

#[cfg(all(feature = "client", not(unix)))]
fn wait_readable(_socket: &UdpSocket, wait: Duration) {
    std::thread::sleep(wait);
}
