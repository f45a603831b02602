//! Non-blocking TCP connect probe.
//!
//! `start` resolves the target and fires a non-blocking `connect(2)`; the
//! scheduler then polls the in-flight handle once per tick. Success is the
//! socket reporting writable with no pending `SO_ERROR`; `POLLERR`, `POLLHUP`
//! or `POLLNVAL` fail the probe immediately. The socket is closed when the
//! handle drops.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::os::unix::io::AsRawFd;

use super::{dns, ConnectProbe, PendingProbe, ProbeOutcome};

/// Factory for non-blocking TCP connect probes.
pub struct TcpConnectProbe;

impl ConnectProbe for TcpConnectProbe {
    fn start(&mut self, host: &str, port: u16) -> io::Result<Box<dyn PendingProbe>> {
        let addr = dns::resolve_v4(host, port)?;

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&std::net::SocketAddr::V4(addr).into()) {
            Ok(()) => {}
            // The normal outcome of a non-blocking connect.
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        Ok(Box::new(TcpPending { socket }))
    }
}

struct TcpPending {
    socket: Socket,
}

impl PendingProbe for TcpPending {
    fn poll(&mut self) -> ProbeOutcome {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };

        // Zero timeout: a readiness check, never a wait.
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret < 0 {
            return ProbeOutcome::Error;
        }
        if ret == 0 {
            return ProbeOutcome::Pending;
        }

        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return ProbeOutcome::Error;
        }

        if pfd.revents & libc::POLLOUT != 0 {
            // Writable alone is not enough: a refused connect also reports
            // writable on some kernels. SO_ERROR settles it.
            return match self.socket.take_error() {
                Ok(None) => ProbeOutcome::Success,
                Ok(Some(_)) | Err(_) => ProbeOutcome::Error,
            };
        }

        ProbeOutcome::Pending
    }
}
