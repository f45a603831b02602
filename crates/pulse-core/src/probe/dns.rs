//! Host resolution. IPv4 only; the first A record wins.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};

/// Resolves `host:port` and returns the first IPv4 address. Blocking; callers
/// treat a failure as a failed probe, not an error.
pub fn resolve_v4(host: &str, port: u16) -> io::Result<SocketAddrV4> {
    let addrs = (host, port).to_socket_addrs()?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no IPv4 address for '{host}'"),
    ))
}
