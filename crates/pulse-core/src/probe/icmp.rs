//! ICMP echo probe over a raw IPv4 socket (Linux).
//!
//! Requires `CAP_NET_RAW` or root; availability is detected by attempting to
//! create the raw socket, and a denial downgrades the monitor to TCP probing.
//! Each ping blocks for at most its timeout, so ICMP mode serializes targets
//! within a tick.
//!
//! Reply validation compares only the echo identifier, not the sequence
//! number. Under heavy ICMP traffic on the host a foreign reply with a
//! colliding identifier could be accepted; the first non-matching reply fails
//! the probe instead of retrying.
//!
//! Non-Linux builds get a stub that always reports unavailable.

use std::fmt;

/// Why ICMP probing cannot be used on this host, in operator-readable form.
#[derive(Debug)]
pub struct IcmpUnavailable {
    pub reason: String,
}

impl fmt::Display for IcmpUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Echo request/reply message length: 8-byte header + 56-byte payload.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const ICMP_PACKET_LEN: usize = 64;
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const ICMP_ECHO_REQUEST: u8 = 8;
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const ICMP_ECHO_REPLY: u8 = 0;

/// One's-complement 16-bit Internet checksum (RFC 1071) over the whole
/// ICMP message.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&odd) = chunks.remainder().first() {
        sum += u32::from(odd) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(target_os = "linux")]
mod imp {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::mem::MaybeUninit;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    use super::{checksum, IcmpUnavailable};
    use super::{ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_PACKET_LEN};
    use crate::probe::{dns, Pinger};

    /// Microsecond monotonic timestamp; RTTs are reported as µs / 1000.
    fn now_us() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
    }

    /// Raw-socket echo pinger. One socket for the transport's lifetime.
    pub struct IcmpProbe {
        socket: Socket,
        identifier: u16,
        sequence: u16,
    }

    impl IcmpProbe {
        /// Creates the raw socket, or explains why it cannot be created.
        pub fn new() -> Result<Self, IcmpUnavailable> {
            let socket = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(IcmpUnavailable {
                        reason: "ICMP requires CAP_NET_RAW or root; \
                                 run: sudo setcap cap_net_raw+ep $(command -v netpulsed)"
                            .into(),
                    });
                }
                Err(e) => {
                    return Err(IcmpUnavailable {
                        reason: format!("failed to create raw ICMP socket: {e}"),
                    });
                }
            };

            // Backup bound; poll(2) is the primary timeout mechanism.
            socket.set_read_timeout(Some(Duration::from_secs(5))).ok();

            Ok(Self {
                socket,
                identifier: (std::process::id() % 65_536) as u16,
                sequence: 0,
            })
        }

        fn resolve(host: &str) -> Option<Ipv4Addr> {
            if let Ok(addr) = host.parse::<Ipv4Addr>() {
                return Some(addr);
            }
            dns::resolve_v4(host, 0).ok().map(|sa| *sa.ip())
        }
    }

    impl Pinger for IcmpProbe {
        fn ping(&mut self, host: &str, timeout_ms: u64) -> Option<f64> {
            let addr = Self::resolve(host)?;

            let mut packet = [0u8; ICMP_PACKET_LEN];
            packet[0] = ICMP_ECHO_REQUEST;
            packet[4..6].copy_from_slice(&self.identifier.to_be_bytes());
            packet[6..8].copy_from_slice(&self.sequence.to_be_bytes());
            self.sequence = self.sequence.wrapping_add(1);

            let send_us = now_us();
            packet[8..16].copy_from_slice(&send_us.to_le_bytes());

            let sum = checksum(&packet);
            packet[2..4].copy_from_slice(&sum.to_be_bytes());

            let dest = SocketAddrV4::new(addr, 0);
            self.socket.send_to(&packet, &dest.into()).ok()?;

            let mut pfd = libc::pollfd {
                fd: self.socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms.min(i32::MAX as u64) as i32) };
            if ret <= 0 {
                return None;
            }

            let mut buf = [MaybeUninit::<u8>::uninit(); 1024];
            let (received, _from) = self.socket.recv_from(&mut buf).ok()?;
            let recv_us = now_us();

            let bytes: &[u8] =
                unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, received) };

            // The raw socket hands back the IPv4 header too.
            let ip_header_len = (bytes[0] & 0x0f) as usize * 4;
            if received < ip_header_len + 8 {
                return None;
            }
            let icmp = &bytes[ip_header_len..];
            if icmp[0] != ICMP_ECHO_REPLY {
                return None;
            }
            if u16::from_be_bytes([icmp[4], icmp[5]]) != self.identifier {
                return None;
            }

            Some((recv_us - send_us) as f64 / 1000.0)
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::IcmpUnavailable;
    use crate::probe::Pinger;

    /// Stub for platforms without raw-socket ICMP support.
    pub struct IcmpProbe;

    impl IcmpProbe {
        pub fn new() -> Result<Self, IcmpUnavailable> {
            Err(IcmpUnavailable {
                reason: "ICMP probing is not supported on this platform".into(),
            })
        }
    }

    impl Pinger for IcmpProbe {
        fn ping(&mut self, _host: &str, _timeout_ms: u64) -> Option<f64> {
            None
        }
    }
}

pub use imp::IcmpProbe;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rfc1071_example() {
        // Classic example from RFC 1071 §3: words 0x0001 0xf203 0xf4f5 0xf6f7
        // sum to 0x2ddf0 → folded 0xddf2 → complement 0x220d.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn test_checksum_odd_length() {
        // Trailing odd byte is padded with zero on the right.
        assert_eq!(checksum(&[0xff]), !0xff00u16);
    }

    #[test]
    fn test_checksum_zeroes_verify() {
        // A message whose checksum field holds the computed checksum sums to
        // 0xffff before complement; verify by re-summing.
        let mut packet = [0u8; 16];
        packet[0] = 8;
        packet[4..6].copy_from_slice(&1234u16.to_be_bytes());
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&packet), 0);
    }
}
