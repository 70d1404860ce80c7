//! Socket addresses in the target's BSD-style raw layout
//!
//! Every raw address starts with a length byte followed by a family byte,
//! unlike the host's 16-bit family field.

use crate::error::{OsError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Target address family numbers
pub mod family {
    /// Local (unix-domain) sockets
    pub const UNIX: u8 = 1;
    /// IPv4
    pub const INET: u8 = 2;
    /// IPv6
    pub const INET6: u8 = 10;
}

/// Raw IPv4 address size
pub const SIZEOF_INET4: usize = 16;
/// Raw IPv6 address size
pub const SIZEOF_INET6: usize = 28;
/// Raw unix-domain address size
pub const SIZEOF_UNIX: usize = 2 + UNIX_PATH_MAX;

const UNIX_PATH_MAX: usize = 104;

/// A socket address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    /// IPv4 address and port
    Inet4 {
        /// Address
        addr: Ipv4Addr,
        /// Port; checked against 0..=65535 when encoded
        port: i64,
    },
    /// IPv6 address, port and zone
    Inet6 {
        /// Address
        addr: Ipv6Addr,
        /// Port; checked against 0..=65535 when encoded
        port: i64,
        /// Scope (zone) id
        scope_id: u32,
    },
    /// Unix-domain path
    Unix(Vec<u8>),
}

fn check_port(port: i64) -> Result<[u8; 2]> {
    u16::try_from(port)
        .map(u16::to_be_bytes)
        .map_err(|_| OsError::PortOutOfRange(port))
}

impl SockAddr {
    /// Encode into the raw layout. The first byte of the result is its
    /// length.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            SockAddr::Inet4 { addr, port } => {
                let mut raw = vec![0u8; SIZEOF_INET4];
                raw[0] = SIZEOF_INET4 as u8;
                raw[1] = family::INET;
                raw[2..4].copy_from_slice(&check_port(*port)?);
                raw[4..8].copy_from_slice(&addr.octets());
                Ok(raw)
            }
            SockAddr::Inet6 {
                addr,
                port,
                scope_id,
            } => {
                let mut raw = vec![0u8; SIZEOF_INET6];
                raw[0] = SIZEOF_INET6 as u8;
                raw[1] = family::INET6;
                raw[2..4].copy_from_slice(&check_port(*port)?);
                // bytes 4..8: flow info, left zero
                raw[8..24].copy_from_slice(&addr.octets());
                raw[24..28].copy_from_slice(&scope_id.to_ne_bytes());
                Ok(raw)
            }
            SockAddr::Unix(path) => {
                let n = path.len();
                if n == 0 || n >= UNIX_PATH_MAX {
                    return Err(OsError::InvalidAddress(format!(
                        "unix path of {} bytes",
                        n
                    )));
                }
                // length, family, path, NUL
                let mut raw = Vec::with_capacity(n + 3);
                raw.push((n + 3) as u8);
                raw.push(family::UNIX);
                raw.extend_from_slice(path);
                raw.push(0);
                Ok(raw)
            }
        }
    }

    /// Decode a raw address.
    pub fn decode(raw: &[u8]) -> Result<SockAddr> {
        if raw.len() < 2 {
            return Err(OsError::InvalidAddress("truncated address".into()));
        }
        match raw[1] {
            family::UNIX => {
                let len = raw[0] as usize;
                if !(2..=SIZEOF_UNIX).contains(&len) || len > raw.len() {
                    return Err(OsError::InvalidAddress(format!("unix length {}", len)));
                }
                // Some systems count the trailing NUL in the length and some
                // do not; stop at the first NUL inside the length either way.
                let path = &raw[2..len];
                let end = path.iter().position(|&c| c == 0).unwrap_or(path.len());
                Ok(SockAddr::Unix(path[..end].to_vec()))
            }
            family::INET => {
                if raw.len() < 8 {
                    return Err(OsError::InvalidAddress("truncated inet address".into()));
                }
                Ok(SockAddr::Inet4 {
                    addr: Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]),
                    port: u16::from_be_bytes([raw[2], raw[3]]) as i64,
                })
            }
            family::INET6 => {
                if raw.len() < SIZEOF_INET6 {
                    return Err(OsError::InvalidAddress("truncated inet6 address".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw[8..24]);
                Ok(SockAddr::Inet6 {
                    addr: Ipv6Addr::from(octets),
                    port: u16::from_be_bytes([raw[2], raw[3]]) as i64,
                    scope_id: u32::from_ne_bytes([raw[24], raw[25], raw[26], raw[27]]),
                })
            }
            _ => Err(OsError::from_errno("sockaddr", libc::EAFNOSUPPORT)),
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => SockAddr::Inet4 {
                addr: *a.ip(),
                port: a.port() as i64,
            },
            SocketAddr::V6(a) => SockAddr::Inet6 {
                addr: *a.ip(),
                port: a.port() as i64,
                scope_id: a.scope_id(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet4_layout() {
        let raw = SockAddr::Inet4 {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 8080,
        }
        .encode()
        .unwrap();
        assert_eq!(raw[0] as usize, SIZEOF_INET4);
        assert_eq!(raw[1], family::INET);
        assert_eq!(&raw[2..4], &[0x1f, 0x90]);
        assert_eq!(&raw[4..8], &[10, 0, 0, 1]);
    }

    #[test]
    fn test_port_out_of_range() {
        let addr = SockAddr::Inet4 {
            addr: Ipv4Addr::LOCALHOST,
            port: 70000,
        };
        assert!(matches!(addr.encode(), Err(OsError::PortOutOfRange(70000))));
        let addr = SockAddr::Inet6 {
            addr: Ipv6Addr::LOCALHOST,
            port: -1,
            scope_id: 0,
        };
        assert!(matches!(addr.encode(), Err(OsError::PortOutOfRange(-1))));
    }

    #[test]
    fn test_unix_path_limits() {
        assert!(SockAddr::Unix(Vec::new()).encode().is_err());
        assert!(SockAddr::Unix(vec![b'a'; UNIX_PATH_MAX]).encode().is_err());
        let raw = SockAddr::Unix(b"/tmp/s".to_vec()).encode().unwrap();
        assert_eq!(raw[0], 9);
        assert_eq!(raw.last(), Some(&0));
    }

    #[test]
    fn test_unix_decode_with_and_without_nul() {
        let with_nul = [9, family::UNIX, b'/', b't', b'm', b'p', b'/', b's', 0];
        let without = [8, family::UNIX, b'/', b't', b'm', b'p', b'/', b's'];
        let expected = SockAddr::Unix(b"/tmp/s".to_vec());
        assert_eq!(SockAddr::decode(&with_nul).unwrap(), expected);
        assert_eq!(SockAddr::decode(&without).unwrap(), expected);
    }

    #[test]
    fn test_decode_inet6_from_std() {
        let std_addr: SocketAddr = "[fe80::1%3]:443".parse().unwrap();
        let raw = SockAddr::from(std_addr).encode().unwrap();
        match SockAddr::decode(&raw).unwrap() {
            SockAddr::Inet6 {
                addr,
                port,
                scope_id,
            } => {
                assert_eq!(addr, "fe80::1".parse::<Ipv6Addr>().unwrap());
                assert_eq!(port, 443);
                assert_eq!(scope_id, 3);
            }
            other => panic!("Expected Inet6, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_family() {
        let err = SockAddr::decode(&[16, 99, 0, 0]).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EAFNOSUPPORT));
    }
}
