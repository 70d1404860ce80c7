//! Network interface enumeration through interface ioctls

use crate::error::{OsError, Result};
use crate::syscall::{ioctl, IoctlRequest};
use bitflags::bitflags;
use std::ffi::c_int;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const IFNAMSIZ: usize = 16;
const MAX_IF: usize = 32;

bitflags! {
    /// Interface state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterfaceFlags: u32 {
        /// Administratively up
        const UP = 1 << 0;
        /// Supports broadcast
        const BROADCAST = 1 << 1;
        /// Loopback
        const LOOPBACK = 1 << 2;
        /// Point-to-point link
        const POINT_TO_POINT = 1 << 3;
        /// Supports multicast
        const MULTICAST = 1 << 4;
        /// Link is running
        const RUNNING = 1 << 5;
    }
}

impl InterfaceFlags {
    fn from_native(raw: c_int) -> Self {
        let table = [
            (libc::IFF_UP, InterfaceFlags::UP),
            (libc::IFF_BROADCAST, InterfaceFlags::BROADCAST),
            (libc::IFF_LOOPBACK, InterfaceFlags::LOOPBACK),
            (libc::IFF_POINTOPOINT, InterfaceFlags::POINT_TO_POINT),
            (libc::IFF_MULTICAST, InterfaceFlags::MULTICAST),
            (libc::IFF_RUNNING, InterfaceFlags::RUNNING),
        ];
        table
            .iter()
            .filter(|(bit, _)| raw & bit != 0)
            .fold(InterfaceFlags::empty(), |acc, (_, flag)| acc | *flag)
    }
}

/// One network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface index
    pub index: u32,
    /// Name, e.g. `eth0`
    pub name: String,
    /// MTU in bytes
    pub mtu: u32,
    /// Hardware address, empty if the interface has none
    pub hardware_addr: Vec<u8>,
    /// State flags
    pub flags: InterfaceFlags,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    ifru: [u8; 24],
}

#[repr(C)]
struct IfConf {
    len: c_int,
    req: *mut IfReq,
}

impl IfReq {
    fn named(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() >= IFNAMSIZ || bytes.contains(&0) {
            return Err(OsError::InvalidAddress(format!("interface name {:?}", name)));
        }
        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            ifru: [0; 24],
        };
        req.name[..bytes.len()].copy_from_slice(bytes);
        Ok(req)
    }

    fn name(&self) -> String {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn int(&self) -> i32 {
        i32::from_ne_bytes([self.ifru[0], self.ifru[1], self.ifru[2], self.ifru[3]])
    }

    fn short(&self) -> i16 {
        i16::from_ne_bytes([self.ifru[0], self.ifru[1]])
    }
}

fn dgram_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket creation
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(OsError::last("socket"));
    }
    // SAFETY: fd was just created and is owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_ioctl(sock: &OwnedFd, request: IoctlRequest, req: &mut IfReq) -> Result<()> {
    // SAFETY: every interface ioctl used here reads and writes one ifreq
    unsafe { ioctl(sock.as_raw_fd(), request, (req as *mut IfReq).cast()) }.map(|_| ())
}

fn configured(sock: &OwnedFd) -> Result<Vec<IfReq>> {
    let mut reqs = [IfReq {
        name: [0; IFNAMSIZ],
        ifru: [0; 24],
    }; MAX_IF];
    let mut conf = IfConf {
        len: std::mem::size_of_val(&reqs) as c_int,
        req: reqs.as_mut_ptr(),
    };
    // SAFETY: conf describes the reqs buffer
    unsafe {
        ioctl(
            sock.as_raw_fd(),
            libc::SIOCGIFCONF as IoctlRequest,
            (&mut conf as *mut IfConf).cast(),
        )?;
    }
    let count = conf.len as usize / std::mem::size_of::<IfReq>();
    Ok(reqs[..count.min(MAX_IF)].to_vec())
}

/// Interfaces with an address configured. `index == 0` returns all of
/// them, otherwise only the one with that index.
pub fn interface_table(index: u32) -> Result<Vec<Interface>> {
    let sock = dgram_socket()?;
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for mut req in configured(&sock)? {
        ifreq_ioctl(&sock, libc::SIOCGIFINDEX as IoctlRequest, &mut req)?;
        let ifindex = req.int() as u32;
        if (index != 0 && ifindex != index) || !seen.insert(ifindex) {
            continue;
        }
        let name = req.name();

        ifreq_ioctl(&sock, libc::SIOCGIFMTU as IoctlRequest, &mut req)?;
        let mut mtu = req.int() as u32;

        let hardware_addr = match ifreq_ioctl(&sock, libc::SIOCGIFHWADDR as IoctlRequest, &mut req) {
            Ok(()) => req.ifru[2..8].to_vec(),
            Err(_) => Vec::new(),
        };

        ifreq_ioctl(&sock, libc::SIOCGIFFLAGS as IoctlRequest, &mut req)?;
        let flags = InterfaceFlags::from_native(req.short() as u16 as c_int);
        if flags.contains(InterfaceFlags::LOOPBACK) && mtu == 0 {
            mtu = 65536;
        }

        out.push(Interface {
            index: ifindex,
            name,
            mtu,
            hardware_addr,
            flags,
        });
    }
    Ok(out)
}

/// IPv4 address of interface `name`
pub fn interface_addrs(name: &str) -> Result<Vec<IpAddr>> {
    let sock = dgram_socket()?;
    let mut req = IfReq::named(name)?;
    ifreq_ioctl(&sock, libc::SIOCGIFADDR as IoctlRequest, &mut req)?;
    // sockaddr_in: family (2), port (2), address (4)
    let v4 = Ipv4Addr::new(req.ifru[4], req.ifru[5], req.ifru[6], req.ifru[7]);
    Ok(vec![IpAddr::V4(v4)])
}

fn fields<'a>(line: &'a str, separators: &'a [char]) -> Vec<&'a str> {
    line.split(|c| separators.contains(&c))
        .filter(|f| !f.is_empty())
        .collect()
}

fn hex_bytes<const N: usize>(hex: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    if hex.len() < 2 * N {
        return None;
    }
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
    }
    Some(out)
}

/// IPv4 multicast groups from an `igmp` table. The first line is a header;
/// each following line is `NAME GROUP ...` with the group as the hex dump
/// of a host-endian word. `name` filters by interface.
pub fn parse_igmp(text: &str, name: Option<&str>) -> Vec<Ipv4Addr> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let f = fields(line, &[' ', ':', '\r', '\t']);
            if f.len() < 3 || name.is_some_and(|n| n != f[0]) {
                return None;
            }
            let bytes = hex_bytes::<4>(f[1])?;
            Some(Ipv4Addr::from(u32::from_ne_bytes(bytes)))
        })
        .collect()
}

/// IPv6 multicast groups from an `igmp6` table: `NAME GROUP ...` per line,
/// group as 32 hex digits.
pub fn parse_igmp6(text: &str, name: Option<&str>) -> Vec<Ipv6Addr> {
    text.lines()
        .filter_map(|line| {
            let f = fields(line, &[' ', '\r', '\t']);
            if f.len() < 3 || name.is_some_and(|n| n != f[0]) {
                return None;
            }
            hex_bytes::<16>(f[1]).map(Ipv6Addr::from)
        })
        .collect()
}

/// Multicast groups joined by interface `name` (or every interface).
/// Missing tables yield no groups.
pub fn multicast_addrs(name: Option<&str>) -> Vec<IpAddr> {
    let v4 = std::fs::read_to_string("/proc/net/igmp")
        .map(|t| parse_igmp(&t, name))
        .unwrap_or_default();
    let v6 = std::fs::read_to_string("/proc/net/igmp6")
        .map(|t| parse_igmp6(&t, name))
        .unwrap_or_default();
    v4.into_iter()
        .map(IpAddr::V4)
        .chain(v6.into_iter().map(IpAddr::V6))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_igmp() {
        let group = u32::from(Ipv4Addr::new(224, 0, 0, 1)).to_ne_bytes();
        let hex: String = group.iter().map(|b| format!("{:02X}", b)).collect();
        let text = format!("NAME GROUP USERS\neth0 {} 1 0\nlo {} 1 0\nbad\n", hex, hex);

        assert_eq!(parse_igmp(&text, None).len(), 2);
        assert_eq!(parse_igmp(&text, Some("eth0")), vec![Ipv4Addr::new(224, 0, 0, 1)]);
        assert!(parse_igmp(&text, Some("wlan0")).is_empty());
    }

    #[test]
    fn test_parse_igmp6() {
        let text = "eth0 ff020000000000000000000000000001 1 0\nshort ff02 1 0\n";
        assert_eq!(
            parse_igmp6(text, None),
            vec!["ff02::1".parse::<Ipv6Addr>().unwrap()]
        );
    }

    #[test]
    fn test_interface_name_validation() {
        assert!(IfReq::named("eth0").is_ok());
        assert!(IfReq::named("a-very-long-interface-name").is_err());
    }

    #[test]
    fn test_loopback_enumerated() {
        let table = interface_table(0).unwrap();
        if let Some(lo) = table.iter().find(|i| i.flags.contains(InterfaceFlags::LOOPBACK)) {
            assert!(lo.mtu > 0);
            let only = interface_table(lo.index).unwrap();
            assert_eq!(only.len(), 1);
            assert_eq!(only[0].name, lo.name);
            let addrs = interface_addrs(&lo.name).unwrap();
            assert!(matches!(addrs[0], IpAddr::V4(a) if a.is_loopback()));
        }
    }
}
