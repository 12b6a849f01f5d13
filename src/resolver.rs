//! Address resolution collaborator.
//!
//! Turns `host:port` pairs into IPv4/IPv6 candidate lists and interface
//! specifications (`"eth0"`, `"eth0:8080"`, `":8080"`, `"192.168.1.10"`,
//! `"[::1]:9000"`, `""` for wildcard) into concrete local bind addresses.
//! Host resolution blocks, so the engines always run it on a helper thread
//! and post the result back stamped with the issuing generation.

use crate::error::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Result of resolving a remote host: zero or more candidates per family.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub v4: Vec<SocketAddr>,
    pub v6: Vec<SocketAddr>,
}

impl Resolved {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// Resolves `host:port` into per-family candidate lists.
///
/// Blocking; callers on an event loop must dispatch this to a helper thread.
pub fn resolve_host(host: &str, port: u16) -> Result<Resolved, Error> {
    let mut resolved = Resolved::default();
    let addrs = (host, port).to_socket_addrs().map_err(|e| Error::Resolution {
        host: host.to_string(),
        source: e,
    })?;
    for addr in addrs {
        match addr {
            SocketAddr::V4(_) => resolved.v4.push(addr),
            SocketAddr::V6(_) => resolved.v6.push(addr),
        }
    }
    if resolved.is_empty() {
        return Err(Error::NoAddresses(host.to_string()));
    }
    Ok(resolved)
}

/// Local bind addresses derived from an interface specification.
#[derive(Debug, Clone)]
pub struct BindAddrs {
    pub v4: Option<SocketAddr>,
    pub v6: Option<SocketAddr>,
}

impl BindAddrs {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// Resolves an interface spec plus a requested port into bind addresses.
///
/// A port embedded in the spec (`"eth0:8080"`, `":8080"`) takes effect only
/// when the caller passed port 0; an explicit caller port always wins.
pub fn resolve_interface(spec: &str, port: u16) -> Result<BindAddrs, Error> {
    let (name, embedded_port) = split_port(spec)?;
    let port = if port != 0 {
        port
    } else {
        embedded_port.unwrap_or(0)
    };

    if name.is_empty() {
        return Ok(BindAddrs {
            v4: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
            v6: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)),
        });
    }
    if name.eq_ignore_ascii_case("localhost") || name.eq_ignore_ascii_case("loopback") {
        return Ok(BindAddrs {
            v4: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
            v6: Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)),
        });
    }
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(match ip {
            IpAddr::V4(_) => BindAddrs {
                v4: Some(SocketAddr::new(ip, port)),
                v6: None,
            },
            IpAddr::V6(_) => BindAddrs {
                v4: None,
                v6: Some(SocketAddr::new(ip, port)),
            },
        });
    }

    // Not a literal: treat as an interface name and look up its addresses.
    let addrs = interface_addresses(name, port)?;
    if addrs.is_empty() {
        return Err(Error::InvalidInterface(spec.to_string()));
    }
    Ok(addrs)
}

// Splits "name:port" on the last colon, honoring [v6]:port bracket syntax.
fn split_port(spec: &str) -> Result<(&str, Option<u16>), Error> {
    let spec = spec.trim();
    if let Some(rest) = spec.strip_prefix('[') {
        // "[v6addr]" or "[v6addr]:port"
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidInterface(spec.to_string()))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| Error::InvalidInterface(spec.to_string()))?;
        return Ok((host, Some(port)));
    }
    // A bare IPv6 literal contains multiple colons and no port.
    if spec.matches(':').count() > 1 {
        return Ok((spec, None));
    }
    match spec.rsplit_once(':') {
        Some((name, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| Error::InvalidInterface(spec.to_string()))?;
            Ok((name, Some(port)))
        }
        None => Ok((spec, None)),
    }
}

/// Looks up the IPv4/IPv6 addresses assigned to a named interface.
#[cfg(unix)]
fn interface_addresses(name: &str, port: u16) -> Result<BindAddrs, Error> {
    use std::ffi::CStr;

    let mut out = BindAddrs { v4: None, v6: None };
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let mut cursor = ifap;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() {
            continue;
        }
        let ifname = unsafe { CStr::from_ptr(entry.ifa_name) };
        if ifname.to_string_lossy() != name {
            continue;
        }
        let family = unsafe { (*entry.ifa_addr).sa_family } as i32;
        if family == libc::AF_INET && out.v4.is_none() {
            let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            out.v4 = Some(SocketAddr::new(IpAddr::V4(ip), port));
        } else if family == libc::AF_INET6 && out.v6.is_none() {
            let sin6 = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            out.v6 = Some(SocketAddr::new(IpAddr::V6(ip), port));
        }
    }
    unsafe { libc::freeifaddrs(ifap) };
    Ok(out)
}

#[cfg(not(unix))]
fn interface_addresses(name: &str, _port: u16) -> Result<BindAddrs, Error> {
    Err(Error::InvalidInterface(name.to_string()))
}

/// Returns the OS index of a named interface, for IPv6 multicast membership.
#[cfg(unix)]
pub(crate) fn interface_index(name: &str) -> Result<u32, Error> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| Error::InvalidInterface(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(Error::InvalidInterface(name.to_string()));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_spec_binds_both_families() {
        let addrs = resolve_interface("", 8080).unwrap();
        assert_eq!(addrs.v4.unwrap().to_string(), "0.0.0.0:8080");
        assert_eq!(addrs.v6.unwrap().port(), 8080);
    }

    #[test]
    fn port_only_spec() {
        let addrs = resolve_interface(":9000", 0).unwrap();
        assert_eq!(addrs.v4.unwrap().port(), 9000);
    }

    #[test]
    fn explicit_port_wins_over_embedded() {
        let addrs = resolve_interface(":9000", 7000).unwrap();
        assert_eq!(addrs.v4.unwrap().port(), 7000);
    }

    #[test]
    fn literal_v4_resolves_single_family() {
        let addrs = resolve_interface("192.168.1.10:8080", 0).unwrap();
        assert_eq!(addrs.v4.unwrap().to_string(), "192.168.1.10:8080");
        assert!(addrs.v6.is_none());
    }

    #[test]
    fn bracketed_v6_literal() {
        let addrs = resolve_interface("[::1]:9000", 0).unwrap();
        let v6 = addrs.v6.unwrap();
        assert_eq!(v6.port(), 9000);
        assert!(addrs.v4.is_none());
    }

    #[test]
    fn bare_v6_literal_without_port() {
        let addrs = resolve_interface("::1", 4242).unwrap();
        assert_eq!(addrs.v6.unwrap().port(), 4242);
    }

    #[test]
    fn localhost_resolves_loopback_both_families() {
        let addrs = resolve_interface("localhost", 1234).unwrap();
        assert_eq!(addrs.v4.unwrap().ip().to_string(), "127.0.0.1");
        assert_eq!(addrs.v6.unwrap().ip().to_string(), "::1");
    }

    #[test]
    fn garbage_port_rejected() {
        assert!(resolve_interface("eth0:notaport", 0).is_err());
    }

    #[test]
    fn numeric_host_resolves_without_dns() {
        let resolved = resolve_host("127.0.0.1", 80).unwrap();
        assert_eq!(resolved.v4.len(), 1);
        assert!(resolved.v6.is_empty());
    }
}
