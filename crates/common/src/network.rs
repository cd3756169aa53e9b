// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tailproxy Contributors

// Listen address helpers

use std::net::{IpAddr, SocketAddr};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts count as remote
    false
}

/// Split a `host:port` listen address. Accepts `[v6]:port` and a bare `:port`.
pub fn split_listen_address(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        let port = socket.port();
        let host = match addr.rfind(':') {
            Some(idx) => addr[..idx].trim_start_matches('[').trim_end_matches(']'),
            None => return None,
        };
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

/// True when a listen address only accepts local connections
pub fn is_loopback_listen(addr: &str) -> bool {
    match split_listen_address(addr) {
        Some((host, _)) => is_loopback_address(host),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback_address() {
        assert!(is_loopback_address("127.0.0.1"));
        assert!(is_loopback_address("127.255.255.255"));
        assert!(is_loopback_address("::1"));
        assert!(is_loopback_address("localhost"));
        assert!(is_loopback_address("LocalHost"));

        assert!(!is_loopback_address("0.0.0.0"));
        assert!(!is_loopback_address("192.168.1.1"));
        assert!(!is_loopback_address("example.com"));
        assert!(!is_loopback_address("::"));
    }

    #[test]
    fn test_split_listen_address() {
        assert_eq!(split_listen_address("127.0.0.1:1056"), Some(("127.0.0.1", 1056)));
        assert_eq!(split_listen_address("[::1]:22"), Some(("::1", 22)));
        assert_eq!(split_listen_address("localhost:8022"), Some(("localhost", 8022)));
        assert_eq!(split_listen_address(":2222"), Some(("", 2222)));
        assert_eq!(split_listen_address("no-port"), None);
        assert_eq!(split_listen_address("host:notaport"), None);
    }

    #[test]
    fn test_is_loopback_listen() {
        assert!(is_loopback_listen("127.0.0.1:1056"));
        assert!(is_loopback_listen("[::1]:1056"));
        assert!(is_loopback_listen("localhost:1056"));

        assert!(!is_loopback_listen("0.0.0.0:1056"));
        assert!(!is_loopback_listen(":1056"));
        assert!(!is_loopback_listen("100.64.0.1:22"));
        assert!(!is_loopback_listen("garbage"));
    }
}
