//! Access-tier detection: localhost, LAN, or internet, decided from the
//! socket address plus the Host and Origin headers. A tunnel forwarding to
//! loopback presents a non-local Host, so it never classifies as localhost.

use std::net::IpAddr;

use serde::Serialize;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    Localhost,
    Lan,
    Internet,
}

impl AccessTier {
    pub fn is_local(self) -> bool {
        matches!(self, AccessTier::Localhost)
    }
}

/// Evaluated in order: localhost, then LAN, then internet.
pub fn detect_tier(peer: IpAddr, host: Option<&str>, origin: Option<&str>) -> AccessTier {
    let loopback_peer = match peer {
        IpAddr::V4(v4) => v4.is_loopback(),
        // Covers ::1 and ::ffff:127.0.0.1.
        IpAddr::V6(v6) => v6.to_canonical().is_loopback(),
    };
    let host_local = host.map(host_is_localhost).unwrap_or(false);
    let origin_ok = origin.map(origin_host_is_local).unwrap_or(true);
    if loopback_peer && host_local && origin_ok {
        return AccessTier::Localhost;
    }
    if host.map(host_is_lan).unwrap_or(false) {
        return AccessTier::Lan;
    }
    AccessTier::Internet
}

/// Strip `:port` from a Host header value, keeping IPv6 brackets intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    host.rsplit_once(':')
        .filter(|(name, port)| !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        .map(|(name, _)| name)
        .unwrap_or(host)
}

fn host_is_localhost(host: &str) -> bool {
    matches!(strip_port(host), "localhost" | "127.0.0.1" | "::1")
}

/// Origin check for the localhost tier: the origin host must start with a
/// loopback name, so `https://attacker.example` can never ride a loopback
/// socket into local privileges.
fn origin_host_is_local(origin: &str) -> bool {
    let host = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let host = host.split('/').next().unwrap_or(host);
    let host = host.trim_start_matches('[');
    host.starts_with("localhost") || host.starts_with("127.0.0.1") || host.starts_with("::1")
}

fn host_is_lan(host: &str) -> bool {
    let name = strip_port(host);
    if name.ends_with(".local") {
        return true;
    }
    match name.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => match v6.to_canonical() {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            // fe80::/10
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        },
        Err(_) => false,
    }
}

/// Constant-time string equality for secrets: CSRF tokens, pairing PINs, the
/// SSH password.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn loopback_with_local_host_is_localhost() {
        assert_eq!(
            detect_tier(ip("127.0.0.1"), Some("localhost:3001"), None),
            AccessTier::Localhost
        );
        assert_eq!(
            detect_tier(ip("::1"), Some("[::1]:3001"), None),
            AccessTier::Localhost
        );
        assert_eq!(
            detect_tier(ip("::ffff:127.0.0.1"), Some("127.0.0.1:3001"), None),
            AccessTier::Localhost
        );
    }

    #[test]
    fn local_origin_keeps_localhost_tier() {
        assert_eq!(
            detect_tier(ip("127.0.0.1"), Some("localhost:3001"), Some("http://localhost:3001")),
            AccessTier::Localhost
        );
    }

    #[test]
    fn tunnel_to_loopback_is_not_localhost() {
        // ngrok-style: socket is loopback but Host names the tunnel.
        assert_eq!(
            detect_tier(ip("127.0.0.1"), Some("example.tunnel.app"), None),
            AccessTier::Internet
        );
        // Remote origin on a loopback socket falls out of the local tier too.
        assert_eq!(
            detect_tier(
                ip("127.0.0.1"),
                Some("localhost:3001"),
                Some("https://attacker.example.com")
            ),
            AccessTier::Internet
        );
    }

    #[test]
    fn lan_hosts_by_mdns_private_and_link_local() {
        assert_eq!(
            detect_tier(ip("192.168.1.20"), Some("workbench.local:3001"), None),
            AccessTier::Lan
        );
        assert_eq!(detect_tier(ip("192.168.1.20"), Some("192.168.1.5:3001"), None), AccessTier::Lan);
        assert_eq!(detect_tier(ip("10.0.0.7"), Some("10.0.0.1"), None), AccessTier::Lan);
        assert_eq!(
            detect_tier(ip("169.254.10.1"), Some("169.254.0.9:3001"), None),
            AccessTier::Lan
        );
    }

    #[test]
    fn everything_else_is_internet() {
        assert_eq!(
            detect_tier(ip("203.0.113.9"), Some("katulong.example.com"), None),
            AccessTier::Internet
        );
        assert_eq!(detect_tier(ip("203.0.113.9"), None, None), AccessTier::Internet);
    }

    #[test]
    fn port_stripping_handles_v6_brackets() {
        assert_eq!(strip_port("localhost:3001"), "localhost");
        assert_eq!(strip_port("[::1]:3001"), "::1");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
    }

    #[test]
    fn constant_time_eq_matches_semantics() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc", "abc123"));
    }
}
