//! Data-channel address negotiation (RFC 959 PASV/PORT, RFC 2428 EPSV/EPRT).

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use xfer_core::options::PasvFallbackMode;

lazy_static! {
    static ref PASV_RE: Regex = Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").expect("static regex");
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`; parentheses optional.
pub fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let caps = PASV_RE.captures(text)?;
    let mut nums = [0u8; 6];
    for (i, n) in nums.iter_mut().enumerate() {
        *n = caps[i + 1].parse().ok()?;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// `229 Entering Extended Passive Mode (|||port|)`, any delimiter character.
pub fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = start + text[start..].find(')')?;
    let inner = &text[start + 1..end];
    let delim = inner.chars().next()?;
    if delim.is_ascii_digit() {
        return None;
    }
    let parts: Vec<&str> = inner.split(delim).collect();
    if parts.len() != 5 || !parts[4].is_empty() {
        return None;
    }
    parts[3].parse().ok().filter(|&p| p != 0)
}

/// False for loopback, private, link-local and unspecified addresses.
pub fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || o[0] == 0
                || (o[0] == 100 && (o[1] & 0xC0) == 64))
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            !(v6.is_unspecified()
                || v6.is_loopback()
                || (seg[0] & 0xFFC0) == 0xFE80
                || (seg[0] & 0xFE00) == 0xFC00)
        }
    }
}

/// Address to connect to for a PASV reply, given the control connection's
/// peer and the configured fallback mode.
///
/// Mode `0` keeps the announced address (the caller retries with the peer
/// address only after the other attempts failed), `1` substitutes the peer
/// for an unroutable announcement, `2` always uses the peer.
pub fn pasv_target(announced: SocketAddr, peer: IpAddr, mode: PasvFallbackMode) -> SocketAddr {
    let port = announced.port();
    if announced.ip().is_unspecified() {
        return SocketAddr::new(peer, port);
    }
    match mode {
        2 => SocketAddr::new(peer, port),
        1 if !is_routable(announced.ip()) && is_routable(peer) => SocketAddr::new(peer, port),
        _ => announced,
    }
}

/// `PORT` for IPv4, `EPRT` otherwise.
pub fn format_port_command(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!(
                "PORT {},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                addr.port() / 256,
                addr.port() % 256
            )
        }
        IpAddr::V6(v6) => format!("EPRT |2|{}|{}|", v6, addr.port()),
    }
}

/// Ports to try for an active-mode listener: the whole range once,
/// starting at a random point.
pub fn port_candidates(low: u16, high: u16) -> Vec<u16> {
    let (low, high) = if low <= high { (low, high) } else { (high, low) };
    let low = low.max(1);
    if high < low {
        return Vec::new();
    }
    let span = u32::from(high - low) + 1;
    let start = rand::thread_rng().gen_range(0..span);
    (0..span)
        .map(|i| low + ((start + i) % span) as u16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_with_and_without_parens() {
        let a = parse_pasv("227 Entering Passive Mode (192,168,1,10,19,137)").unwrap();
        assert_eq!(a, "192.168.1.10:5001".parse().unwrap());
        assert!(parse_pasv("227 Entering Passive Mode 10,0,0,1,0,21").is_some());
        assert!(parse_pasv("227 (300,1,1,1,1,1)").is_none());
    }

    #[test]
    fn epsv_reply() {
        assert_eq!(parse_epsv("229 Entering Extended Passive Mode (|||6446|)"), Some(6446));
        assert_eq!(parse_epsv("229 ok (!!!21!)"), Some(21));
        assert_eq!(parse_epsv("229 garbage"), None);
        assert_eq!(parse_epsv("229 (|||0|)"), None);
    }

    #[test]
    fn private_announcement_replaced_by_public_peer() {
        let announced: SocketAddr = "192.168.0.5:40000".parse().unwrap();
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(pasv_target(announced, peer, 1), "203.0.113.7:40000".parse().unwrap());
        assert_eq!(pasv_target(announced, peer, 0), announced);
        // Private peer: nothing better to substitute.
        let lan: IpAddr = "192.168.0.1".parse().unwrap();
        assert_eq!(pasv_target(announced, lan, 1), announced);
        let public: SocketAddr = "198.51.100.1:40000".parse().unwrap();
        assert_eq!(pasv_target(public, peer, 2), "203.0.113.7:40000".parse().unwrap());
        assert_eq!(pasv_target(public, peer, 1), public);
    }

    #[test]
    fn unspecified_announcement_uses_peer() {
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(pasv_target("0.0.0.0:21".parse().unwrap(), peer, 0).ip(), peer);
    }

    #[test]
    fn port_commands() {
        assert_eq!(format_port_command("10.0.0.2:5001".parse().unwrap()), "PORT 10,0,0,2,19,137");
        assert_eq!(format_port_command("[::1]:21".parse().unwrap()), "EPRT |2|::1|21|");
    }

    #[test]
    fn candidates_cover_range_once() {
        let mut ports = port_candidates(6000, 6009);
        assert_eq!(ports.len(), 10);
        ports.sort_unstable();
        assert_eq!(ports, (6000..=6009).collect::<Vec<_>>());
    }

    #[test]
    fn routability() {
        assert!(!is_routable("10.1.2.3".parse().unwrap()));
        assert!(!is_routable("172.20.0.1".parse().unwrap()));
        assert!(!is_routable("127.0.0.1".parse().unwrap()));
        assert!(!is_routable("fe80::1".parse().unwrap()));
        assert!(is_routable("8.8.8.8".parse().unwrap()));
        assert!(is_routable("2001:db8::1".parse().unwrap()));
    }
}
