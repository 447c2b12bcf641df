use axum::http::HeaderMap;
use std::net::IpAddr;

/// Lowercases a host and strips any port suffix. Bracketed IPv6 literals
/// keep their address, bare IPv6 literals are returned unchanged.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();

    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.is_empty()
                && !name.contains(':')
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name.to_string()
        }
        _ => host,
    }
}

/// Best-effort client IP. Forwarded headers are only honored when the
/// transport peer is a trusted proxy; anyone else is taken at face value.
pub fn client_ip(peer: IpAddr, headers: &HeaderMap) -> String {
    if !is_trusted_proxy(peer) {
        return peer.to_string();
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.to_string()
}

/// Trusted ranges: RFC1918, loopback, link-local and IPv6 unique-local.
fn is_trusted_proxy(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
