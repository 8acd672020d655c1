//! URL comparison and safety checks used while following links.

use std::net::IpAddr;

use url::Url;

/// Whether `link` points back at `base` once both are normalized.
///
/// Normalization defaults a missing scheme to `http`, lowercases scheme and
/// host, drops the scheme's default port, strips one trailing slash from the
/// path, and ignores query and fragment. Paths compare case-sensitively.
/// When either side fails to parse, the raw strings are compared after
/// stripping one trailing slash each.
pub fn is_self_link(link: &str, base: &str) -> bool {
    match (self_link_key(link), self_link_key(base)) {
        (Some(a), Some(b)) => a == b,
        _ => strip_one_slash(link.trim()) == strip_one_slash(base.trim()),
    }
}

/// `(scheme, host, port, path)` with defaults applied.
fn self_link_key(raw: &str) -> Option<(String, String, Option<u16>, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = if raw.contains("://") {
        Url::parse(raw).ok()?
    } else {
        Url::parse(&format!("http://{raw}")).ok()?
    };
    let host = url.host_str()?.to_lowercase();
    // `Url::port` is already `None` for the scheme's default port.
    Some((
        url.scheme().to_lowercase(),
        host,
        url.port(),
        strip_one_slash(url.path()).to_string(),
    ))
}

fn strip_one_slash(s: &str) -> &str {
    s.strip_suffix('/').unwrap_or(s)
}

/// Normalize a URL for visited-set deduplication.
///
/// Drops the fragment and a trailing slash on non-root paths. Unparseable
/// input is returned trimmed.
pub fn normalize_for_dedup(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    url.set_fragment(None);
    if url.path().len() > 1 && url.path().ends_with('/') {
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);
    }
    url.to_string()
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Whether a URL targets a non-HTTP scheme, a private network, or a local host.
pub fn is_private_target(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return true;
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            let host = host.to_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 carrier-grade NAT
                || (a == 100 && (b & 0xC0) == 64)
                || (a == 192 && b == 0 && c == 0)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
