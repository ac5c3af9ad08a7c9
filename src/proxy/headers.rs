//! Header helpers shared by the dispatcher and the decoy relay

use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::Request;

/// Headers that only describe a single transport leg
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Drop a trailing `:port`, leaving bracketed IPv6 literals intact
pub fn strip_port(address: &str) -> &str {
    let port_idx = address.rfind(':');
    let ipv6_idx = address.rfind(']');
    match (port_idx, ipv6_idx) {
        (Some(port), Some(bracket)) if port > bracket => &address[..port],
        (Some(port), None) => &address[..port],
        _ => address,
    }
}

/// Host the client asked for: URI authority first, then the `Host` header
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.as_str().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
