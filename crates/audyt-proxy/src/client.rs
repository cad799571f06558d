//! Who is calling: client IP resolution and per-request caller metadata.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap, Request},
};
use ipnet::IpNet;
use tower_governor::{key_extractor::KeyExtractor, GovernorError};

/// Fallback when no header or socket address identifies the caller.
pub const UNKNOWN_IP: &str = "0.0.0.0";

/// Resolve the caller's IP: first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the socket peer, then [`UNKNOWN_IP`].
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_owned();
    }

    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real {
        return ip.to_owned();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_owned())
}

/// Parse a comma-separated admin allow-list of addresses and CIDR networks.
/// Entries that parse as neither are skipped.
pub fn parse_admin_networks(list: &str) -> Vec<IpNet> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            s.parse::<IpNet>()
                .ok()
                .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
        })
        .collect()
}

/// True if `ip` parses as an address inside any of `networks`.
pub fn is_listed(ip: &str, networks: &[IpNet]) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(addr) => networks.iter().any(|net| net.contains(&addr)),
        Err(_) => false,
    }
}

/// Caller metadata attached to every security event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: String,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
}

impl ClientContext {
    pub fn from_parts(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            ip: resolve_client_ip(headers, peer),
            user_agent: text(header::USER_AGENT),
            origin: text(header::ORIGIN),
        }
    }
}

impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_parts(&parts.headers, peer))
    }
}

/// Rate-limit key extractor that buckets callers by the same IP the
/// admission pipeline sees, so both layers agree on who a client is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKeyExtractor;

impl KeyExtractor for ClientIpKeyExtractor {
    type Key = String;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(resolve_client_ip(req.headers(), peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn forwarded_for_wins_and_takes_first_hop() {
        let h = headers(&[
            ("x-forwarded-for", "1.2.3.4, 10.0.0.1"),
            ("x-real-ip", "5.6.7.8"),
        ]);
        let peer: SocketAddr = "9.9.9.9:4000".parse().unwrap();
        assert_eq!(resolve_client_ip(&h, Some(peer)), "1.2.3.4");
    }

    #[test]
    fn real_ip_used_when_forwarded_for_missing() {
        let h = headers(&[("x-real-ip", "5.6.7.8")]);
        assert_eq!(resolve_client_ip(&h, None), "5.6.7.8");
    }

    #[test]
    fn empty_forwarded_for_falls_through() {
        let h = headers(&[("x-forwarded-for", " "), ("x-real-ip", "5.6.7.8")]);
        assert_eq!(resolve_client_ip(&h, None), "5.6.7.8");
    }

    #[test]
    fn socket_peer_then_unknown() {
        let peer: SocketAddr = "9.9.9.9:4000".parse().unwrap();
        assert_eq!(resolve_client_ip(&HeaderMap::new(), Some(peer)), "9.9.9.9");
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None), UNKNOWN_IP);
    }

    #[test]
    fn admin_list_accepts_addresses_and_networks() {
        let nets = parse_admin_networks("139.28.40.138, 10.1.0.0/16, bogus,,");
        assert_eq!(nets.len(), 2);
        assert!(is_listed("139.28.40.138", &nets));
        assert!(is_listed("10.1.200.3", &nets));
        assert!(!is_listed("10.2.0.1", &nets));
        assert!(!is_listed("not-an-ip", &nets));
    }

    #[test]
    fn context_captures_agent_and_origin() {
        let h = headers(&[
            ("user-agent", "curl/8.0"),
            ("origin", "http://localhost:5173"),
        ]);
        let ctx = ClientContext::from_parts(&h, None);
        assert_eq!(ctx.ip, UNKNOWN_IP);
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(ctx.origin.as_deref(), Some("http://localhost:5173"));
    }
}
