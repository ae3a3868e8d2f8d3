//! CORS proxy request filter.
//!
//! The notes host runs in a browser, so MCP and Composio requests go through
//! a small proxy. This module is the proxy's decision function: given the
//! origin, method, target URL and request headers it says whether to answer a
//! preflight, forward the request, or reject it. It holds no state and does
//! no I/O.

use std::net::Ipv4Addr;

use serde::Serialize;
use url::{Host, Url};

/// Origins allowed to use the proxy.
pub const ALLOWED_ORIGINS: &[&str] = &["https://roamresearch.com", "https://www.roamresearch.com"];

pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "OPTIONS"];

/// Named hosts the proxy forwards to. Private IPv4 addresses are also allowed.
pub const ALLOWED_TARGET_HOSTS: &[&str] =
    &["mcp.composio.dev", "backend.composio.dev", "localhost", "127.0.0.1"];

/// Request headers forwarded as-is.
const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "authorization",
    "cache-control",
    "content-type",
    "last-event-id",
    "x-api-key",
];

/// Header families forwarded by prefix.
const ALLOWED_HEADER_PREFIXES: &[&str] = &["mcp-", "x-composio-"];

pub const PREFLIGHT_MAX_AGE_SECS: u32 = 86_400;

const REQUEST_HEADERS_HEADER: &str = "access-control-request-headers";

// ─── Decision ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxyDecision {
    /// Answer an `OPTIONS` request directly.
    Preflight { response_headers: Vec<(String, String)> },
    /// Forward to `target` with the filtered headers.
    Forward {
        target: String,
        forward_headers: Vec<(String, String)>,
        response_headers: Vec<(String, String)>,
    },
    Reject { status: u16, reason: String },
}

impl ProxyDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, ProxyDecision::Reject { .. })
    }

    fn reject(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!(status, reason = %reason, "proxy request rejected");
        ProxyDecision::Reject { status, reason }
    }
}

/// Decide what the proxy does with one request.
///
/// `request_headers` are `(name, value)` pairs as received. On a preflight
/// the names listed in `Access-Control-Request-Headers` are validated
/// instead.
pub fn evaluate_request(
    origin: Option<&str>,
    method: &str,
    target_url: &str,
    request_headers: &[(&str, &str)],
) -> ProxyDecision {
    let Some(origin) = origin.filter(|o| ALLOWED_ORIGINS.contains(o)) else {
        return ProxyDecision::reject(403, format!("origin not allowed: {}", origin.unwrap_or("<none>")));
    };

    let method = method.to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return ProxyDecision::reject(405, format!("method not allowed: {method}"));
    }

    let target = match validate_target(target_url) {
        Ok(url) => url,
        Err(reason) => return ProxyDecision::reject(403, reason),
    };

    if method == "OPTIONS" {
        let requested: Vec<String> = request_headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(REQUEST_HEADERS_HEADER))
            .flat_map(|(_, value)| value.split(','))
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        let allowed: Vec<String> = requested.into_iter().filter(|h| is_allowed_header(h)).collect();
        return ProxyDecision::Preflight {
            response_headers: cors_headers(origin, &allowed),
        };
    }

    let forward_headers: Vec<(String, String)> = request_headers
        .iter()
        .filter(|(name, _)| is_allowed_header(&name.to_ascii_lowercase()))
        .map(|(name, value)| (name.to_ascii_lowercase(), (*value).to_string()))
        .collect();
    let allowed: Vec<String> = forward_headers.iter().map(|(n, _)| n.clone()).collect();

    tracing::debug!(target = %target, headers = forward_headers.len(), "proxy forwarding");
    ProxyDecision::Forward {
        target: target.to_string(),
        forward_headers,
        response_headers: cors_headers(origin, &allowed),
    }
}

// ─── Target Validation ──────────────────────────────────────────────────────

fn validate_target(target_url: &str) -> Result<Url, String> {
    let url = Url::parse(target_url).map_err(|e| format!("invalid target url: {e}"))?;

    let scheme = url.scheme();
    if scheme != "https" && scheme != "http" {
        return Err(format!("unsupported scheme: {scheme}"));
    }

    let local = match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            if !ALLOWED_TARGET_HOSTS.contains(&domain.as_str()) {
                return Err(format!("target host not allowed: {domain}"));
            }
            domain == "localhost"
        }
        Some(Host::Ipv4(ip)) => {
            if !is_local_ipv4(ip) {
                return Err(format!("target host not allowed: {ip}"));
            }
            true
        }
        Some(Host::Ipv6(ip)) => return Err(format!("target host not allowed: [{ip}]")),
        None => return Err("target url has no host".to_string()),
    };

    if scheme == "http" && !local {
        return Err("plain http is only allowed for local targets".to_string());
    }
    Ok(url)
}

/// Loopback or RFC-1918 private.
fn is_local_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private()
}

fn is_allowed_header(name: &str) -> bool {
    ALLOWED_HEADERS.contains(&name) || ALLOWED_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn cors_headers(origin: &str, allowed_headers: &[String]) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Access-Control-Allow-Origin".to_string(), origin.to_string()),
        ("Vary".to_string(), "Origin".to_string()),
        ("Access-Control-Allow-Methods".to_string(), ALLOWED_METHODS.join(", ")),
        ("Access-Control-Max-Age".to_string(), PREFLIGHT_MAX_AGE_SECS.to_string()),
    ];
    if !allowed_headers.is_empty() {
        headers.push(("Access-Control-Allow-Headers".to_string(), allowed_headers.join(", ")));
    }
    headers
}

// ─── Tests ──────────────────────────────────────────────────────────────────
