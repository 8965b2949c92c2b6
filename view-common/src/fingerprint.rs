//! # Fingerprint
//!
//! Derive a viewer identity used to deduplicate views. Fingerprints are not
//! authentication: they only need to be stable for one viewer across requests
//! within the dedup window.
use http::header::{HeaderMap, USER_AGENT};

/// Headers set by proxies and CDNs carrying the original client address,
/// in priority order.
pub const CLIENT_IP_HEADERS: [&str; 7] = [
    "cf-connecting-ip",
    "true-client-ip",
    "x-real-ip",
    "x-forwarded-for",
    "x-client-ip",
    "x-cluster-client-ip",
    "fastly-client-ip",
];

const UNKNOWN_IP: &str = "unknown";

/// The request metadata a fingerprint is derived from.
#[derive(Debug, Clone, Copy)]
pub struct ViewerRequest<'a> {
    /// Identifier of the authenticated subject, if any.
    pub subject_id: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

impl<'a> ViewerRequest<'a> {
    pub fn new(subject_id: Option<&'a str>, headers: &'a HeaderMap) -> Self {
        Self {
            subject_id,
            headers,
        }
    }
}

/// Compute the fingerprint for a request:
/// `user:<id>` for authenticated viewers, `anon:<ip>:<ua hash>` otherwise.
pub fn fingerprint(request: &ViewerRequest<'_>) -> String {
    if let Some(subject_id) = request.subject_id.filter(|id| !id.is_empty()) {
        return format!("user:{subject_id}");
    }

    let ip = client_ip(request.headers).unwrap_or(UNKNOWN_IP);
    let user_agent = request
        .headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    format!("anon:{}:{}", ip, hash_user_agent(user_agent))
}

/// First non-empty client address among `CLIENT_IP_HEADERS`. Proxy chains list
/// the original client first.
pub fn client_ip(headers: &HeaderMap) -> Option<&str> {
    CLIENT_IP_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        let first = value.split(',').next()?.trim();
        (!first.is_empty()).then_some(first)
    })
}

/// 32-bit multiplicative string hash over UTF-16 code units, rendered as the
/// base-36 absolute value. Keeps fingerprints short; collisions only merge two
/// viewers behind the same address.
pub fn hash_user_agent(user_agent: &str) -> String {
    let hash = user_agent
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_mul(31).wrapping_add(i32::from(unit))
        });

    to_base36(hash.unsigned_abs())
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_owned();
    }

    let mut digits = Vec::with_capacity(7);
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    String::from_utf8(digits).unwrap_or_default()
}
