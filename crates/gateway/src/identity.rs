//! Caller identity from upgrade request metadata.
//!
//! Token validation happens upstream; the gateway trusts the `uid` it is
//! handed.

use crate::protocol::RecipientId;
use axum::http::HeaderMap;
use std::collections::HashMap;

/// Header carrying the caller's id.
pub const UID_HEADER: &str = "uid";

/// Query parameter fallback for clients that cannot set headers (browsers).
pub const UID_PARAM: &str = "uid";

/// Identity of the caller: the `uid` header, else the `uid` query parameter.
pub fn extract_identity(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<RecipientId> {
    headers
        .get(UID_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get(UID_PARAM).map(String::as_str))
        .and_then(|raw| raw.trim().parse().ok())
}
