use axum::http::HeaderMap;

/// Returned when no proxy header names the caller.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Proxy headers checked in priority order.
const ADDRESS_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
    "x-client-ip",
];

/// Best-effort caller network address from proxy headers.
///
/// `x-forwarded-for` may carry a chain; the first hop is the client.
pub fn client_address(headers: &HeaderMap) -> String {
    ADDRESS_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}
