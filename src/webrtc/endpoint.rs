//! WHEP endpoint URL handling.

use super::SessionError;
use url::Url;

/// Path segment every WHEP endpoint ends with
pub const WHEP_PATH_SUFFIX: &str = "/whep";

/// Append `/whep` to a stream base URL unless already present.
///
/// Trailing slashes are trimmed before appending, so
/// `https://h/a/` becomes `https://h/a/whep`.
pub fn normalize_endpoint(raw: &str) -> String {
    if raw.ends_with(WHEP_PATH_SUFFIX) {
        return raw.to_string();
    }
    format!("{}{}", raw.trim_end_matches('/'), WHEP_PATH_SUFFIX)
}

/// Parse a normalized endpoint; only http(s) with a host is accepted.
pub fn validate_endpoint(normalized: &str) -> Result<Url, SessionError> {
    let url = Url::parse(normalized).map_err(|_| SessionError::InvalidUrl(normalized.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(SessionError::InvalidUrl(normalized.to_string())),
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(SessionError::InvalidUrl(normalized.to_string())),
    }
}
