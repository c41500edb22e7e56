//! Rate limit key construction.

/// Caller identity used when no client address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key identifying a caller/action pair, e.g. `verify:203.0.113.4`.
///
/// Keys compare by string equality; nothing beyond that is enforced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Build a key from an action name and a caller identifier.
    pub fn new(action: &str, caller: &str) -> Self {
        Self(format!("{}:{}", action, caller))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RateLimitKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for RateLimitKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identify the client from proxy headers.
///
/// Takes the first address in `X-Forwarded-For`, then `X-Real-IP`, and
/// otherwise returns [`UNKNOWN_CLIENT`].
pub fn client_identifier(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    let first_forwarded = forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let real_ip = real_ip.map(str::trim).filter(|ip| !ip.is_empty());

    first_forwarded
        .or(real_ip)
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}
