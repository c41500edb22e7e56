//! Rate limit decisions.

use serde::Serialize;

/// Which counter store produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared store, consistent across process instances
    Remote,
    /// In-process fallback store
    Local,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Remote => f.write_str("remote"),
            Backend::Local => f.write_str("local"),
        }
    }
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitComputation {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Advisory delay before retrying; set when the request was blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Backend that served the decision
    pub backend: Backend,
    /// Requests left in the window, if known
    pub remaining: Option<u64>,
    /// The limit that was applied
    pub limit: u64,
}

impl RateLimitComputation {
    /// Response headers describing this decision.
    ///
    /// `Retry-After` is only present for blocked requests.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("X-RateLimit-Limit", self.limit.to_string())];
        if let Some(remaining) = self.remaining {
            headers.push(("X-RateLimit-Remaining", remaining.to_string()));
        }
        if let Some(retry_after) = self.retry_after_seconds {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}
