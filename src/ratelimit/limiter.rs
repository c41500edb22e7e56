//! Rate limit computation over a remote store with local fallback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::RatewellConfig;
use crate::error::{RatewellError, Result};

use super::breaker::CircuitBreaker;
use super::clock::{Clock, SystemClock};
use super::counter::{retry_after_secs, CounterEntry};
use super::decision::{Backend, RateLimitComputation};
use super::key::RateLimitKey;
use super::local::LocalCounterStore;
use super::remote::{RedisCounterStore, RemoteCounterStore};
use super::rules::PolicySet;

/// Default upper bound on one remote check.
const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_millis(250);

/// Decides whether requests may proceed.
///
/// Counts live in the remote store when one is configured and reachable, so
/// limits hold across process instances. Any remote failure or timeout is
/// absorbed and the request is counted in the local store instead, which
/// enforces limits per process until the remote recovers.
///
/// This struct is thread-safe and can be shared across tasks.
pub struct RateLimiter {
    remote: Option<Arc<dyn RemoteCounterStore>>,
    local: Arc<LocalCounterStore>,
    remote_timeout: Duration,
    breaker: Option<CircuitBreaker>,
    policies: PolicySet,
}

impl RateLimiter {
    /// A limiter that only ever uses the local store.
    pub fn local_only(local: Arc<LocalCounterStore>) -> Self {
        Self {
            remote: None,
            local,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            breaker: None,
            policies: PolicySet::default(),
        }
    }

    /// A limiter preferring `remote` and falling back to `local`.
    pub fn with_remote(remote: Arc<dyn RemoteCounterStore>, local: Arc<LocalCounterStore>) -> Self {
        Self {
            remote: Some(remote),
            ..Self::local_only(local)
        }
    }

    /// Bound each remote check by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Skip the remote store while `breaker` is open.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Use `policies` for [`RateLimiter::check_policy`].
    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    /// Build a limiter from configuration.
    ///
    /// If the remote store cannot be reached at startup the limiter runs
    /// local-only rather than failing.
    pub async fn from_config(config: &RatewellConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local = Arc::new(
            LocalCounterStore::new(clock.clone())
                .with_max_entries(config.local.max_entries)
                .with_sweep_interval(config.local.sweep_interval_ms),
        );

        let mut limiter = match &config.remote.url {
            Some(url) => match RedisCounterStore::connect(url, &config.remote).await {
                Ok(store) => Self::with_remote(Arc::new(store), local),
                Err(e) => {
                    warn!(error = %e, "Remote counter store unavailable, running local-only");
                    Self::local_only(local)
                }
            },
            None => {
                info!("No remote counter store configured, running local-only");
                Self::local_only(local)
            }
        };

        limiter = limiter
            .with_timeout(Duration::from_millis(config.remote.timeout_ms))
            .with_policies(config.policies.clone());

        if config.breaker.enabled {
            limiter = limiter.with_breaker(CircuitBreaker::new(
                config.breaker.failure_threshold,
                config.breaker.cooldown_ms,
                clock,
            ));
        }

        Ok(limiter)
    }

    /// Count a request for `key` and decide whether it is within `limit`
    /// requests per `window_ms` milliseconds.
    ///
    /// Never fails: remote errors degrade the decision to the local store.
    pub async fn check(&self, key: &str, limit: u64, window_ms: u64) -> RateLimitComputation {
        let window_ms = window_ms.max(1);

        if key.is_empty() {
            debug!("Rate limit check with empty key");
        }
        trace!(key, limit, window_ms, "Checking rate limit");

        if let Some(remote) = self.remote_if_permitted() {
            let attempt = tokio::time::timeout(
                self.remote_timeout,
                check_remote(&**remote, key, limit, window_ms),
            )
            .await
            .unwrap_or(Err(RatewellError::Timeout(self.remote_timeout)));

            match attempt {
                Ok(decision) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    log_blocked(key, &decision);
                    return decision;
                }
                Err(e) => {
                    warn!(key, error = %e, "Remote rate limit check failed, using local store");
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure();
                    }
                }
            }
        }

        let decision = self.check_local(key, limit, window_ms);
        log_blocked(key, &decision);
        decision
    }

    /// Check a typed key.
    pub async fn check_key(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window_ms: u64,
    ) -> RateLimitComputation {
        self.check(key.as_str(), limit, window_ms).await
    }

    /// Check `caller` against the named policy, keyed as `policy:caller`.
    pub async fn check_policy(&self, policy: &str, caller: &str) -> RateLimitComputation {
        let rule = self.policies.resolve(policy);
        let key = RateLimitKey::new(policy, caller);
        self.check_key(&key, rule.requests_per_unit, rule.window_ms())
            .await
    }

    fn remote_if_permitted(&self) -> Option<&Arc<dyn RemoteCounterStore>> {
        let remote = self.remote.as_ref()?;
        match &self.breaker {
            Some(breaker) if !breaker.allow_request() => {
                trace!("Circuit breaker open, skipping remote store");
                None
            }
            _ => Some(remote),
        }
    }

    fn check_local(&self, key: &str, limit: u64, window_ms: u64) -> RateLimitComputation {
        let allowed = self.local.check_and_increment(key, limit, window_ms);
        let state = self.local.get_state(key);
        let now = self.local.clock().now_ms();
        local_decision(allowed, state, limit, window_ms, now)
    }

    /// The local fallback store.
    pub fn local(&self) -> &Arc<LocalCounterStore> {
        &self.local
    }

    /// Whether a remote store is configured.
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// The configured policies.
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Clear the local counter for `key`.
    pub fn reset_local(&self, key: &str) {
        self.local.reset(key);
    }

    /// Clear every local counter.
    pub fn reset_all_local(&self) {
        self.local.reset_all();
    }
}

async fn check_remote(
    remote: &dyn RemoteCounterStore,
    key: &str,
    limit: u64,
    window_ms: u64,
) -> Result<RateLimitComputation> {
    let count = remote.increment(key).await?;
    if count == 1 {
        remote.set_expiry(key, window_ms).await?;
    }

    let mut ttl_ms = remote.time_to_live(key).await?;
    if ttl_ms < 0 {
        // The store lost (or never applied) the expiry; without this the key
        // would never reset.
        debug!(key, ttl_ms, "Remote counter has no expiry, restoring window");
        remote.set_expiry(key, window_ms).await?;
        ttl_ms = window_ms as i64;
    }

    let allowed = count <= limit;
    Ok(RateLimitComputation {
        allowed,
        retry_after_seconds: (!allowed).then(|| retry_after_secs(ttl_ms as u64)),
        backend: Backend::Remote,
        remaining: Some(limit.saturating_sub(count)),
        limit,
    })
}

/// Build a local-store decision from the counter state read after the
/// increment. `state` is `None` when the entry was reset in between.
fn local_decision(
    allowed: bool,
    state: Option<CounterEntry>,
    limit: u64,
    window_ms: u64,
    now_ms: u64,
) -> RateLimitComputation {
    let (remaining, retry_after_seconds) = match state {
        Some(state) => (
            state.remaining(limit),
            (!allowed).then(|| retry_after_secs(state.time_until_reset(now_ms))),
        ),
        None => {
            let remaining = if allowed { limit.saturating_sub(1) } else { 0 };
            (remaining, (!allowed).then(|| retry_after_secs(window_ms)))
        }
    };

    RateLimitComputation {
        allowed,
        retry_after_seconds,
        backend: Backend::Local,
        remaining: Some(remaining),
        limit,
    }
}

fn log_blocked(key: &str, decision: &RateLimitComputation) {
    if !decision.allowed {
        debug!(
            key,
            backend = %decision.backend,
            limit = decision.limit,
            retry_after_seconds = ?decision.retry_after_seconds,
            "Rate limit exceeded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::breaker::BreakerState;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::rules::{RateLimitRule, TimeUnit};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory stand-in for Redis with millisecond expiry.
    struct MemoryRemote {
        clock: Arc<ManualClock>,
        /// key -> (count, expires_at_ms)
        entries: DashMap<String, (u64, Option<u64>)>,
        drop_expiry: bool,
        expiry_calls: AtomicUsize,
    }

    impl MemoryRemote {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                clock,
                entries: DashMap::new(),
                drop_expiry: false,
                expiry_calls: AtomicUsize::new(0),
            }
        }

        fn dropping_expiry(clock: Arc<ManualClock>) -> Self {
            Self {
                drop_expiry: true,
                ..Self::new(clock)
            }
        }

        fn evict_expired(&self, key: &str) {
            let now = self.clock.now_ms();
            self.entries
                .remove_if(key, |_, (_, expires)| expires.is_some_and(|at| now >= at));
        }
    }

    #[async_trait]
    impl RemoteCounterStore for MemoryRemote {
        async fn increment(&self, key: &str) -> Result<u64> {
            self.evict_expired(key);
            let mut entry = self.entries.entry(key.to_string()).or_insert((0, None));
            entry.0 += 1;
            Ok(entry.0)
        }

        async fn set_expiry(&self, key: &str, window_ms: u64) -> Result<()> {
            self.expiry_calls.fetch_add(1, Ordering::SeqCst);
            if !self.drop_expiry {
                let expires_at = self.clock.now_ms() + window_ms;
                if let Some(mut entry) = self.entries.get_mut(key) {
                    entry.1 = Some(expires_at);
                }
            }
            Ok(())
        }

        async fn time_to_live(&self, key: &str) -> Result<i64> {
            self.evict_expired(key);
            let now = self.clock.now_ms();
            Ok(match self.entries.get(key).map(|entry| entry.1) {
                None => -2,
                Some(None) => -1,
                Some(Some(at)) => at.saturating_sub(now) as i64,
            })
        }
    }

    /// Remote store that fails every call.
    #[derive(Default)]
    struct FailingRemote {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteCounterStore for FailingRemote {
        async fn increment(&self, _key: &str) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RatewellError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))
        }

        async fn set_expiry(&self, _key: &str, _window_ms: u64) -> Result<()> {
            unreachable!("increment always fails")
        }

        async fn time_to_live(&self, _key: &str) -> Result<i64> {
            unreachable!("increment always fails")
        }
    }

    /// Remote store that never answers.
    struct HangingRemote;

    #[async_trait]
    impl RemoteCounterStore for HangingRemote {
        async fn increment(&self, _key: &str) -> Result<u64> {
            std::future::pending().await
        }

        async fn set_expiry(&self, _key: &str, _window_ms: u64) -> Result<()> {
            std::future::pending().await
        }

        async fn time_to_live(&self, _key: &str) -> Result<i64> {
            std::future::pending().await
        }
    }

    fn local_store(clock: &Arc<ManualClock>) -> Arc<LocalCounterStore> {
        Arc::new(LocalCounterStore::new(clock.clone()))
    }

    async fn assert_five_per_minute(limiter: &RateLimiter, backend: Backend) {
        for expected_remaining in (0..5).rev() {
            let decision = limiter.check("verify:203.0.113.4", 5, 60_000).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(expected_remaining));
            assert_eq!(decision.retry_after_seconds, None);
            assert_eq!(decision.backend, backend);
            assert_eq!(decision.limit, 5);
        }

        let blocked = limiter.check("verify:203.0.113.4", 5, 60_000).await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, Some(0));
        assert_eq!(blocked.backend, backend);
        let retry_after = blocked.retry_after_seconds.unwrap();
        assert!((1..=60).contains(&retry_after));
    }

    #[tokio::test]
    async fn test_remote_enforces_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));
        let limiter = RateLimiter::with_remote(remote.clone(), local_store(&clock));

        assert_five_per_minute(&limiter, Backend::Remote).await;
        assert!(limiter.local().is_empty());
        assert_eq!(remote.expiry_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_only_enforces_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::local_only(local_store(&clock));

        assert_five_per_minute(&limiter, Backend::Local).await;
    }

    #[tokio::test]
    async fn test_failing_remote_falls_back_to_local() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(FailingRemote::default());
        let limiter = RateLimiter::with_remote(remote.clone(), local_store(&clock));

        assert_five_per_minute(&limiter, Backend::Local).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_hanging_remote_times_out_to_local() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_remote(Arc::new(HangingRemote), local_store(&clock))
            .with_timeout(Duration::from_millis(20));

        let decision = limiter.check("comment:u1", 3, 1_000).await;
        assert!(decision.allowed);
        assert_eq!(decision.backend, Backend::Local);
        assert_eq!(decision.remaining, Some(2));
    }

    #[tokio::test]
    async fn test_window_elapse_starts_fresh() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));
        let remote_limiter = RateLimiter::with_remote(remote, local_store(&clock));
        let local_limiter = RateLimiter::local_only(local_store(&clock));

        for limiter in [&remote_limiter, &local_limiter] {
            for _ in 0..3 {
                limiter.check("login:a", 2, 10_000).await;
            }
            assert!(!limiter.check("login:a", 2, 10_000).await.allowed);
        }

        clock.advance(10_000);

        for limiter in [&remote_limiter, &local_limiter] {
            let decision = limiter.check("login:a", 2, 10_000).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(1));
        }
    }

    #[tokio::test]
    async fn test_retry_after_tracks_window() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));
        let remote_limiter = RateLimiter::with_remote(remote, local_store(&clock));
        let local_limiter = RateLimiter::local_only(local_store(&clock));

        for limiter in [&remote_limiter, &local_limiter] {
            limiter.check("k", 1, 60_000).await;
        }
        clock.advance(45_500);

        for limiter in [&remote_limiter, &local_limiter] {
            let blocked = limiter.check("k", 1, 60_000).await;
            assert_eq!(blocked.retry_after_seconds, Some(15));
        }
    }

    #[tokio::test]
    async fn test_missing_remote_ttl_is_restored() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(MemoryRemote::dropping_expiry(clock.clone()));
        let limiter = RateLimiter::with_remote(remote.clone(), local_store(&clock));

        let first = limiter.check("verify:x", 1, 30_000).await;
        assert!(first.allowed);
        assert_eq!(first.backend, Backend::Remote);
        // Once on the first hit, once more to heal the missing expiry.
        assert_eq!(remote.expiry_calls.load(Ordering::SeqCst), 2);

        let blocked = limiter.check("verify:x", 1, 30_000).await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.backend, Backend::Remote);
        assert_eq!(blocked.retry_after_seconds, Some(30));
        assert_eq!(remote.expiry_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remaining_bounds_and_retry_after_presence() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(MemoryRemote::new(clock.clone()));
        let limiter = RateLimiter::with_remote(remote, local_store(&clock));

        for _ in 0..20 {
            let decision = limiter.check("search:z", 7, 5_000).await;
            let remaining = decision.remaining.unwrap();
            assert!(remaining <= 7);
            assert_eq!(decision.retry_after_seconds.is_some(), !decision.allowed);
            clock.advance(400);
        }
    }

    #[test]
    fn test_local_decision_from_state() {
        let state = CounterEntry {
            count: 6,
            reset_at_ms: 60_000,
        };

        let blocked = local_decision(false, Some(state), 5, 60_000, 30_500);
        assert_eq!(blocked.remaining, Some(0));
        assert_eq!(blocked.retry_after_seconds, Some(30));
        assert_eq!(blocked.backend, Backend::Local);

        let state = CounterEntry { count: 2, ..state };
        let allowed = local_decision(true, Some(state), 5, 60_000, 30_500);
        assert_eq!(allowed.remaining, Some(3));
        assert_eq!(allowed.retry_after_seconds, None);
    }

    #[test]
    fn test_local_decision_without_state() {
        let allowed = local_decision(true, None, 5, 60_000, 0);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, Some(4));
        assert_eq!(allowed.retry_after_seconds, None);

        let blocked = local_decision(false, None, 5, 2_500, 0);
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, Some(0));
        assert_eq!(blocked.retry_after_seconds, Some(3));
        assert_eq!(blocked.limit, 5);
    }

    #[tokio::test]
    async fn test_zero_window_and_zero_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::local_only(local_store(&clock));

        let blocked = limiter.check("k", 0, 0).await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, Some(0));
        assert_eq!(blocked.retry_after_seconds, Some(1));
    }

    #[tokio::test]
    async fn test_breaker_skips_remote_after_failures() {
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(FailingRemote::default());
        let breaker = CircuitBreaker::new(2, 5_000, clock.clone());
        let limiter =
            RateLimiter::with_remote(remote.clone(), local_store(&clock)).with_breaker(breaker);

        for _ in 0..5 {
            let decision = limiter.check("k", 100, 60_000).await;
            assert_eq!(decision.backend, Backend::Local);
        }
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            limiter.breaker.as_ref().map(|b| b.state()),
            Some(BreakerState::Open)
        );

        clock.advance(5_000);
        limiter.check("k", 100, 60_000).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_check_policy_uses_named_rule() {
        let clock = Arc::new(ManualClock::new(0));
        let policies = PolicySet::new().with_rule("verify", RateLimitRule::new(2, TimeUnit::Minute));
        let limiter = RateLimiter::local_only(local_store(&clock)).with_policies(policies);

        assert!(limiter.check_policy("verify", "203.0.113.4").await.allowed);
        assert!(limiter.check_policy("verify", "203.0.113.4").await.allowed);

        let blocked = limiter.check_policy("verify", "203.0.113.4").await;
        assert!(!blocked.allowed);
        assert_eq!(blocked.limit, 2);
        assert_eq!(blocked.retry_after_seconds, Some(60));

        let state = limiter.local().get_state("verify:203.0.113.4").unwrap();
        assert_eq!(state.count, 3);

        let other = limiter.check_policy("unlisted", "203.0.113.4").await;
        assert_eq!(other.limit, 100);
    }

    #[tokio::test]
    async fn test_reset_local() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::local_only(local_store(&clock));

        limiter.check("a", 1, 1_000).await;
        limiter.check("b", 1, 1_000).await;
        assert!(!limiter.check("a", 1, 1_000).await.allowed);

        limiter.reset_local("a");
        assert!(limiter.check("a", 1, 1_000).await.allowed);

        limiter.reset_all_local();
        assert!(limiter.local().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_checks_share_one_count() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = Arc::new(RateLimiter::local_only(local_store(&clock)));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            tasks.spawn(async move { limiter.check("burst", 10, 60_000).await.allowed });
        }

        let mut allowed = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_from_config_without_remote() {
        let limiter = RateLimiter::from_config(&RatewellConfig::default())
            .await
            .unwrap();

        assert!(!limiter.has_remote());
        let decision = limiter.check("k", 1, 1_000).await;
        assert_eq!(decision.backend, Backend::Local);
    }

    #[tokio::test]
    async fn test_from_config_with_bad_url_runs_local_only() {
        let mut config = RatewellConfig::default();
        config.remote.url = Some("not a url".to_string());

        let limiter = RateLimiter::from_config(&config).await.unwrap();
        assert!(!limiter.has_remote());
    }
}
