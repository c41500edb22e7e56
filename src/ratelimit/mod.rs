//! Rate limiting logic and counter stores.

mod breaker;
mod clock;
mod counter;
mod decision;
mod key;
mod limiter;
mod local;
mod remote;
mod rules;

pub use breaker::{BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{retry_after_secs, CounterEntry};
pub use decision::{Backend, RateLimitComputation};
pub use key::{client_identifier, RateLimitKey, UNKNOWN_CLIENT};
pub use limiter::RateLimiter;
pub use local::LocalCounterStore;
pub use remote::{RedisCounterStore, RemoteCounterStore};
pub use rules::{PolicySet, RateLimitRule, TimeUnit};
