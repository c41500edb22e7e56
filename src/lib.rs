//! Ratewell - Rate Limiting with Graceful Degradation
//!
//! This crate decides whether a request identified by a key may proceed under a
//! fixed-window limit. Counts are kept in a shared Redis store so limits hold
//! across process instances; when Redis is slow or unreachable the decision is
//! made from an in-process store instead, and no error ever reaches the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
