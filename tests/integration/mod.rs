//! Integration tests for lighter-permission-cache
//!
//! These tests wire the cache, the resilience registry and the invalidation
//! worker together the way a service does, on the in-memory store unless
//! marked `#[ignore]`.

pub mod breaker_scenario_test;
pub mod guard_test;
pub mod invalidation_flow_test;
pub mod permission_cache_test;
pub mod redis_store_test;
