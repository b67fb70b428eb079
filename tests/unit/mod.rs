//! Unit tests for the public building blocks

pub mod cache_test;
pub mod config_test;
pub mod keys_test;
pub mod lock_test;
pub mod queue_test;
pub mod rate_limiter_test;
