// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilience helpers composed on top of the adapter API:
//! - **retry_with_backoff**: re-publishes a failed delivery with a growing delay
//! - **CircuitBreaker**: fails fast while a downstream dependency is unhealthy
//!
//! Neither is wired into the adapter; handlers opt in.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{retry_with_backoff, BackoffConfig, RetryOutcome, RetryTarget};
