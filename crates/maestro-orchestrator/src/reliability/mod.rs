/// Retry delay computation.
pub mod backoff;
/// Per-agent-type circuit breakers.
pub mod circuit_breaker;

pub use backoff::{BackoffStrategy, RetryPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
