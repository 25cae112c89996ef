//! Resilience components for crm-sync
//!
//! Four leaf components protect the sync pipeline from its three failure
//! domains, plus the shared counter-store abstraction they persist through:
//!
//! - [`RateLimiter`] - daily token budgets per endpoint class, atomic
//!   consumption, provider-header overrides, jittered backoff
//! - [`classify`] / [`ClassifiedError`] - pure mapping from wire failures
//!   to a tagged error with retry policy attached
//! - [`CircuitBreaker`] - three-state machine per operation kind, backed by
//!   the shared store so every worker observes the same circuit
//! - [`MemoryGovernor`] - process memory sampling and adaptive batch
//!   planning between sync pages
//! - [`HealthProbe`] - periodic upstream latency/availability sampling with
//!   a cached verdict
//!
//! Rate budgets and circuit state are the only cross-worker state; both go
//! through [`CounterStore`]. The governor and the probe reflect the local
//! process and stay in-process.

mod circuit_breaker;
mod classify;
mod health;
mod memory;
mod rate_limiter;
pub mod store;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
pub use classify::{classify, ClassifiedError, ErrorKind};
pub use health::{
    HealthProbe, HealthProbeConfig, HealthRecord, HealthSnapshot, HealthStatus, ProbeTransport,
};
pub use memory::{
    BatchPlan, FixedSampler, MemoryGovernor, MemoryGovernorConfig, MemoryLevel, MemorySample,
    MemorySampler, MemoryStats, SystemSampler,
};
pub use rate_limiter::{
    EndpointClass, RateLimitError, RateLimiter, RateLimiterConfig, RateSnapshot,
};
pub use store::{CounterStore, MemoryCounterStore};
