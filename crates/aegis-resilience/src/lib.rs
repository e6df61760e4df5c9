//! Exchange failover and circuit-breaker orchestrator: health-check a pool
//! of exchange adapters, elect/failover/failback a primary, and wrap
//! operation dispatch in a circuit breaker with cross-exchange retry.

pub mod circuit;
pub mod error;
pub mod executor;
pub mod failover;
pub mod health;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig};
pub use error::{ResilienceError, Result};
pub use executor::{ExchangeOperation, ResilientExecutor, ResilientExecutorConfig};
pub use failover::{FailoverController, FailoverControllerConfig};
pub use health::{spawn_health_prober, ExchangeProbe, HealthProber, HealthProberConfig};
