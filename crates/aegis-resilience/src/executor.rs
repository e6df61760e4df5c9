//! C11: Resilient Executor.
//!
//! Runs an operation against the current primary exchange, and on failure
//! walks the remaining available exchanges in priority order, calling back
//! into the `FailoverController` on each failure, before giving up. A single
//! circuit breaker guards the whole operation (keyed by `op_name`, not by
//! exchange -- the breaker here protects the caller from repeatedly paying
//! the cost of a failover walk that is unlikely to succeed, it is not a
//! per-adapter health signal). `execute_with_retry` wraps the whole pass in
//! an outer retry loop; unlike the call it wraps, a failed pass does not
//! propagate as an error the caller must unwind -- it returns the
//! caller-supplied default after exhausting retries.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::failover::FailoverController;
use aegis_common::model::{FailoverReason, HealthStatus};

#[async_trait]
pub trait ExchangeOperation<T>: Send + Sync {
    async fn call(&self, exchange_id: &str) -> std::result::Result<T, String>;
}

pub struct ResilientExecutorConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub circuit: CircuitBreakerConfig,
}

impl Default for ResilientExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// Snapshottable call counters, per spec §4.11 / testable invariant 4:
/// `total_calls == successful_calls + failed_calls + circuit_open_calls`
/// once the executor is quiescent.
#[derive(Default)]
struct Stats {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    circuit_open_calls: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub circuit_open_calls: u64,
    pub total_latency_ms: u64,
}

pub struct ResilientExecutor {
    controller: Arc<FailoverController>,
    /// One circuit breaker per `op_name`, so unrelated operations against
    /// the same exchange pool do not trip each other's breaker.
    circuits: DashMap<String, Arc<CircuitBreaker>>,
    stats: DashMap<String, Arc<Stats>>,
    config: ResilientExecutorConfig,
}

impl ResilientExecutor {
    pub fn new(controller: Arc<FailoverController>, config: ResilientExecutorConfig) -> Self {
        Self {
            controller,
            circuits: DashMap::new(),
            stats: DashMap::new(),
            config,
        }
    }

    fn circuit_for(&self, op_name: &str) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(op_name.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(self.config.circuit.clone())
                    .with_events(self.controller.events(), op_name);
                Arc::new(breaker)
            })
            .clone()
    }

    fn stats_for(&self, op_name: &str) -> Arc<Stats> {
        self.stats
            .entry(op_name.to_string())
            .or_insert_with(|| Arc::new(Stats::default()))
            .clone()
    }

    /// Snapshot of the counters for a given operation name. Never panics on
    /// an unseen name -- returns all zeros.
    pub fn stats(&self, op_name: &str) -> ExecutorStats {
        match self.stats.get(op_name) {
            Some(s) => ExecutorStats {
                total_calls: s.total_calls.load(Ordering::Relaxed),
                successful_calls: s.successful_calls.load(Ordering::Relaxed),
                failed_calls: s.failed_calls.load(Ordering::Relaxed),
                circuit_open_calls: s.circuit_open_calls.load(Ordering::Relaxed),
                total_latency_ms: s.total_latency_ms.load(Ordering::Relaxed),
            },
            None => ExecutorStats::default(),
        }
    }

    /// Exposes the breaker's current state for a given operation name, for
    /// callers that want to report it alongside the stats snapshot.
    pub fn circuit_state(&self, op_name: &str) -> aegis_common::model::CircuitState {
        self.circuit_for(op_name).state()
    }

    /// Tries the primary, then every other available exchange in priority
    /// order, until one succeeds or every candidate is exhausted. Returns
    /// `default_return` rather than an error on total failure or when the
    /// operation's circuit is open -- callers that need to distinguish the
    /// two should inspect `stats(op_name)` afterwards.
    pub async fn execute_with_failover<T: Send + Clone + 'static>(
        &self,
        op_name: &str,
        op: &(dyn ExchangeOperation<T> + Send + Sync),
        default_return: T,
    ) -> T {
        let stats = self.stats_for(op_name);
        stats.total_calls.fetch_add(1, Ordering::Relaxed);

        let circuit = self.circuit_for(op_name);
        if !circuit.can_execute() {
            stats.circuit_open_calls.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("aegis_executor_circuit_open_calls_total", "op" => op_name.to_string()).increment(1);
            return default_return;
        }

        let mut candidates: Vec<String> = Vec::new();
        if let Some(primary) = self.controller.primary() {
            candidates.push(primary);
        }
        for health in self.controller.available_exchanges() {
            if !candidates.contains(&health.exchange_id) {
                candidates.push(health.exchange_id);
            }
        }

        for exchange_id in candidates {
            let start = Instant::now();
            match op.call(&exchange_id).await {
                Ok(value) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    stats.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
                    stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                    circuit.record_success();
                    self.controller
                        .update_exchange_health(&exchange_id, HealthStatus::Healthy, latency_ms, 0.0, None);
                    metrics::histogram!("aegis_executor_call_latency_ms", "op" => op_name.to_string())
                        .record(latency_ms as f64);
                    metrics::counter!("aegis_executor_calls_total", "op" => op_name.to_string(), "outcome" => "success")
                        .increment(1);
                    return value;
                }
                Err(message) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    self.controller.update_exchange_health(
                        &exchange_id,
                        HealthStatus::Unhealthy,
                        latency_ms,
                        1.0,
                        Some(message.clone()),
                    );
                    self.controller.trigger_failover(&exchange_id, FailoverReason::ApiError);
                    warn!(exchange_id, op_name, error = %message, "operation failed, trying next exchange");
                    continue;
                }
            }
        }

        stats.failed_calls.fetch_add(1, Ordering::Relaxed);
        circuit.record_failure();
        metrics::counter!("aegis_executor_calls_total", "op" => op_name.to_string(), "outcome" => "failed").increment(1);
        default_return
    }

    /// Wraps `execute_with_failover` in an outer retry loop. Each attempt
    /// re-runs the full failover walk; the loop does not distinguish
    /// "operation returned the default because every exchange failed" from
    /// "circuit open" -- both are indistinguishable from the caller's
    /// perspective, matching the distilled spec's §7 note that a
    /// circuit-open short-circuit looks identical to adapter unavailability.
    pub async fn execute_with_retry<T: Send + Clone + 'static>(
        &self,
        op_name: &str,
        op: &(dyn ExchangeOperation<T> + Send + Sync),
        max_retries: u32,
        delay: Duration,
        default_return: T,
    ) -> T {
        let mut attempts = 0u32;
        loop {
            let stats_before = self.stats(op_name);
            let result = self
                .execute_with_failover(op_name, op, default_return.clone())
                .await;
            let stats_after = self.stats(op_name);
            let succeeded = stats_after.successful_calls > stats_before.successful_calls;

            attempts += 1;
            if succeeded || attempts >= max_retries {
                return result;
            }
            tokio::time::sleep(delay).await;
        }
    }
}
