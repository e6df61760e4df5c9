//! C8: Health Prober.
//!
//! A two-tier probe per exchange per tick: first a cheap connectivity
//! check, then (only if that passes) a timed API call whose latency feeds
//! the health status. Every probe result is handed to the
//! `FailoverController`, which owns the actual health record and decides
//! whether it changes the primary.

use aegis_common::model::HealthStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::failover::FailoverController;

#[async_trait]
pub trait ExchangeProbe: Send + Sync {
    async fn test_connection(&self, exchange_id: &str) -> bool;

    /// `Ok(latency)` on a successful API round trip, `Err(message)` on
    /// failure.
    async fn test_api_call(&self, exchange_id: &str) -> std::result::Result<Duration, String>;
}

pub struct HealthProberConfig {
    pub interval: Duration,
    pub max_acceptable_latency: Duration,
    /// Per-probe timeout (connectivity check or API call). A probe that
    /// does not finish in time is recorded `Unhealthy` with a synthetic
    /// error, same as one that returns an error outright.
    pub probe_timeout: Duration,
}

impl Default for HealthProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_acceptable_latency: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HealthProber {
    probe: Arc<dyn ExchangeProbe>,
    controller: Arc<FailoverController>,
    config: HealthProberConfig,
}

impl HealthProber {
    pub fn new(
        probe: Arc<dyn ExchangeProbe>,
        controller: Arc<FailoverController>,
        config: HealthProberConfig,
    ) -> Self {
        Self {
            probe,
            controller,
            config,
        }
    }

    pub async fn check_one(&self, exchange_id: &str) {
        let start = Instant::now();

        let connected = tokio::time::timeout(self.config.probe_timeout, self.probe.test_connection(exchange_id)).await;
        let connected = match connected {
            Ok(ok) => ok,
            Err(_) => {
                self.controller.update_exchange_health(
                    exchange_id,
                    HealthStatus::Unhealthy,
                    self.config.probe_timeout.as_millis() as u64,
                    1.0,
                    Some("connection probe timed out".to_string()),
                );
                return;
            }
        };

        if !connected {
            self.controller.update_exchange_health(
                exchange_id,
                HealthStatus::Unhealthy,
                start.elapsed().as_millis() as u64,
                1.0,
                Some("connection test failed".to_string()),
            );
            return;
        }

        let api_result = tokio::time::timeout(self.config.probe_timeout, self.probe.test_api_call(exchange_id)).await;
        match api_result {
            Ok(Ok(latency)) => {
                let status = if latency > self.config.max_acceptable_latency {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                self.controller.update_exchange_health(
                    exchange_id,
                    status,
                    latency.as_millis() as u64,
                    0.0,
                    None,
                );
            }
            Ok(Err(message)) => {
                self.controller.update_exchange_health(
                    exchange_id,
                    HealthStatus::Unhealthy,
                    start.elapsed().as_millis() as u64,
                    1.0,
                    Some(message),
                );
            }
            Err(_) => {
                self.controller.update_exchange_health(
                    exchange_id,
                    HealthStatus::Unhealthy,
                    self.config.probe_timeout.as_millis() as u64,
                    1.0,
                    Some("api probe timed out".to_string()),
                );
            }
        }
    }

    /// Probes every exchange concurrently so one slow adapter cannot delay
    /// the others' results within the same tick.
    pub async fn check_all(self: &Arc<Self>, exchange_ids: &[String]) {
        let handles: Vec<_> = exchange_ids
            .iter()
            .map(|exchange_id| {
                let prober = self.clone();
                let exchange_id = exchange_id.clone();
                tokio::spawn(async move { prober.check_one(&exchange_id).await })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Spawns the periodic probing loop. `exchange_ids` is the fixed set of
/// registered exchanges to probe each tick.
pub fn spawn_health_prober(
    prober: Arc<HealthProber>,
    exchange_ids: Vec<String>,
    interval: Duration,
) -> broadcast::Sender<()> {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => prober.check_all(&exchange_ids).await,
                _ = shutdown_rx.recv() => break,
            }
        }
    });
    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::{FailoverController, FailoverControllerConfig};
    use aegis_common::events::EventBus;
    use parking_lot::Mutex;

    struct ScriptedProbe {
        connection_ok: bool,
        api_result: Mutex<std::result::Result<Duration, String>>,
    }

    #[async_trait]
    impl ExchangeProbe for ScriptedProbe {
        async fn test_connection(&self, _exchange_id: &str) -> bool {
            self.connection_ok
        }

        async fn test_api_call(&self, _exchange_id: &str) -> std::result::Result<Duration, String> {
            self.api_result.lock().clone()
        }
    }

    #[tokio::test]
    async fn connection_failure_marks_unhealthy_without_calling_api() {
        let controller = Arc::new(FailoverController::new(
            FailoverControllerConfig::default(),
            EventBus::default(),
        ));
        controller.register_exchange("binance", 10).unwrap();

        let probe = Arc::new(ScriptedProbe {
            connection_ok: false,
            api_result: Mutex::new(Ok(Duration::from_millis(10))),
        });
        let prober = HealthProber::new(probe, controller.clone(), HealthProberConfig::default());

        prober.check_one("binance").await;

        let health = controller.health_snapshot("binance").unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn slow_api_call_marks_degraded() {
        let controller = Arc::new(FailoverController::new(
            FailoverControllerConfig::default(),
            EventBus::default(),
        ));
        controller.register_exchange("binance", 10).unwrap();

        let probe = Arc::new(ScriptedProbe {
            connection_ok: true,
            api_result: Mutex::new(Ok(Duration::from_millis(900))),
        });
        let prober = HealthProber::new(probe, controller.clone(), HealthProberConfig::default());

        prober.check_one("binance").await;

        let health = controller.health_snapshot("binance").unwrap();
        assert_eq!(health.status, HealthStatus::Degraded);
    }
}
