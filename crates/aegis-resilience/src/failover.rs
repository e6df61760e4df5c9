//! C9: Failover Controller.
//!
//! Owns the exchange registry behind a single `parking_lot::RwLock` --
//! there is no multi-instance deployment in this system's scope, so a
//! process-local writer lock stands in for what the source system used a
//! distributed leader election for. Every transition (initial election,
//! triggered failover, auto-failback, manual failover) happens inside one
//! lock acquisition and publishes a `ResilienceEvent` after the lock is
//! released.

use aegis_common::events::{EventBus, ResilienceEvent};
use aegis_common::model::{ExchangeHealth, FailoverReason, HealthStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ResilienceError, Result};

#[derive(Debug, Clone)]
pub struct FailoverControllerConfig {
    pub max_consecutive_failures: u32,
    pub max_latency_ms: u64,
    pub max_error_rate: f64,
    pub auto_failback_enabled: bool,
    pub failback_cooldown: chrono::Duration,
}

impl Default for FailoverControllerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_latency_ms: 500,
            max_error_rate: 0.1,
            auto_failback_enabled: true,
            failback_cooldown: chrono::Duration::minutes(5),
        }
    }
}

struct Registry {
    health: HashMap<String, ExchangeHealth>,
    primary: Option<String>,
    last_failover: HashMap<String, DateTime<Utc>>,
}

pub struct FailoverController {
    registry: RwLock<Registry>,
    config: FailoverControllerConfig,
    events: EventBus,
}

impl FailoverController {
    pub fn new(config: FailoverControllerConfig, events: EventBus) -> Self {
        Self {
            registry: RwLock::new(Registry {
                health: HashMap::new(),
                primary: None,
                last_failover: HashMap::new(),
            }),
            config,
            events,
        }
    }

    /// Registers a new exchange. It becomes primary if there is no primary
    /// yet, or if its priority is higher than the current primary's.
    pub fn register_exchange(&self, exchange_id: &str, priority: u32) -> Result<()> {
        let mut reg = self.registry.write();
        if reg.health.contains_key(exchange_id) {
            return Err(ResilienceError::AlreadyRegistered(exchange_id.to_string()));
        }

        let health = ExchangeHealth::new(exchange_id, priority);
        reg.health.insert(exchange_id.to_string(), health);

        let should_become_primary = match &reg.primary {
            None => true,
            Some(current) => {
                let current_priority = reg.health.get(current).map(|h| h.priority).unwrap_or(0);
                priority > current_priority
            }
        };
        if should_become_primary {
            reg.primary = Some(exchange_id.to_string());
            info!(exchange_id, "elected as primary on registration");
        }
        Ok(())
    }

    pub fn primary(&self) -> Option<String> {
        self.registry.read().primary.clone()
    }

    /// Clone of the event bus this controller publishes on, so other
    /// components (the resilient executor's circuit breakers) can publish
    /// onto the same bus without the caller wiring a second one through.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn health_snapshot(&self, exchange_id: &str) -> Option<ExchangeHealth> {
        self.registry.read().health.get(exchange_id).cloned()
    }

    /// Exchanges available as failover/failback candidates, sorted by
    /// priority descending.
    pub fn available_exchanges(&self) -> Vec<ExchangeHealth> {
        let reg = self.registry.read();
        let mut available: Vec<ExchangeHealth> = reg
            .health
            .values()
            .filter(|h| h.is_available())
            .cloned()
            .collect();
        available.sort_by(|a, b| b.priority.cmp(&a.priority));
        available
    }

    /// Called by the health prober after each probe. Updates the health
    /// record, publishes a status-change event, then checks whether this
    /// update should trigger a failover.
    pub fn update_exchange_health(
        &self,
        exchange_id: &str,
        status: HealthStatus,
        latency_ms: u64,
        error_rate: f64,
        error_message: Option<String>,
    ) {
        let now = Utc::now();
        let old_status = {
            let mut reg = self.registry.write();
            let Some(health) = reg.health.get_mut(exchange_id) else {
                warn!(exchange_id, "health update for unregistered exchange");
                return;
            };
            let old_status = health.status;
            health.status = status;
            health.latency_ms = latency_ms;
            health.error_rate = error_rate;
            health.last_check = now;
            health.last_error_message = error_message;
            if status == HealthStatus::Healthy {
                health.last_success = Some(now);
                health.consecutive_failures = 0;
            } else {
                health.consecutive_failures += 1;
            }
            old_status
        };

        if old_status != status {
            self.events.publish(ResilienceEvent::HealthChanged {
                exchange_id: exchange_id.to_string(),
                old_status,
                new_status: status,
                at: now,
            });
        }

        self.evaluate_failover_conditions(exchange_id);
    }

    fn should_failover(&self, health: &ExchangeHealth) -> bool {
        (health.status == HealthStatus::Unhealthy
            && health.consecutive_failures >= self.config.max_consecutive_failures)
            || health.latency_ms > self.config.max_latency_ms
            || health.error_rate > self.config.max_error_rate
    }

    fn can_failback_to(&self, reg: &Registry, candidate: &ExchangeHealth, current_priority: u32) -> bool {
        if !candidate.is_available() || candidate.priority <= current_priority {
            return false;
        }
        match reg.last_failover.get(&candidate.exchange_id) {
            None => true,
            Some(last) => Utc::now() - *last >= self.config.failback_cooldown,
        }
    }

    /// Checks the current primary against `should_failover`, and
    /// separately walks priority order for an auto-failback candidate.
    /// Mirrors the two independent checks the controller runs on every
    /// health update.
    fn evaluate_failover_conditions(&self, changed_exchange_id: &str) {
        let trigger_reason = {
            let reg = self.registry.read();
            let Some(primary_id) = &reg.primary else {
                return;
            };
            if primary_id != changed_exchange_id {
                None
            } else if let Some(primary_health) = reg.health.get(primary_id) {
                if self.should_failover(primary_health) {
                    Some(if primary_health.latency_ms > self.config.max_latency_ms {
                        FailoverReason::HighLatency
                    } else {
                        FailoverReason::HealthCheckFailed
                    })
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(reason) = trigger_reason {
            self.find_and_perform_failover_from(changed_exchange_id, reason);
            return;
        }

        if !self.config.auto_failback_enabled {
            return;
        }

        let failback_target = {
            let reg = self.registry.read();
            let Some(primary_id) = &reg.primary else {
                return;
            };
            let current_priority = reg.health.get(primary_id).map(|h| h.priority).unwrap_or(0);
            let mut candidates: Vec<&ExchangeHealth> = reg
                .health
                .values()
                .filter(|h| &h.exchange_id != primary_id)
                .filter(|h| self.can_failback_to(&reg, h, current_priority))
                .collect();
            candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
            candidates.first().map(|h| h.exchange_id.clone())
        };

        if let Some(target) = failback_target {
            self.perform_failover(&target, FailoverReason::Failback);
        }
    }

    /// Explicit operator-initiated failover, bypassing health evaluation.
    pub fn manual_failover(&self, target_exchange_id: &str) -> Result<()> {
        {
            let reg = self.registry.read();
            if !reg.health.contains_key(target_exchange_id) {
                return Err(ResilienceError::NotRegistered(target_exchange_id.to_string()));
            }
        }
        self.perform_failover(target_exchange_id, FailoverReason::ManualTrigger);
        Ok(())
    }

    /// Explicit failover trigger, callable by the health prober or the
    /// resilient executor on an operation failure. A no-op unless
    /// `exchange_id` is the current primary -- triggering a failover away
    /// from a non-primary exchange makes no sense, it is already not in the
    /// hot path.
    pub fn trigger_failover(&self, exchange_id: &str, reason: FailoverReason) {
        let is_primary = self.registry.read().primary.as_deref() == Some(exchange_id);
        if !is_primary {
            return;
        }
        self.find_and_perform_failover_from(exchange_id, reason);
    }

    /// Finds the best available exchange other than `from` and fails over
    /// to it.
    fn find_and_perform_failover_from(&self, from: &str, reason: FailoverReason) {
        let target = {
            let reg = self.registry.read();
            reg.health
                .values()
                .filter(|h| h.exchange_id != from)
                .filter(|h| h.is_available())
                .max_by_key(|h| h.priority)
                .map(|h| h.exchange_id.clone())
        };

        match target {
            Some(target) => self.perform_failover(&target, reason),
            None => warn!(?reason, exchange_id = from, "failover triggered but no available exchange"),
        }
    }

    fn perform_failover(&self, target_exchange_id: &str, reason: FailoverReason) {
        let now = Utc::now();
        let from = {
            let mut reg = self.registry.write();
            let from = reg.primary.clone();
            if from.as_deref() == Some(target_exchange_id) {
                return;
            }
            if let Some(old) = &from {
                reg.last_failover.insert(old.clone(), now);
            }
            reg.primary = Some(target_exchange_id.to_string());
            from
        };

        info!(from = ?from, to = target_exchange_id, ?reason, "failover performed");
        self.events.publish(ResilienceEvent::Failover {
            from_exchange: from.unwrap_or_default(),
            to_exchange: Some(target_exchange_id.to_string()),
            reason,
            at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FailoverController {
        FailoverController::new(FailoverControllerConfig::default(), EventBus::default())
    }

    #[test]
    fn first_registered_exchange_becomes_primary() {
        let c = controller();
        c.register_exchange("binance", 10).unwrap();
        assert_eq!(c.primary(), Some("binance".to_string()));
    }

    #[test]
    fn higher_priority_registration_takes_over_primary() {
        let c = controller();
        c.register_exchange("binance", 10).unwrap();
        c.register_exchange("kraken", 20).unwrap();
        assert_eq!(c.primary(), Some("kraken".to_string()));
    }

    #[test]
    fn consecutive_unhealthy_checks_trigger_failover_to_next_best() {
        let c = controller();
        c.register_exchange("binance", 20).unwrap();
        c.register_exchange("kraken", 10).unwrap();
        c.update_exchange_health("kraken", HealthStatus::Healthy, 50, 0.0, None);

        for _ in 0..3 {
            c.update_exchange_health("binance", HealthStatus::Unhealthy, 50, 0.0, Some("timeout".to_string()));
        }

        assert_eq!(c.primary(), Some("kraken".to_string()));
    }

    #[test]
    fn manual_failover_to_unregistered_exchange_errors() {
        let c = controller();
        c.register_exchange("binance", 10).unwrap();
        assert!(c.manual_failover("ghost").is_err());
    }

    #[test]
    fn double_registration_errors() {
        let c = controller();
        c.register_exchange("binance", 10).unwrap();
        assert!(c.register_exchange("binance", 10).is_err());
    }

    #[test]
    fn explicit_trigger_failover_chains_to_next_best_then_ignores_non_primary() {
        let c = controller();
        c.register_exchange("a", 30).unwrap();
        c.register_exchange("b", 20).unwrap();
        c.register_exchange("c", 10).unwrap();
        c.update_exchange_health("a", HealthStatus::Healthy, 10, 0.0, None);
        c.update_exchange_health("b", HealthStatus::Healthy, 10, 0.0, None);
        c.update_exchange_health("c", HealthStatus::Healthy, 10, 0.0, None);
        assert_eq!(c.primary(), Some("a".to_string()));

        c.update_exchange_health("a", HealthStatus::Unhealthy, 10, 0.0, Some("down".to_string()));
        c.trigger_failover("a", FailoverReason::HealthCheckFailed);
        assert_eq!(c.primary(), Some("b".to_string()));

        // triggering on a non-primary exchange is a no-op
        c.trigger_failover("c", FailoverReason::HighLatency);
        assert_eq!(c.primary(), Some("b".to_string()));

        c.update_exchange_health("b", HealthStatus::Unhealthy, 10, 0.0, Some("down".to_string()));
        c.trigger_failover("b", FailoverReason::HealthCheckFailed);
        assert_eq!(c.primary(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn auto_failback_publishes_dedicated_reason_not_manual_trigger() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let config = FailoverControllerConfig {
            failback_cooldown: chrono::Duration::zero(),
            ..FailoverControllerConfig::default()
        };
        let c = FailoverController::new(config, events);
        c.register_exchange("a", 30).unwrap();
        c.register_exchange("b", 20).unwrap();
        c.update_exchange_health("a", HealthStatus::Healthy, 10, 0.0, None);
        c.update_exchange_health("b", HealthStatus::Healthy, 10, 0.0, None);
        assert_eq!(c.primary(), Some("a".to_string()));

        for _ in 0..3 {
            c.update_exchange_health("a", HealthStatus::Unhealthy, 10, 0.0, Some("down".to_string()));
        }
        assert_eq!(c.primary(), Some("b".to_string()));

        // `a` recovers; with zero cooldown it fails back to primary on the
        // very next health update.
        c.update_exchange_health("a", HealthStatus::Healthy, 10, 0.0, None);
        assert_eq!(c.primary(), Some("a".to_string()));

        let mut saw_failback_reason = false;
        while let Ok(event) = rx.try_recv() {
            if let ResilienceEvent::Failover { from_exchange, to_exchange, reason, .. } = event {
                if from_exchange == "b" && to_exchange.as_deref() == Some("a") {
                    assert_eq!(reason, FailoverReason::Failback);
                    saw_failback_reason = true;
                }
            }
        }
        assert!(saw_failback_reason, "expected a Failover event for the auto-failback");
    }
}
