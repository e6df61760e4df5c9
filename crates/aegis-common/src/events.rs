//! Cross-engine event bus.
//!
//! The original system wired failover/health-change callbacks as stored
//! function objects (`FailoverCallback`, `HealthCallback`) invoked directly
//! from inside the locked critical section that performed the transition.
//! Here those become typed messages broadcast after the lock is released, so
//! the notification pipeline can turn a failover into a user-facing
//! notification without the resilience engine depending on it.

use crate::model::{FailoverReason, HealthStatus};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ResilienceEvent {
    Failover {
        from_exchange: String,
        to_exchange: Option<String>,
        reason: FailoverReason,
        at: DateTime<Utc>,
    },
    HealthChanged {
        exchange_id: String,
        old_status: HealthStatus,
        new_status: HealthStatus,
        at: DateTime<Utc>,
    },
    CircuitOpened {
        circuit: String,
        at: DateTime<Utc>,
    },
    CircuitHalfOpen {
        circuit: String,
        at: DateTime<Utc>,
    },
    CircuitClosed {
        circuit: String,
        at: DateTime<Utc>,
    },
}

/// Thin wrapper around a broadcast channel so callers don't need to think
/// about capacity or the `Sender`/`Receiver` split.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish: a full/unwatched channel is not an error, it
    /// just means nobody is currently listening.
    pub fn publish(&self, event: ResilienceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(ResilienceEvent::CircuitOpened {
            circuit: "binance".to_string(),
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        matches!(event, ResilienceEvent::CircuitOpened { .. });
    }

    #[test]
    fn publish_without_subscriber_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(ResilienceEvent::CircuitClosed {
            circuit: "kraken".to_string(),
            at: Utc::now(),
        });
    }
}
