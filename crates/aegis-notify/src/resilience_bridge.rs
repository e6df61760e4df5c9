//! Bridges exchange resilience transitions onto the notification pipeline.
//!
//! §2's coupling: "exchange event: C8 sample -> C9 (may trigger transition)
//! -> transition callback -> C7 (as a synthetic notification event)".
//! `aegis-resilience` never depends on `aegis-notify`; instead the
//! `EventBus` lives in `aegis-common` and both crates depend on that, same
//! redesign as the events module itself (callback-as-stored-object becomes
//! a broadcast message neither side owns).

use std::sync::Arc;

use aegis_common::events::{EventBus, ResilienceEvent};
use aegis_common::model::{HealthStatus, Level, NotificationMessage};
use tokio::sync::broadcast;
use tracing::warn;

use crate::dispatcher::NotificationDispatcher;

/// Category routing rules match a resilience-sourced message against.
pub const RESILIENCE_CATEGORY: &str = "system";

fn to_message(event: ResilienceEvent) -> NotificationMessage {
    match event {
        ResilienceEvent::Failover {
            from_exchange,
            to_exchange,
            reason,
            ..
        } => {
            let to = to_exchange.clone().unwrap_or_else(|| "none".to_string());
            let mut message = NotificationMessage::new(
                RESILIENCE_CATEGORY,
                Level::Warning,
                format!("Exchange failover: {from_exchange} -> {to}"),
                format!("Primary exchange failed over from {from_exchange} to {to} ({reason:?})"),
            );
            message.exchange_id = to_exchange.or(Some(from_exchange.clone()));
            message
                .metadata
                .insert("from_exchange".to_string(), from_exchange);
            message
                .metadata
                .insert("reason".to_string(), format!("{reason:?}"));
            message
        }
        ResilienceEvent::HealthChanged {
            exchange_id,
            old_status,
            new_status,
            ..
        } => {
            let level = match new_status {
                HealthStatus::Unhealthy => Level::Error,
                HealthStatus::Degraded => Level::Warning,
                HealthStatus::Healthy | HealthStatus::Unknown => Level::Info,
            };
            let mut message = NotificationMessage::new(
                RESILIENCE_CATEGORY,
                level,
                format!("Exchange {exchange_id} health: {old_status:?} -> {new_status:?}"),
                format!("{exchange_id} health status changed from {old_status:?} to {new_status:?}"),
            );
            message.exchange_id = Some(exchange_id);
            message
        }
        ResilienceEvent::CircuitOpened { circuit, .. } => NotificationMessage::new(
            RESILIENCE_CATEGORY,
            Level::Error,
            format!("Circuit breaker opened: {circuit}"),
            format!("{circuit} tripped open after consecutive failures"),
        ),
        ResilienceEvent::CircuitHalfOpen { circuit, .. } => NotificationMessage::new(
            RESILIENCE_CATEGORY,
            Level::Info,
            format!("Circuit breaker probing recovery: {circuit}"),
            format!("{circuit} moved to half-open"),
        ),
        ResilienceEvent::CircuitClosed { circuit, .. } => NotificationMessage::new(
            RESILIENCE_CATEGORY,
            Level::Info,
            format!("Circuit breaker recovered: {circuit}"),
            format!("{circuit} closed and is accepting calls again"),
        ),
    }
}

/// Subscribes to `events` and feeds every resilience transition through
/// `dispatcher.process()` under [`RESILIENCE_CATEGORY`], so failover and
/// circuit-breaker state changes reach users through the same
/// rule/throttle/batch pipeline as any other domain event, without
/// starving normal traffic -- this only ever adds one more message to
/// `process()`'s existing bounded fan-out, it does not run ahead of it.
/// Runs until shut down or the bus's sender is dropped; a receiver that
/// lags behind the bus just resumes from the next event rather than
/// stalling.
pub fn spawn_resilience_bridge(
    dispatcher: Arc<NotificationDispatcher>,
    events: EventBus,
) -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Ok(event) => dispatcher.process(to_message(event)).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "resilience bridge lagged behind event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::InMemoryTimeSeriesRepo;
    use crate::sink::{InMemoryPushSink, Sink};
    use crate::user_repo::{InMemoryUserRepo, UserRepo};
    use aegis_common::model::{ChannelKind, Device, FailoverReason, UserProfile};
    use std::collections::HashMap;

    #[tokio::test]
    async fn failover_event_becomes_a_delivered_notification() {
        let user_repo = Arc::new(InMemoryUserRepo::new());
        let mut profile = UserProfile::new("u1");
        profile.enable_channel(ChannelKind::Push);
        profile
            .devices
            .push(Device::new("d1", "u1", ChannelKind::Push, "token"));
        user_repo.upsert(profile).await;

        let repo = Arc::new(InMemoryTimeSeriesRepo::new());
        let mut sinks: HashMap<ChannelKind, Arc<dyn Sink>> = HashMap::new();
        let push = Arc::new(InMemoryPushSink::new());
        sinks.insert(ChannelKind::Push, push.clone());

        let dispatcher = Arc::new(NotificationDispatcher::new(
            user_repo,
            repo.clone(),
            sinks,
            crate::dispatcher::DispatcherConfig::default(),
        ));

        let events = EventBus::default();
        let _shutdown = spawn_resilience_bridge(dispatcher, events.clone());

        events.publish(ResilienceEvent::Failover {
            from_exchange: "binance".to_string(),
            to_exchange: Some("kraken".to_string()),
            reason: FailoverReason::HealthCheckFailed,
            at: chrono::Utc::now(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(push.sent_messages().len(), 1);
    }
}
