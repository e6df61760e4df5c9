//! Thin CLI wiring the notification pipeline and the exchange resilience
//! orchestrator together for manual exercising. Not part of either engine's
//! public surface.

use aegis_common::events::EventBus;
use aegis_common::model::{ChannelKind, Device, Level, NotificationMessage, UserProfile};
use aegis_notify::dispatcher::{spawn_background_tasks, DispatcherConfig, NotificationDispatcher};
use aegis_notify::recorder::{spawn_recorder_tasks, DeliveryRecorder, InMemoryTimeSeriesRepo, TimeSeriesRepo};
use aegis_notify::resilience_bridge::spawn_resilience_bridge;
use aegis_notify::sink::{LogSink, Sink};
use aegis_notify::user_repo::{InMemoryUserRepo, UserRepo};
use aegis_resilience::failover::{FailoverController, FailoverControllerConfig};
use aegis_resilience::health::{spawn_health_prober, ExchangeProbe, HealthProber, HealthProberConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct DemoProbe;

#[async_trait]
impl ExchangeProbe for DemoProbe {
    async fn test_connection(&self, _exchange_id: &str) -> bool {
        true
    }

    async fn test_api_call(&self, _exchange_id: &str) -> Result<Duration, String> {
        Ok(Duration::from_millis(80))
    }
}

#[tokio::main]
async fn main() {
    aegis_common::logging::init_logging("aegis-demo");

    let user_repo = Arc::new(InMemoryUserRepo::new());
    let mut profile = UserProfile::new("demo-user");
    profile.enable_channel(ChannelKind::LogSink);
    profile
        .devices
        .push(Device::new("console", "demo-user", ChannelKind::LogSink, "stdout"));
    user_repo.upsert(profile).await;

    let repo = Arc::new(InMemoryTimeSeriesRepo::new());
    let recorder = Arc::new(DeliveryRecorder::immediate(repo.clone()));
    let mut sinks: HashMap<ChannelKind, Arc<dyn Sink>> = HashMap::new();
    sinks.insert(ChannelKind::LogSink, Arc::new(LogSink));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        user_repo.clone(),
        recorder.clone() as Arc<dyn TimeSeriesRepo>,
        sinks,
        DispatcherConfig::default(),
    ));
    let _notify_shutdown = spawn_background_tasks(dispatcher.clone(), &DispatcherConfig::default());
    let _recorder_shutdown = spawn_recorder_tasks(
        recorder,
        Duration::from_secs(30),
        chrono::Duration::days(30),
        Duration::from_secs(600),
    );

    dispatcher
        .ingest(NotificationMessage::new(
            "orders",
            Level::Critical,
            "Order {{order_id}} filled",
            "Your order has been filled.",
        ))
        .await;

    let events = EventBus::default();
    let controller = Arc::new(FailoverController::new(
        FailoverControllerConfig::default(),
        events.clone(),
    ));
    controller.register_exchange("binance", 20).unwrap();
    controller.register_exchange("kraken", 10).unwrap();

    // Couples the two engines: failover/circuit transitions published on
    // `events` arrive at the dispatcher as synthetic "system" notifications.
    let _bridge_shutdown = spawn_resilience_bridge(dispatcher.clone(), events);

    let prober = Arc::new(HealthProber::new(
        Arc::new(DemoProbe),
        controller.clone(),
        HealthProberConfig::default(),
    ));
    let _health_shutdown = spawn_health_prober(
        prober,
        vec!["binance".to_string(), "kraken".to_string()],
        Duration::from_secs(30),
    );

    controller.trigger_failover("binance", aegis_common::model::FailoverReason::ManualTrigger);

    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("current primary: {:?}", controller.primary());
}
