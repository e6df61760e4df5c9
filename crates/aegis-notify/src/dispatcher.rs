//! C7: Notification Dispatcher.
//!
//! Wires the evaluator, throttle gate, batch scheduler, template renderer,
//! sinks and recorder into the end-to-end pipeline. Background tasks
//! (batch flush, recorder retention) follow the shutdown-broadcast pattern:
//! each is an independent `tokio::spawn`ed loop selecting between its
//! ticker and a shared `broadcast::Receiver<()>`.
//!
//! Every outcome -- delivered, batched-then-delivered, or dropped at any
//! check -- ends in exactly one `DeliveryRecord` write, so rate-limiting
//! and rule drops are as observable as a successful send.

use aegis_common::model::{
    ChannelKind, DeliveryOutcome, DeliveryRecord, Device, NotificationMessage, PendingBatch,
    UserProfile,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::{compose_email_digest, BatchScheduler};
use crate::recorder::TimeSeriesRepo;
use crate::rule_evaluator::{RuleDecision, RuleEvaluator};
use crate::sink::Sink;
use crate::template::TemplateRenderer;
use crate::throttle::ThrottleGate;
use crate::user_repo::UserRepo;

pub struct DispatcherConfig {
    /// Retries attempted after the initial send, on top of it -- the
    /// default of 3 yields 4 attempts total.
    pub max_retries: u32,
    pub retry_delay: StdDuration,
    pub batch_flush_interval: StdDuration,
    /// Bounded fan-out width across user profiles; defaults to
    /// the number of available CPUs.
    pub worker_count: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: StdDuration::from_secs(5),
            batch_flush_interval: StdDuration::from_secs(30),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

pub struct NotificationDispatcher {
    user_repo: Arc<dyn UserRepo>,
    recorder: Arc<dyn TimeSeriesRepo>,
    batch_scheduler: Arc<BatchScheduler>,
    sinks: HashMap<ChannelKind, Arc<dyn Sink>>,
    evaluator: RuleEvaluator,
    throttle: ThrottleGate,
    template: TemplateRenderer,
    config: DispatcherConfig,
}

impl NotificationDispatcher {
    pub fn new(
        user_repo: Arc<dyn UserRepo>,
        recorder: Arc<dyn TimeSeriesRepo>,
        sinks: HashMap<ChannelKind, Arc<dyn Sink>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            user_repo,
            recorder,
            batch_scheduler: Arc::new(BatchScheduler::new()),
            sinks,
            evaluator: RuleEvaluator::new(),
            throttle: ThrottleGate::new(),
            template: TemplateRenderer::new(),
            config,
        }
    }

    /// Routes one inbound domain event to every known user profile, in
    /// parallel up to `config.worker_count`: per user, per
    /// enabled channel, evaluate then throttle, then either dispatch
    /// immediately or queue into that channel's open batch. This is the
    /// public ingress `process()` entry point; `handler_for` adapts it to
    /// the `(NotificationMessage) -> ()` shape an external event bus
    /// expects. Per-user work is independent and unordered across users;
    /// within one user it runs sequentially, preserving that user's
    /// rule-state monotonicity.
    pub async fn process(&self, message: NotificationMessage) {
        let profiles = self.user_repo.load_all().await;
        let worker_count = self.config.worker_count.max(1);

        stream::iter(profiles)
            .for_each_concurrent(Some(worker_count), |profile| {
                let message = &message;
                async move {
                    self.process_for_user(profile, message).await;
                }
            })
            .await;
    }

    async fn process_for_user(&self, profile: UserProfile, message: &NotificationMessage) {
        let now = Utc::now();
        let decisions = self.evaluator.evaluate(&profile, message, now);

        for decision in decisions {
            match decision {
                RuleDecision::Drop { channel, reason } => {
                    info!(user_id = %profile.user_id, ?channel, reason, "message dropped by rule evaluation");
                    self.record_drop(message, &profile.user_id, channel, &reason)
                        .await;
                }
                RuleDecision::Deliver {
                    channel,
                    frequency,
                    rule_id,
                    max_per_hour,
                    cooldown_secs,
                } => {
                    let rule_key = rule_id.unwrap_or_else(|| "default".to_string());
                    if !self.throttle.check_and_record(
                        &profile.user_id,
                        &rule_key,
                        max_per_hour,
                        chrono::Duration::seconds(cooldown_secs as i64),
                        now,
                    ) {
                        info!(user_id = %profile.user_id, ?channel, "message throttled");
                        self.record_drop(message, &profile.user_id, channel, "throttled")
                            .await;
                        continue;
                    }

                    if frequency == aegis_common::model::Frequency::Immediate {
                        self.dispatch_immediate(&profile.user_id, &profile.devices, message, channel)
                            .await;
                    } else {
                        self.batch_scheduler.add_to_batch(
                            &profile.user_id,
                            channel,
                            message.clone(),
                            frequency,
                            now,
                        );
                    }
                }
            }
        }
    }

    /// Alias kept for direct callers that think in terms of "ingesting" a
    /// message rather than the spec's `process` terminology.
    pub async fn ingest(&self, message: NotificationMessage) {
        self.process(message).await;
    }

    /// Bypasses rule evaluation and the throttle gate entirely -- an
    /// administrative send straight to a channel, still recorded.
    pub async fn send_direct(
        &self,
        user_id: &str,
        channel: ChannelKind,
        message: &NotificationMessage,
    ) {
        let Some(profile) = self.user_repo.get(user_id).await else {
            warn!(user_id, "send_direct for unknown user, dropping");
            return;
        };
        self.dispatch_immediate(user_id, &profile.devices, message, channel)
            .await;
    }

    /// Returns a callable of the shape an external event bus expects:
    /// `(NotificationMessage) -> ()`, fixed to `category`. Used to plug the
    /// dispatcher into the Failover Controller's event stream as a
    /// synthetic notification source.
    pub fn handler_for(
        self: &Arc<Self>,
        category: impl Into<String>,
    ) -> impl Fn(NotificationMessage) -> tokio::task::JoinHandle<()> + Send + Sync + 'static {
        let dispatcher = self.clone();
        let category = category.into();
        move |mut message: NotificationMessage| {
            message.category = category.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.process(message).await })
        }
    }

    fn device_for_channel<'a>(devices: &'a [Device], channel: ChannelKind) -> Option<&'a Device> {
        devices.iter().find(|d| d.channel == channel && d.valid)
    }

    async fn dispatch_immediate(
        &self,
        user_id: &str,
        devices: &[Device],
        message: &NotificationMessage,
        channel: ChannelKind,
    ) {
        let Some(device) = Self::device_for_channel(devices, channel) else {
            warn!(user_id, ?channel, "no device registered for channel");
            self.record_drop(message, user_id, channel, "no_device").await;
            return;
        };
        let Some(sink) = self.sinks.get(&channel) else {
            warn!(?channel, "no sink configured for channel");
            self.record_drop(message, user_id, channel, "no_sink").await;
            return;
        };

        let rendered = self.template.render(message);
        self.send_with_retry(sink.as_ref(), user_id, device, message, channel, &rendered)
            .await;
    }

    /// Sends once, then retries a transient/rate-limited outcome up to
    /// `max_retries` further times (default 3 retries, 4 attempts total),
    /// sleeping `retry_delay` between attempts; stops immediately on
    /// success or a permanent/invalid-recipient outcome. A reported
    /// `InvalidRecipient` deactivates the device (push token de-registration,
    /// S6) so future sends skip it. The recorded `retry_count` is the number
    /// of failed attempts prior to the terminal outcome -- 0 on a first-try
    /// success.
    #[allow(clippy::too_many_arguments)]
    async fn send_with_retry(
        &self,
        sink: &dyn Sink,
        user_id: &str,
        device: &Device,
        message: &NotificationMessage,
        channel: ChannelKind,
        rendered: &crate::template::RenderedContent,
    ) -> DeliveryOutcome {
        let sent_at = Utc::now();
        let start = Instant::now();
        // Number of failed attempts prior to the current one; 0 on the
        // first send.
        let mut retries_done = 0u32;

        loop {
            let outcome = sink.send(device, rendered).await;
            match outcome {
                DeliveryOutcome::Success => {
                    self.record(message, user_id, channel, Some(device), outcome, retries_done, sent_at, start, None)
                        .await;
                    return outcome;
                }
                DeliveryOutcome::InvalidRecipient => {
                    self.deactivate_device(user_id, &device.id).await;
                    self.record(
                        message,
                        user_id,
                        channel,
                        Some(device),
                        outcome,
                        retries_done,
                        sent_at,
                        start,
                        Some("token_invalid"),
                    )
                    .await;
                    return outcome;
                }
                DeliveryOutcome::Permanent | DeliveryOutcome::Dropped => {
                    self.record(message, user_id, channel, Some(device), outcome, retries_done, sent_at, start, None)
                        .await;
                    return outcome;
                }
                DeliveryOutcome::Transient | DeliveryOutcome::RateLimited => {
                    if retries_done >= self.config.max_retries {
                        self.record(
                            message,
                            user_id,
                            channel,
                            Some(device),
                            outcome,
                            retries_done,
                            sent_at,
                            start,
                            Some("exhausted"),
                        )
                        .await;
                        return outcome;
                    }
                    retries_done += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn deactivate_device(&self, user_id: &str, device_id: &str) {
        if let Some(mut profile) = self.user_repo.get(user_id).await {
            if let Some(device) = profile.devices.iter_mut().find(|d| d.id == device_id) {
                device.valid = false;
                self.user_repo.upsert(profile).await;
            }
        }
    }

    async fn record_drop(
        &self,
        message: &NotificationMessage,
        user_id: &str,
        channel: ChannelKind,
        reason: &str,
    ) {
        let now = Utc::now();
        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            message_id: message.id,
            user_id: user_id.to_string(),
            channel,
            level: message.level,
            category: message.category.clone(),
            exchange_id: message.exchange_id.clone(),
            device_id: None,
            outcome: DeliveryOutcome::Dropped,
            delivered: false,
            retry_count: 0,
            sent_at: now,
            delivered_at: None,
            latency_ms: 0,
            error_code: Some(reason.to_string()),
            error_message: None,
            recorded_at: now,
        };
        self.recorder.record(record).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        message: &NotificationMessage,
        user_id: &str,
        channel: ChannelKind,
        device: Option<&Device>,
        outcome: DeliveryOutcome,
        retry_count: u32,
        sent_at: chrono::DateTime<Utc>,
        start: Instant,
        error_code: Option<&str>,
    ) {
        let delivered = outcome == DeliveryOutcome::Success;
        let delivered_at = delivered.then(Utc::now);
        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            message_id: message.id,
            user_id: user_id.to_string(),
            channel,
            level: message.level,
            category: message.category.clone(),
            exchange_id: message.exchange_id.clone(),
            device_id: device.map(|d| d.id.clone()),
            outcome,
            delivered,
            retry_count,
            sent_at,
            delivered_at,
            latency_ms: start.elapsed().as_millis() as u64,
            error_code: error_code.map(|s| s.to_string()),
            error_message: None,
            recorded_at: Utc::now(),
        };
        self.recorder.record(record).await;
    }

    async fn flush_batch(&self, batch: PendingBatch) {
        let Some(sink) = self.sinks.get(&batch.channel) else {
            warn!(channel = ?batch.channel, "no sink configured for batch channel");
            return;
        };

        let Some(profile) = self.user_repo.get(&batch.user_id).await else {
            warn!(user_id = %batch.user_id, "batch flush for unknown user, dropping");
            return;
        };
        let Some(device) = Self::device_for_channel(&profile.devices, batch.channel) else {
            warn!(user_id = %batch.user_id, channel = ?batch.channel, "no device for batched channel");
            return;
        };

        if batch.channel == ChannelKind::Email {
            let rendered = compose_email_digest(&batch);
            let Some(first) = batch.messages.first() else {
                return;
            };
            self.send_with_retry(sink.as_ref(), &batch.user_id, device, first, batch.channel, &rendered)
                .await;
        } else {
            for message in &batch.messages {
                let rendered = self.template.render(message);
                self.send_with_retry(sink.as_ref(), &batch.user_id, device, message, batch.channel, &rendered)
                    .await;
            }
        }
    }

    /// Drains and flushes every batch due at `now`. Exposed directly so
    /// tests don't need to drive the background task's ticker.
    pub async fn flush_due_batches(&self) {
        let now = Utc::now();
        for batch in self.batch_scheduler.drain_due(now) {
            self.flush_batch(batch).await;
        }
    }

    /// Unconditional flush used at shutdown.
    pub async fn drain_all_batches(&self) {
        for batch in self.batch_scheduler.drain_all() {
            self.flush_batch(batch).await;
        }
    }

    pub fn pending_batch_count(&self) -> usize {
        self.batch_scheduler.pending_count()
    }
}

/// Spawns the batch-flush background loop for pending notification batches.
/// Returns the shutdown sender; dropping or sending on it stops the loop. On
/// shutdown, the batch scheduler is drained unconditionally before the loop
/// exits, per the grace-period drain policy. Delivery-recorder maintenance
/// (flush, retention, aggregation) is a separate set of loops spawned by
/// `recorder::spawn_recorder_tasks`.
pub fn spawn_background_tasks(
    dispatcher: Arc<NotificationDispatcher>,
    config: &DispatcherConfig,
) -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut shutdown_rx = shutdown_tx.subscribe();
    let interval = config.batch_flush_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => dispatcher.flush_due_batches().await,
                _ = shutdown_rx.recv() => {
                    dispatcher.drain_all_batches().await;
                    break;
                }
            }
        }
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::InMemoryTimeSeriesRepo;
    use crate::sink::InMemoryPushSink;
    use crate::user_repo::InMemoryUserRepo;
    use aegis_common::model::{Level, UserProfile};

    fn device(channel: ChannelKind, address: &str) -> Device {
        Device::new(format!("{address}-dev"), "u1", channel, address)
    }

    async fn build(
        push_sink: Arc<InMemoryPushSink>,
    ) -> (
        Arc<NotificationDispatcher>,
        Arc<InMemoryUserRepo>,
        Arc<InMemoryTimeSeriesRepo>,
    ) {
        let user_repo = Arc::new(InMemoryUserRepo::new());
        let recorder = Arc::new(InMemoryTimeSeriesRepo::new());

        let mut profile = UserProfile::new("u1");
        profile.enable_channel(ChannelKind::Push);
        profile.devices.push(device(ChannelKind::Push, "tok-1"));
        user_repo.upsert(profile).await;

        let mut sinks: HashMap<ChannelKind, Arc<dyn Sink>> = HashMap::new();
        sinks.insert(ChannelKind::Push, push_sink);

        let dispatcher = Arc::new(NotificationDispatcher::new(
            user_repo.clone(),
            recorder.clone(),
            sinks,
            DispatcherConfig::default(),
        ));
        (dispatcher, user_repo, recorder)
    }

    #[tokio::test]
    async fn immediate_critical_message_dispatches_and_records_success() {
        let push_sink = Arc::new(InMemoryPushSink::new());
        let (dispatcher, _user_repo, recorder) = build(push_sink.clone()).await;

        let message =
            NotificationMessage::new("orders", Level::Critical, "Order filled", "details");
        dispatcher.process(message).await;

        assert_eq!(push_sink.sent_messages().len(), 1);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.all()[0].outcome, DeliveryOutcome::Success);
        assert!(recorder.all()[0].delivered);
    }

    #[tokio::test]
    async fn info_level_message_with_no_rule_is_dropped_and_recorded() {
        let push_sink = Arc::new(InMemoryPushSink::new());
        let (dispatcher, _user_repo, recorder) = build(push_sink.clone()).await;

        let message = NotificationMessage::new("orders", Level::Info, "fyi", "details");
        dispatcher.process(message).await;

        assert!(push_sink.sent_messages().is_empty());
        assert_eq!(recorder.len(), 1);
        let record = &recorder.all()[0];
        assert!(!record.delivered);
        assert_eq!(record.error_code.as_deref(), Some("no_rule"));
    }

    #[tokio::test]
    async fn invalid_token_deactivates_device_and_is_skipped_on_next_process() {
        let push_sink = Arc::new(InMemoryPushSink::new());
        let (dispatcher, user_repo, recorder) = build(push_sink.clone()).await;

        // Replace the device's token with the sink's invalid-token sentinel.
        let mut profile = user_repo.get("u1").await.unwrap();
        profile.devices[0].address = "invalid-token".to_string();
        user_repo.upsert(profile).await;

        let first = NotificationMessage::new("orders", Level::Critical, "t", "b");
        dispatcher.process(first).await;

        let profile = user_repo.get("u1").await.unwrap();
        assert!(!profile.devices[0].valid);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.all()[0].error_code.as_deref(), Some("token_invalid"));

        let second = NotificationMessage::new("orders", Level::Critical, "t2", "b2");
        dispatcher.process(second).await;

        // The device is now inactive, so the second message finds no
        // device and is dropped -- no second attempt against the dead
        // token.
        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.all()[1].error_code.as_deref(), Some("no_device"));
    }
}
