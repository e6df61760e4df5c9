//! C2: Delivery Recorder. Write-only from the dispatcher's perspective --
//! there is no query surface here, matching how the original's time-series
//! storage had a `parse_notification_point` read path that nothing in this
//! system's scope calls.
//!
//! Ingestion has two modes. Immediate mode (the default) writes straight
//! through to the repository port on every call. Batch mode instead pushes
//! into a bounded in-memory queue and only touches the repository on
//! flush, driven by the periodic ticker in `spawn_recorder_tasks` or an
//! explicit call. Overflow drops the oldest queued record and bumps a
//! monotonic counter rather than blocking the caller; telemetry loss here
//! is cheaper than slowing down the hot path that produced it.

use aegis_common::config::BatchConfig;
use aegis_common::model::{AggregatePeriod, ChannelKind, DeliveryAggregate, DeliveryRecord, Level};
use async_trait::async_trait;
use chrono::Timelike;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

#[async_trait]
pub trait TimeSeriesRepo: Send + Sync {
    async fn record(&self, record: DeliveryRecord);

    /// Drop anything older than `retention`. Called by the background
    /// retention task, never on the hot path.
    async fn apply_retention(&self, retention: chrono::Duration);

    /// Persist one hourly or daily roll-up, written by the aggregator task.
    async fn record_aggregate(&self, aggregate: DeliveryAggregate);

    /// Records whose `recorded_at` falls in `[start, end)`, consulted by the
    /// aggregator. Not used on the delivery hot path.
    async fn records_in_window(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Vec<DeliveryRecord>;
}

#[derive(Default)]
pub struct InMemoryTimeSeriesRepo {
    records: Arc<RwLock<Vec<DeliveryRecord>>>,
    aggregates: Arc<RwLock<Vec<DeliveryAggregate>>>,
}

impl InMemoryTimeSeriesRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DeliveryRecord> {
        self.records.read().clone()
    }

    pub fn aggregates(&self) -> Vec<DeliveryAggregate> {
        self.aggregates.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl TimeSeriesRepo for InMemoryTimeSeriesRepo {
    async fn record(&self, record: DeliveryRecord) {
        debug!(
            message_id = %record.message_id,
            channel = ?record.channel,
            outcome = ?record.outcome,
            "delivery recorded"
        );
        metrics::counter!(
            "aegis_delivery_records_total",
            "channel" => format!("{:?}", record.channel),
            "outcome" => format!("{:?}", record.outcome),
        )
        .increment(1);
        if let Some(latency) = (record.delivered).then_some(record.latency_ms) {
            metrics::histogram!("aegis_delivery_latency_ms", "channel" => format!("{:?}", record.channel))
                .record(latency as f64);
        }
        self.records.write().push(record);
    }

    async fn apply_retention(&self, retention: chrono::Duration) {
        let cutoff = chrono::Utc::now() - retention;
        self.records.write().retain(|r| r.recorded_at >= cutoff);
    }

    async fn record_aggregate(&self, aggregate: DeliveryAggregate) {
        self.aggregates.write().push(aggregate);
    }

    async fn records_in_window(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Vec<DeliveryRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.recorded_at >= start && r.recorded_at < end)
            .cloned()
            .collect()
    }
}

/// Sits in front of a `TimeSeriesRepo`, adding the bounded batch-ingestion
/// queue the repository port itself has no opinion on.
pub struct DeliveryRecorder {
    repo: Arc<dyn TimeSeriesRepo>,
    queue: parking_lot::Mutex<VecDeque<DeliveryRecord>>,
    batch_size: usize,
    dropped: AtomicU64,
    batched: bool,
}

impl DeliveryRecorder {
    /// Immediate mode: every `record()` call writes straight through.
    pub fn immediate(repo: Arc<dyn TimeSeriesRepo>) -> Self {
        Self {
            repo,
            queue: parking_lot::Mutex::new(VecDeque::new()),
            batch_size: 0,
            dropped: AtomicU64::new(0),
            batched: false,
        }
    }

    /// Batch mode: records queue up to `config.size`, oldest dropped first
    /// on overflow, flushed explicitly or by the background ticker.
    pub fn batched(repo: Arc<dyn TimeSeriesRepo>, config: &BatchConfig) -> Self {
        Self {
            repo,
            queue: parking_lot::Mutex::new(VecDeque::with_capacity(config.size)),
            batch_size: config.size.max(1),
            dropped: AtomicU64::new(0),
            batched: true,
        }
    }

    /// Queues a record. In batch mode, flush happens only on the timer
    /// (`spawn_recorder_tasks`) or an explicit `flush()` call -- reaching
    /// `batch_size` does not itself trigger one. A queue already at capacity
    /// drops its oldest entry to make room, counted in `dropped_count`.
    pub async fn record(&self, record: DeliveryRecord) {
        if !self.batched {
            self.repo.record(record).await;
            return;
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.batch_size {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("aegis_recorder_dropped_records_total").increment(1);
        }
        queue.push_back(record);
    }

    /// Writes every queued record through to the repository. Called by the
    /// flush ticker and at shutdown; safe to call with an empty queue.
    pub async fn flush(&self) {
        let drained: Vec<DeliveryRecord> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for record in drained {
            self.repo.record(record).await;
        }
    }

    /// Total records dropped to overflow since construction -- observability
    /// for the drop-oldest policy, never consulted for correctness.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub async fn apply_retention(&self, retention: chrono::Duration) {
        self.repo.apply_retention(retention).await;
    }

    pub fn repo(&self) -> Arc<dyn TimeSeriesRepo> {
        self.repo.clone()
    }
}

/// Lets a `DeliveryRecorder` stand in anywhere a bare `TimeSeriesRepo` is
/// expected -- the dispatcher never needs to know whether ingestion is
/// immediate or batched underneath it.
#[async_trait]
impl TimeSeriesRepo for DeliveryRecorder {
    async fn record(&self, record: DeliveryRecord) {
        DeliveryRecorder::record(self, record).await;
    }

    async fn apply_retention(&self, retention: chrono::Duration) {
        self.repo.apply_retention(retention).await;
    }

    async fn record_aggregate(&self, aggregate: DeliveryAggregate) {
        self.repo.record_aggregate(aggregate).await;
    }

    async fn records_in_window(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    ) -> Vec<DeliveryRecord> {
        self.repo.records_in_window(start, end).await
    }
}

fn compute_aggregate(
    period: AggregatePeriod,
    window_start: chrono::DateTime<chrono::Utc>,
    window_end: chrono::DateTime<chrono::Utc>,
    records: &[DeliveryRecord],
) -> DeliveryAggregate {
    let mut count_by_level: HashMap<Level, u64> = HashMap::new();
    let mut count_by_channel: HashMap<ChannelKind, u64> = HashMap::new();
    let mut delivered_count = 0u64;
    let mut retry_count = 0u64;
    let mut latency_min = u64::MAX;
    let mut latency_max = 0u64;
    let mut latency_sum = 0u64;

    for record in records {
        *count_by_level.entry(record.level).or_insert(0) += 1;
        *count_by_channel.entry(record.channel).or_insert(0) += 1;
        if record.delivered {
            delivered_count += 1;
        }
        retry_count += record.retry_count as u64;
        latency_min = latency_min.min(record.latency_ms);
        latency_max = latency_max.max(record.latency_ms);
        latency_sum += record.latency_ms;
    }

    let total_count = records.len() as u64;
    let latency_avg_ms = if total_count > 0 {
        latency_sum as f64 / total_count as f64
    } else {
        0.0
    };

    DeliveryAggregate {
        period,
        window_start,
        window_end,
        total_count,
        delivered_count,
        retry_count,
        count_by_level,
        count_by_channel,
        latency_min_ms: if total_count > 0 { latency_min } else { 0 },
        latency_avg_ms,
        latency_max_ms: latency_max,
    }
}

/// Computes and writes the hourly aggregate over `[now - 1h, now)`, and the
/// daily aggregate over `[now - 1d, now)` whenever `now`'s hour is 0 -- the
/// same "check every tick, act only on boundary" shape as the failback
/// cooldown check.
async fn run_aggregation_tick(repo: &Arc<dyn TimeSeriesRepo>, now: chrono::DateTime<chrono::Utc>) {
    let hour_start = now - chrono::Duration::hours(1);
    let hourly_records = repo.records_in_window(hour_start, now).await;
    let hourly = compute_aggregate(AggregatePeriod::Hourly, hour_start, now, &hourly_records);
    repo.record_aggregate(hourly).await;

    if now.hour() == 0 {
        let day_start = now - chrono::Duration::days(1);
        let daily_records = repo.records_in_window(day_start, now).await;
        let daily = compute_aggregate(AggregatePeriod::Daily, day_start, now, &daily_records);
        repo.record_aggregate(daily).await;
    }
}

/// Spawns the recorder's background loops: batch-flush ticker (only useful
/// when `recorder` is batched; a harmless no-op flush otherwise) and the
/// hourly/daily aggregator, which wakes every ten minutes and only does
/// aggregation work on the hour boundary for the daily half. Both loops stop
/// on shutdown; the flush loop drains the queue unconditionally first.
pub fn spawn_recorder_tasks(
    recorder: Arc<DeliveryRecorder>,
    flush_interval: std::time::Duration,
    retention: chrono::Duration,
    retention_check_interval: std::time::Duration,
) -> broadcast::Sender<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    {
        let recorder = recorder.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => recorder.flush().await,
                    _ = shutdown_rx.recv() => {
                        recorder.flush().await;
                        break;
                    }
                }
            }
        });
    }

    {
        let repo = recorder.repo();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => run_aggregation_tick(&repo, chrono::Utc::now()).await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    {
        let repo = recorder.repo();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention_check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => repo.apply_retention(retention).await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::model::{ChannelKind, DeliveryOutcome, Level};
    use chrono::Utc;
    use uuid::Uuid;

    fn record(recorded_at: chrono::DateTime<Utc>) -> DeliveryRecord {
        DeliveryRecord {
            id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            channel: ChannelKind::Push,
            level: Level::Info,
            category: "orders".to_string(),
            exchange_id: None,
            device_id: Some("d1".to_string()),
            outcome: DeliveryOutcome::Success,
            delivered: true,
            retry_count: 0,
            sent_at: recorded_at,
            delivered_at: Some(recorded_at),
            latency_ms: 12,
            error_code: None,
            error_message: None,
            recorded_at,
        }
    }

    #[tokio::test]
    async fn retention_drops_old_records_only() {
        let repo = InMemoryTimeSeriesRepo::new();
        let now = Utc::now();
        repo.record(record(now - chrono::Duration::days(40))).await;
        repo.record(record(now)).await;

        repo.apply_retention(chrono::Duration::days(30)).await;

        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn immediate_recorder_writes_straight_through() {
        let repo = Arc::new(InMemoryTimeSeriesRepo::new());
        let recorder = DeliveryRecorder::immediate(repo.clone());

        recorder.record(record(Utc::now())).await;

        assert_eq!(repo.len(), 1);
        assert_eq!(recorder.queued_count(), 0);
    }

    #[tokio::test]
    async fn batched_recorder_queues_until_flushed() {
        let repo = Arc::new(InMemoryTimeSeriesRepo::new());
        let config = BatchConfig {
            size: 3,
            flush_interval_secs: 30,
        };
        let recorder = DeliveryRecorder::batched(repo.clone(), &config);
        let now = Utc::now();

        recorder.record(record(now)).await;
        recorder.record(record(now)).await;
        assert_eq!(repo.len(), 0);
        assert_eq!(recorder.queued_count(), 2);

        recorder.flush().await;
        assert_eq!(repo.len(), 2);
        assert_eq!(recorder.queued_count(), 0);
    }

    #[tokio::test]
    async fn batched_recorder_drops_oldest_on_overflow() {
        let repo = Arc::new(InMemoryTimeSeriesRepo::new());
        let config = BatchConfig {
            size: 2,
            flush_interval_secs: 30,
        };
        let recorder = DeliveryRecorder::batched(repo.clone(), &config);
        let now = Utc::now();

        recorder.record(record(now)).await;
        recorder.record(record(now)).await;
        recorder.record(record(now)).await;

        assert_eq!(recorder.dropped_count(), 1);
        assert_eq!(recorder.queued_count(), 2);
    }

    #[tokio::test]
    async fn flush_writes_everything_queued() {
        let repo = Arc::new(InMemoryTimeSeriesRepo::new());
        let config = BatchConfig {
            size: 100,
            flush_interval_secs: 30,
        };
        let recorder = DeliveryRecorder::batched(repo.clone(), &config);
        let now = Utc::now();
        recorder.record(record(now)).await;
        recorder.record(record(now)).await;

        recorder.flush().await;

        assert_eq!(repo.len(), 2);
        assert_eq!(recorder.queued_count(), 0);
    }

    #[tokio::test]
    async fn aggregation_tick_writes_hourly_rollup() {
        let concrete = Arc::new(InMemoryTimeSeriesRepo::new());
        let now = Utc::now();
        concrete
            .record(record(now - chrono::Duration::minutes(10)))
            .await;
        concrete
            .record(record(now - chrono::Duration::minutes(5)))
            .await;

        let repo: Arc<dyn TimeSeriesRepo> = concrete.clone();
        run_aggregation_tick(&repo, now).await;

        let aggregates = concrete.aggregates();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].total_count, 2);
        assert_eq!(aggregates[0].delivered_count, 2);
    }
}
