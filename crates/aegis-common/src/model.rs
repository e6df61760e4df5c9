//! Shared domain types for the notification pipeline and the exchange
//! resilience orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------
// Notification pipeline (C1-C7)
// ---------------------------------------------------------------------

/// Severity of a notification. Ordering matters: `>=` comparisons against a
/// configured minimum level drive the default routing fallback. Declaration
/// order doubles as wire order: `to_json` encodes `Info=0 .. Critical=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_wire_int(self) -> u8 {
        match self {
            Level::Info => 0,
            Level::Warning => 1,
            Level::Error => 2,
            Level::Critical => 3,
        }
    }

    pub fn from_wire_int(v: u8) -> Option<Self> {
        match v {
            0 => Some(Level::Info),
            1 => Some(Level::Warning),
            2 => Some(Level::Error),
            3 => Some(Level::Critical),
            _ => None,
        }
    }
}

/// Delivery channel. `Sms` and `Slack` are thin specializations of the
/// webhook transport (POST to a channel-specific URL); they carry no
/// protocol of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Push,
    Email,
    Webhook,
    LogSink,
    Sms,
    Slack,
}

/// How often a matched rule's notifications are flushed to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Immediate,
    EveryFiveMinutes,
    EveryFifteenMinutes,
    Hourly,
    DailyDigest,
    Disabled,
}

/// An inbound domain event headed into the pipeline. It is not addressed to
/// any one user -- the dispatcher (C7) evaluates it against every known
/// profile and fans out to whichever users' rules match.
///
/// `id` is assigned once at construction and never reused; `created_at` is
/// assigned at construction and never mutated; `acknowledged` only ever
/// transitions `false -> true` (see `acknowledge`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    pub category: String,
    pub level: Level,
    pub title: String,
    pub body: String,
    pub exchange_id: Option<String>,
    /// Free-form string map: both the template renderer's (C3) substitution
    /// values and the rule evaluator's (C4) keyword-filter search space.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn new(
        category: impl Into<String>,
        level: Level,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: category.into(),
            level,
            title: title.into(),
            body: body.into(),
            exchange_id: None,
            metadata: HashMap::new(),
            acknowledged: false,
            created_at: Utc::now(),
        }
    }

    /// Monotonic: once true, stays true.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    /// Wire encoding per the dispatcher-facing event contract: `level` as
    /// `Info=0..Critical=3`, `timestamp` as milliseconds since the epoch.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "category": self.category,
            "level": self.level.as_wire_int(),
            "title": self.title,
            "body": self.body,
            "exchange_id": self.exchange_id,
            "timestamp": self.created_at.timestamp_millis(),
            "metadata": self.metadata,
            "acknowledged": self.acknowledged,
        })
    }

    /// Tolerant of a missing `metadata` (-> empty map) and `acknowledged`
    /// (-> false), per the external-interfaces contract.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let id = Uuid::parse_str(value.get("id")?.as_str()?).ok()?;
        let level_int = value.get("level")?.as_u64()? as u8;
        let level = Level::from_wire_int(level_int)?;
        let timestamp_ms = value.get("timestamp")?.as_i64()?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)?;
        let metadata = value
            .get("metadata")
            .and_then(|m| m.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let acknowledged = value
            .get("acknowledged")
            .and_then(|a| a.as_bool())
            .unwrap_or(false);

        Some(Self {
            id,
            category: value.get("category")?.as_str()?.to_string(),
            level,
            title: value.get("title")?.as_str()?.to_string(),
            body: value.get("body")?.as_str()?.to_string(),
            exchange_id: value
                .get("exchange_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            metadata,
            acknowledged,
            created_at,
        })
    }
}

/// Push-specific platform a `Device` runs on. Only meaningful for
/// `ChannelKind::Push`; other channels leave this at `Web` by convention
/// (it is not consulted outside the push sink).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlatform {
    Android,
    Ios,
    Web,
}

/// A user's registered delivery device (push token, email address, webhook
/// URL, ...). `id` is unique per user; registering an existing `id` again
/// replaces its `address` rather than creating a second entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub user_id: String,
    pub channel: ChannelKind,
    #[serde(default = "default_device_platform")]
    pub platform: DevicePlatform,
    pub address: String,
    /// Set false by C1 when a sink reports the address/token as dead
    /// (`CoreError::InvalidRecipient`); never re-enabled automatically.
    #[serde(default = "default_true")]
    pub valid: bool,
    pub registered_at: DateTime<Utc>,
}

fn default_device_platform() -> DevicePlatform {
    DevicePlatform::Web
}

fn default_true() -> bool {
    true
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        channel: ChannelKind,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            channel,
            platform: DevicePlatform::Web,
            address: address.into(),
            valid: true,
            registered_at: Utc::now(),
        }
    }
}

/// Per-channel routing rule. Custom rules are evaluated in the user's
/// declared order; among several matches the most specific category wins,
/// ties broken by most-recently-`updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: String,
    pub user_id: String,
    /// A concrete category (e.g. `"risk"`, `"trade"`) or the wildcard
    /// `"all"`.
    pub category: String,
    pub channel: ChannelKind,
    pub min_level: Level,
    pub frequency: Frequency,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_per_hour: Option<u32>,
    /// Minimum spacing, in seconds, between two emissions under this rule,
    /// independent of `max_per_hour`.
    #[serde(default)]
    pub cooldown_secs: u64,
    /// `HH:MM`, may wrap past midnight. `None` means this rule has no
    /// quiet-hours scope of its own (the profile-level window still
    /// applies).
    #[serde(default)]
    pub quiet_hours_start: Option<String>,
    #[serde(default)]
    pub quiet_hours_end: Option<String>,
    /// Weekday numbers (0 = Monday .. 6 = Sunday) this rule is scoped to;
    /// empty means every day.
    #[serde(default)]
    pub quiet_days: Vec<u8>,
    /// Title/body must contain at least one of these (case-insensitive) if
    /// non-empty; empty means no keyword requirement.
    #[serde(default)]
    pub keyword_filters: Vec<String>,
    /// Title/body containing any of these (case-insensitive) drops the
    /// message regardless of every other check passing.
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    /// `message.exchange_id` must be one of these if non-empty; empty means
    /// any exchange (including none).
    #[serde(default)]
    pub exchange_filters: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRule {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    /// Does `category` match this rule, under the "exact beats wildcard"
    /// rule?
    pub fn matches_category(&self, category: &str) -> bool {
        self.category == category || self.category == "all"
    }
}

/// Per-channel notification frequency, keyed by `ChannelKind`. Channels
/// absent from the map behave as `Disabled`.
pub type FrequencyMap = HashMap<ChannelKind, Frequency>;

/// Per-user settings consulted ahead of, and alongside, the rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub global_enabled: bool,
    /// Per-channel master switch; a channel missing from the map is treated
    /// as disabled.
    pub channel_enabled: HashMap<ChannelKind, bool>,
    /// Per-channel default cadence, consulted by the dispatcher's default
    /// fallback when no custom rule matches.
    #[serde(default)]
    pub channel_frequency: FrequencyMap,
    pub devices: Vec<Device>,
    #[serde(default)]
    pub quiet_mode_enabled: bool,
    /// `HH:MM` 24-hour, may wrap past midnight (e.g. `22:00` -> `06:00`).
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub rules: Vec<NotificationRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            email: None,
            phone: None,
            timezone: None,
            global_enabled: true,
            channel_enabled: HashMap::new(),
            channel_frequency: HashMap::new(),
            devices: Vec::new(),
            quiet_mode_enabled: false,
            quiet_hours_start: None,
            quiet_hours_end: None,
            rules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Enables a channel at `Immediate` frequency by default -- a thin
    /// convenience used heavily by tests and the demo binary.
    pub fn enable_channel(&mut self, channel: ChannelKind) {
        self.channel_enabled.insert(channel, true);
    }

    pub fn is_channel_enabled(&self, channel: ChannelKind) -> bool {
        self.channel_enabled.get(&channel).copied().unwrap_or(false)
    }

    pub fn enabled_channels(&self) -> Vec<ChannelKind> {
        self.channel_enabled
            .iter()
            .filter(|(_, &enabled)| enabled)
            .map(|(&channel, _)| channel)
            .collect()
    }
}

/// A queued, not-yet-flushed group of messages for one `(user, channel)`
/// pair awaiting its scheduled send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBatch {
    pub id: Uuid,
    pub user_id: String,
    pub channel: ChannelKind,
    pub messages: Vec<NotificationMessage>,
    pub scheduled_send_time: DateTime<Utc>,
    pub sent: bool,
}

/// Outcome of a single sink dispatch attempt, as returned by a `Sink` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Transient,
    RateLimited,
    Permanent,
    InvalidRecipient,
    Dropped,
}

/// Write-only telemetry record appended by the dispatcher after each
/// attempt sequence settles (success, or retries exhausted).
///
/// Invariant: if `outcome == Success`, `delivered_at >= sent_at` and
/// `latency_ms == (delivered_at - sent_at).num_milliseconds()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: String,
    pub channel: ChannelKind,
    pub level: Level,
    pub category: String,
    pub exchange_id: Option<String>,
    pub device_id: Option<String>,
    pub outcome: DeliveryOutcome,
    pub delivered: bool,
    /// Number of prior failed attempts at the moment of success or final
    /// failure; 0 on a first-try success.
    pub retry_count: u32,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub latency_ms: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Rollup granularity for a `DeliveryAggregate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePeriod {
    Hourly,
    Daily,
}

/// One hourly or daily roll-up over the `DeliveryRecord`s whose
/// `recorded_at` falls in `[window_start, window_end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAggregate {
    pub period: AggregatePeriod,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_count: u64,
    pub delivered_count: u64,
    pub retry_count: u64,
    pub count_by_level: HashMap<Level, u64>,
    pub count_by_channel: HashMap<ChannelKind, u64>,
    pub latency_min_ms: u64,
    pub latency_avg_ms: f64,
    pub latency_max_ms: u64,
}

// ---------------------------------------------------------------------
// Exchange resilience orchestrator (C8-C11)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Closed set of reasons a failover can be triggered. `Failback` is the one
/// addition beyond the distilled spec's literal closed-set list: that spec
/// names it as the alternative to reusing `ManualTrigger` for an automatic
/// failback, and reusing `ManualTrigger` there would misreport an automatic
/// transition as operator-initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    ConnectionTimeout,
    ApiError,
    RateLimitExceeded,
    ManualTrigger,
    HealthCheckFailed,
    HighLatency,
    Failback,
}

/// Live health snapshot for one registered exchange adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeHealth {
    pub exchange_id: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub last_check: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error_message: Option<String>,
    pub priority: u32,
}

impl ExchangeHealth {
    pub fn new(exchange_id: impl Into<String>, priority: u32) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            status: HealthStatus::Unknown,
            latency_ms: 0,
            error_rate: 0.0,
            last_check: Utc::now(),
            last_success: None,
            consecutive_failures: 0,
            last_error_message: None,
            priority,
        }
    }

    /// Mirrors the original's `is_available()`: usable as a failover
    /// candidate unless flatly unhealthy or never yet checked.
    pub fn is_available(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Public state of a circuit breaker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_json_round_trips() {
        let mut message = NotificationMessage::new("risk", Level::Critical, "Margin call", "body");
        message.exchange_id = Some("binance".to_string());
        message.metadata.insert("order_id".to_string(), "42".to_string());
        message.acknowledge();

        let json = message.to_json();
        let decoded = NotificationMessage::from_json(&json).unwrap();

        assert_eq!(decoded.id, message.id);
        assert_eq!(decoded.category, message.category);
        assert_eq!(decoded.level, message.level);
        assert_eq!(decoded.title, message.title);
        assert_eq!(decoded.body, message.body);
        assert_eq!(decoded.exchange_id, message.exchange_id);
        assert_eq!(decoded.metadata, message.metadata);
        assert_eq!(decoded.acknowledged, message.acknowledged);
        assert_eq!(
            decoded.created_at.timestamp_millis(),
            message.created_at.timestamp_millis()
        );
    }

    #[test]
    fn from_json_tolerates_missing_metadata_and_acknowledged() {
        let message = NotificationMessage::new("risk", Level::Warning, "t", "b");
        let mut json = message.to_json();
        json.as_object_mut().unwrap().remove("metadata");
        json.as_object_mut().unwrap().remove("acknowledged");

        let decoded = NotificationMessage::from_json(&json).unwrap();
        assert!(decoded.metadata.is_empty());
        assert!(!decoded.acknowledged);
    }

    #[test]
    fn level_wire_ints_are_info_zero_through_critical_three() {
        assert_eq!(Level::Info.as_wire_int(), 0);
        assert_eq!(Level::Warning.as_wire_int(), 1);
        assert_eq!(Level::Error.as_wire_int(), 2);
        assert_eq!(Level::Critical.as_wire_int(), 3);
        for level in [Level::Info, Level::Warning, Level::Error, Level::Critical] {
            assert_eq!(Level::from_wire_int(level.as_wire_int()), Some(level));
        }
    }
}
