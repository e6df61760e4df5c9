//! Notification pipeline: ingest domain events, evaluate per-user routing
//! rules, throttle/quiet-hours gate, batch or dispatch to sinks, record
//! delivery telemetry.

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod recorder;
pub mod resilience_bridge;
pub mod rule_evaluator;
pub mod sink;
pub mod template;
pub mod throttle;
pub mod user_repo;

pub use dispatcher::{spawn_background_tasks, DispatcherConfig, NotificationDispatcher};
pub use error::{NotifyError, Result};
pub use recorder::{spawn_recorder_tasks, DeliveryRecorder, TimeSeriesRepo};
pub use resilience_bridge::spawn_resilience_bridge;
