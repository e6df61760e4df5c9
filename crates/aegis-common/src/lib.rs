//! Shared types, error taxonomy, configuration, logging and the
//! cross-engine event bus used by `aegis-notify` and `aegis-resilience`.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;

pub use error::{CoreError, Result};
pub use events::{EventBus, ResilienceEvent};
