//! Shared error taxonomy for the notification and resilience core.

use thiserror::Error;

/// Cross-cutting error taxonomy. Most of these are never returned to a
/// caller directly -- the dispatcher and executor record them as counters
/// and structured log events (see `CoreError` variants' doc comments for
/// which ones are user-visible vs. internal-only).
#[derive(Error, Debug)]
pub enum CoreError {
    /// Surfaced at startup; fatal.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Recorder/user-repo I/O failure; local retry then drop-with-counter.
    #[error("transient repository error: {0}")]
    RepoTransient(String),

    /// Schema/authz failure; logged once per interval, counter incremented.
    #[error("permanent repository error: {0}")]
    RepoPermanent(String),

    /// Sink reported a retryable failure.
    #[error("transient sink error: {0}")]
    SinkTransient(String),

    /// Sink asked the caller to back off.
    #[error("sink rate limited: {0}")]
    SinkRateLimited(String),

    /// Sink reported a terminal failure; no retry.
    #[error("permanent sink error: {0}")]
    SinkPermanent(String),

    /// Push-specific terminal failure: the recipient token/address is dead.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Not really an error: a first-class observable drop outcome.
    #[error("rule evaluation dropped message: {0}")]
    RuleEvalDrop(String),

    /// Handled inside the health prober; never propagated.
    #[error("exchange probe failed: {0}")]
    ExchangeProbeFail(String),

    /// Returned as the executor's `default_return` path; failover callback
    /// fires separately.
    #[error("no available exchange")]
    NoAvailableExchange,

    /// Circuit is open; short-circuited before any adapter was tried.
    #[error("circuit open")]
    CircuitOpen,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
