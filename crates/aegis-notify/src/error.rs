//! Construction-time errors local to this crate. Runtime delivery failures
//! use `aegis_common::CoreError` instead -- these are for things that stop
//! the pipeline from being built at all.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("invalid sink configuration: {0}")]
    InvalidSinkConfig(String),

    #[error("unknown channel: {0:?}")]
    UnknownChannel(aegis_common::model::ChannelKind),

    #[error(transparent)]
    Core(#[from] aegis_common::CoreError),
}

pub type Result<T> = std::result::Result<T, NotifyError>;
