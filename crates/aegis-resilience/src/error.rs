use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("exchange {0} is already registered")]
    AlreadyRegistered(String),

    #[error("exchange {0} is not registered")]
    NotRegistered(String),

    #[error(transparent)]
    Core(#[from] aegis_common::CoreError),
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
