//! Bridge error types

use embodied_client::ClientError;
use embodied_config::ConfigError;
use thiserror::Error;

/// Rejection of an action request before anything was executed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("invalid action request: {0}")]
    Configuration(String),

    #[error("autonomy is paused")]
    Paused,
}

/// The host command executor failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// Writing the pause flag to durable configuration failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to persist autonomy flag: {0}")]
pub struct PersistError(pub String);

/// Setting up an entry failed
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("entry {0} is already set up")]
    AlreadySetUp(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
