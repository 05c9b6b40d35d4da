use std::path::PathBuf;

/// Core error types for nanosession.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid session state: {0}")]
    InvalidState(#[from] InvalidStateError),

    #[error("Failed to serialize session value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Setup-time failures. Never raised while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid generateId: {0}")]
    InvalidGenerateId(String),

    #[error("Invalid cookie option: {0}")]
    InvalidCookie(String),

    #[error("Invalid store config: {0}")]
    InvalidStore(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Failed to (de)serialize session record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidStateError {
    #[error("session {id} has been destroyed")]
    Destroyed { id: String },

    #[error("cookie options of session {id} are fixed once it has been persisted")]
    CookieLocked { id: String },

    #[error("session id {id:?} cannot be carried in a cookie")]
    UnencodableId { id: String },
}

pub type Result<T> = std::result::Result<T, Error>;
