// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("already subscribed: {0}")]
    AlreadySubscribed(String),
    #[error("not subscribed: {0}")]
    NotSubscribed(String),
    #[error("event connection lost: {0}")]
    ConnectionLost(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("snapshot load failed: {0}")]
    PersistLoadFailure(String),
    #[error("snapshot save failed: {0}")]
    PersistSaveFailure(String),
    #[error("snapshot parse failed: {0}")]
    RestoreParseFailure(String),
    #[error("invalid import file: {0}")]
    InvalidImportFile(String),
    #[error("unsupported interval: {0} minutes")]
    InvalidInterval(u32),
    #[error("engine stopped")]
    EngineClosed,
}

impl From<reqwest::Error> for FlowError {
    fn from(e: reqwest::Error) -> Self {
        FlowError::Upstream(e.to_string())
    }
}
