use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("distance resolution failed: {0}")]
    Resolution(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(error: rusqlite::Error) -> Self {
        EngineError::Persistence(format!("sqlite: {error}"))
    }
}

impl EngineError {
    pub fn is_persistence(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }

    pub(crate) fn lock_poisoned(what: &str, error: impl std::fmt::Display) -> Self {
        EngineError::Persistence(format!("{what} lock poisoned: {error}"))
    }
}
