use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EnviroError {
    #[error("no cached data for {0}")]
    CacheMiss(String),

    #[error("write already in progress for cache key {0}")]
    WriteConflict(String),

    #[error("upstream request failed: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("coordinate outside of domain: {0}")]
    OutOfDomain(String),

    #[error("invalid configuration: {0}")]
    #[diagnostic(help("check the service definitions in envirocode.json"))]
    InvalidConfiguration(String),

    #[error("duplicate service label: {0}")]
    DuplicateService(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("missing config file envirocode.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("cache database error: {0}")]
    Database(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

impl EnviroError {
    /// Configuration-time errors refuse engine start; everything else is
    /// degraded to a marker at the service boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnviroError::InvalidConfiguration(_)
                | EnviroError::DuplicateService(_)
                | EnviroError::MissingConfig
                | EnviroError::ConfigRead(_)
                | EnviroError::ConfigParse(_)
        )
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            EnviroError::UpstreamUnavailable(_) | EnviroError::UpstreamStatus { .. }
        )
    }
}

impl From<rusqlite::Error> for EnviroError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                EnviroError::WriteConflict(err.to_string())
            }
            _ => EnviroError::Database(err.to_string()),
        }
    }
}
