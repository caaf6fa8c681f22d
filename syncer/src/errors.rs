use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a [`ReadingSource`](crate::source::ReadingSource).
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transient: network trouble, 5xx, rate limiting. Retried by the engine.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// Credentials rejected. No further work can succeed this run.
    #[error("source authentication failed: {0}")]
    AuthFailed(String),

    /// The source answered with something we cannot decode.
    #[error("source protocol error: {0}")]
    Protocol(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to write state file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read state file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single reading was rejected. Never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("reading has no timestamp")]
    MissingTimestamp,

    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),

    #[error("reading carries no metric values")]
    NoValues,

    #[error("metric {metric} has non-finite value {value}")]
    NonFinite { metric: String, value: f64 },

    #[error("device ID cannot be empty")]
    EmptyDeviceId,

    #[error("reading belongs to device {found}, expected {expected}")]
    DeviceMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Whether this error must abort the whole run with a non-zero exit.
    ///
    /// Per-device failures (sink writes, exhausted source retries) are handled below the
    /// run level and are not fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Source(SourceError::AuthFailed(_)) => true,
            Error::Source(_) => false,
            Error::Sink(_) => false,
            Error::State(_) => true,
            Error::Config(_) => true,
            Error::Database(_) => true,
            Error::Migration(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Source(SourceError::AuthFailed("bad token".into())).is_fatal());
        assert!(Error::State(StateError::Corrupt {
            path: PathBuf::from("state.json"),
            reason: "eof".into(),
        })
        .is_fatal());
        assert!(!Error::Source(SourceError::Unavailable("503".into())).is_fatal());
        assert!(!Error::Sink(SinkError::WriteFailed("timeout".into())).is_fatal());
    }

    #[test]
    fn test_retryable_source_errors() {
        assert!(SourceError::Unavailable("reset".into()).is_retryable());
        assert!(!SourceError::AuthFailed("401".into()).is_retryable());
        assert!(!SourceError::Protocol("bad json".into()).is_retryable());
    }
}
