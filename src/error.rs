//! Application-level errors for the `bulkmail` shell.

use std::path::PathBuf;

use bulkmail_smtp::SmtpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Smtp(#[from] SmtpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no per-user configuration directory on this platform")]
    NoConfigDir,

    #[error("template {0:?} not found")]
    TemplateNotFound(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

pub type AppResult<T> = Result<T, AppError>;
