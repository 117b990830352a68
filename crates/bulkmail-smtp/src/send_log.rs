//! Per-recipient send log and its CSV export.

use std::fmt;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};

use crate::types::*;

/// Local-time format of [`LogEntry::timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Header row of the exported CSV.
pub const CSV_HEADER: [&str; 3] = ["timestamp", "recipient", "status"];

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason")]
pub enum SendOutcome {
    Sent,
    SentRetry,
    Failed(String),
    FailedRetry(String),
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent | Self::SentRetry)
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::SentRetry | Self::FailedRetry(_))
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "Sent"),
            Self::SentRetry => write!(f, "Sent (Retry)"),
            Self::Failed(reason) => write!(f, "Failed: {}", reason),
            Self::FailedRetry(reason) => write!(f, "Failed (Retry): {}", reason),
        }
    }
}

/// One line of the send log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub recipient: EmailAddress,
    pub outcome: SendOutcome,
}

impl LogEntry {
    /// Entry stamped with the current local time.
    pub fn now(recipient: EmailAddress, outcome: SendOutcome) -> Self {
        Self {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            recipient,
            outcome,
        }
    }

    /// Human-readable status column.
    pub fn status(&self) -> String {
        self.outcome.to_string()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.timestamp, self.recipient, self.outcome)
    }
}

/// Totals over a finished log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSummary {
    pub attempts: usize,
    pub sent: usize,
    pub failed: usize,
    pub retries: usize,
}

impl SendSummary {
    pub fn from_entries(entries: &[LogEntry]) -> Self {
        entries.iter().fold(Self::default(), |mut s, e| {
            s.attempts += 1;
            if e.outcome.is_success() {
                s.sent += 1;
            } else {
                s.failed += 1;
            }
            if e.outcome.is_retry() {
                s.retries += 1;
            }
            s
        })
    }
}

// ─── CSV export ─────────────────────────────────────────────────────

/// Write `entries` as CSV (`timestamp,recipient,status`) to `writer`.
pub fn write_logs_csv<W: Write>(entries: &[LogEntry], writer: W) -> SmtpResult<()> {
    let mut out = csv::Writer::from_writer(writer);
    out.write_record(CSV_HEADER).map_err(csv_error)?;
    for e in entries {
        out.write_record([e.timestamp.as_str(), e.recipient.as_str(), e.status().as_str()])
            .map_err(csv_error)?;
    }
    out.flush()?;
    Ok(())
}

/// Export `entries` to a CSV file at `path`, replacing any existing file.
pub fn export_logs_csv(entries: &[LogEntry], path: impl AsRef<Path>) -> SmtpResult<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path)
        .map_err(|e| SmtpError::io(format!("Cannot create {}: {}", path.display(), e)))?;
    write_logs_csv(entries, file)?;
    info!("[send-log] exported {} entries to {}", entries.len(), path.display());
    Ok(())
}

fn csv_error(e: csv::Error) -> SmtpError {
    SmtpError::io(format!("CSV write failed: {}", e))
}

// ─── Tests ──────────────────────────────────────────────────────────
