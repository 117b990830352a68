//! The bulk-send loop.
//!
//! Recipients are processed strictly in order, one session per attempt.
//! Between recipients the loop sleeps for a random delay; a failed
//! recipient gets one retry after a shorter random delay. Per-recipient
//! failures only show up in the returned log.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::build_message;
use crate::send_log::{LogEntry, SendOutcome};
use crate::transport::MailTransport;
use crate::types::*;

// ─── Cancellation ───────────────────────────────────────────────────

/// Shared stop request, checked between steps of the loop.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── Events ─────────────────────────────────────────────────────────

/// Progress notifications emitted while a bulk send runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkSendEvent {
    /// `completed` of `total` recipients have had their first attempt.
    Progress {
        completed: usize,
        total: usize,
        percent: u8,
    },
    /// A log entry was appended.
    Log(LogEntry),
}

pub type EventSender = mpsc::UnboundedSender<BulkSendEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BulkSendEvent>;

fn emit(events: Option<&EventSender>, event: BulkSendEvent) {
    if let Some(tx) = events {
        // A dropped receiver only means nobody is watching.
        let _ = tx.send(event);
    }
}

// ─── Options ────────────────────────────────────────────────────────

/// Longest pause accepted for either delay range, in seconds.
pub const MAX_DELAY_SECS: f64 = 3600.0;

/// Throttling and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSendOptions {
    /// Seconds to wait between recipients, sampled uniformly.
    pub delay_range: (f64, f64),
    /// Seconds to wait before the retry, sampled uniformly.
    pub retry_delay_range: (f64, f64),
    /// Retry a failed recipient once.
    pub retry_failed: bool,
}

impl Default for BulkSendOptions {
    fn default() -> Self {
        Self {
            delay_range: (2.0, 5.0),
            retry_delay_range: (1.0, 3.0),
            retry_failed: true,
        }
    }
}

impl BulkSendOptions {
    /// Reject negative, non-finite, inverted or over-long ranges.
    pub fn validate(&self) -> SmtpResult<()> {
        for (name, (lo, hi)) in [
            ("delay_range", self.delay_range),
            ("retry_delay_range", self.retry_delay_range),
        ] {
            if !lo.is_finite()
                || !hi.is_finite()
                || lo < 0.0
                || lo > hi
                || hi > MAX_DELAY_SECS
            {
                return Err(SmtpError::invalid(format!(
                    "{} must satisfy 0 <= min <= max <= {}, got ({}, {})",
                    name, MAX_DELAY_SECS, lo, hi
                )));
            }
        }
        Ok(())
    }
}

fn sample_delay((lo, hi): (f64, f64)) -> Duration {
    let secs = if hi > lo {
        rand::thread_rng().gen_range(lo..=hi)
    } else {
        lo
    };
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS))
        .unwrap_or(Duration::ZERO)
}

// ─── Bulk send ──────────────────────────────────────────────────────

/// Send the same message to every recipient and return the send log.
///
/// Fails only for structural problems: an empty recipient list, invalid
/// options, or a message that cannot be built (invalid sender). A set
/// cancel flag stops the loop at the next check and the log so far is
/// returned.
#[allow(clippy::too_many_arguments)]
pub async fn bulk_send(
    transport: &dyn MailTransport,
    config: &SmtpConfig,
    recipients: &[EmailAddress],
    subject: &str,
    body: &str,
    attachments: &[PathBuf],
    options: &BulkSendOptions,
    cancel: &CancelFlag,
    events: Option<&EventSender>,
) -> SmtpResult<Vec<LogEntry>> {
    if recipients.is_empty() {
        return Err(SmtpError::invalid("Recipient list is empty"));
    }
    options.validate()?;

    let total = recipients.len();
    let mut log = Vec::with_capacity(total + total / 4);
    info!("[bulk-send] starting: {} recipient(s) via {}:{}", total, config.host, config.port);

    for (i, recipient) in recipients.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("[bulk-send] cancelled before {} ({}/{})", recipient, i + 1, total);
            break;
        }

        let message = build_message(config, recipient, subject, body, attachments).await?;

        let outcome = match transport.deliver(config, &message).await {
            Ok(()) => {
                debug!("[bulk-send] sent to {}", recipient);
                SendOutcome::Sent
            }
            Err(e) => {
                warn!("[bulk-send] failed for {}: {}", recipient, e);
                SendOutcome::Failed(e.to_string())
            }
        };
        let failed = !outcome.is_success();
        push(&mut log, events, LogEntry::now(recipient.clone(), outcome));

        let completed = i + 1;
        emit(
            events,
            BulkSendEvent::Progress {
                completed,
                total,
                percent: (completed * 100 / total) as u8,
            },
        );

        if completed < total {
            if cancel.is_cancelled() {
                info!("[bulk-send] cancelled after {} ({}/{})", recipient, completed, total);
                break;
            }
            tokio::time::sleep(sample_delay(options.delay_range)).await;
        }

        if failed && options.retry_failed {
            if cancel.is_cancelled() {
                info!("[bulk-send] cancelled before retrying {}", recipient);
                break;
            }
            tokio::time::sleep(sample_delay(options.retry_delay_range)).await;
            let outcome = match transport.deliver(config, &message).await {
                Ok(()) => {
                    info!("[bulk-send] retry succeeded for {}", recipient);
                    SendOutcome::SentRetry
                }
                Err(e) => {
                    warn!("[bulk-send] retry failed for {}: {}", recipient, e);
                    SendOutcome::FailedRetry(e.to_string())
                }
            };
            push(&mut log, events, LogEntry::now(recipient.clone(), outcome));
        }
    }

    info!("[bulk-send] finished with {} log entries", log.len());
    Ok(log)
}

fn push(log: &mut Vec<LogEntry>, events: Option<&EventSender>, entry: LogEntry) {
    emit(events, BulkSendEvent::Log(entry.clone()));
    log.push(entry);
}

// ─── Tests ──────────────────────────────────────────────────────────
