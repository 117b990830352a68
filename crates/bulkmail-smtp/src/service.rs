//! Background runner for bulk sends and validation probes.
//!
//! Each bulk send runs on its own tokio task and is tracked by id until it
//! finishes. Callers get a [`BulkSendJob`] to watch events, cancel, and
//! collect the log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::message::check_subject;
use crate::send_log::LogEntry;
use crate::sender::{bulk_send, BulkSendOptions, CancelFlag, EventReceiver, EventSender};
use crate::transport::{MailTransport, SmtpTransport, ValidationOutcome};
use crate::types::*;

/// Shared service handle.
pub type BulkMailServiceState = Arc<BulkMailService>;

/// Everything a bulk send needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSendRequest {
    pub config: SmtpConfig,
    pub recipients: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
    #[serde(default)]
    pub options: BulkSendOptions,
    /// Probe the configuration first and abort when it fails.
    #[serde(default)]
    pub validate_first: bool,
}

impl BulkSendRequest {
    /// Reject requests that could never send anything.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.recipients.is_empty() {
            return Err(SmtpError::invalid("Recipient list is empty"));
        }
        EmailAddress::parse(self.config.username.as_str()).map_err(|_| {
            SmtpError::invalid(format!(
                "Sender address {:?} is not a valid email address",
                self.config.username
            ))
        })?;
        check_subject(&self.subject)?;
        self.options.validate()
    }
}

/// A running bulk send.
pub struct BulkSendJob {
    pub id: String,
    pub cancel: CancelFlag,
    /// Closed once the job finishes.
    pub events: EventReceiver,
    handle: JoinHandle<SmtpResult<Vec<LogEntry>>>,
}

impl BulkSendJob {
    /// Wait for the job and return its log.
    pub async fn wait(self) -> SmtpResult<Vec<LogEntry>> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SmtpError::cancelled(format!(
                "Bulk send {} was aborted",
                self.id
            ))),
            Err(e) => Err(SmtpError::transport(format!(
                "Bulk send {} failed: {}",
                self.id, e
            ))),
        }
    }
}

/// Runs bulk sends and validation probes in the background.
pub struct BulkMailService {
    transport: Arc<dyn MailTransport>,
    jobs: RwLock<HashMap<String, CancelFlag>>,
}

impl BulkMailService {
    /// Service delivering over real SMTP sessions.
    pub fn new() -> BulkMailServiceState {
        Self::with_transport(Arc::new(SmtpTransport))
    }

    pub fn with_transport(transport: Arc<dyn MailTransport>) -> BulkMailServiceState {
        Arc::new(Self {
            transport,
            jobs: RwLock::new(HashMap::new()),
        })
    }

    // ── Bulk send ───────────────────────────────────────────────────

    /// Check `request` and start sending on a new task.
    pub async fn start_bulk_send(
        self: &Arc<Self>,
        request: BulkSendRequest,
    ) -> SmtpResult<BulkSendJob> {
        request.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelFlag::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.jobs.write().await.insert(id.clone(), cancel.clone());

        let service = Arc::clone(self);
        let job_id = id.clone();
        let job_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = service.run_job(&request, &job_cancel, &tx).await;
            service.jobs.write().await.remove(&job_id);
            match &result {
                Ok(log) => info!("[bulk-service] job {} done, {} entries", job_id, log.len()),
                Err(e) => warn!("[bulk-service] job {} aborted: {}", job_id, e),
            }
            result
        });

        info!("[bulk-service] job {} started", id);
        Ok(BulkSendJob {
            id,
            cancel,
            events: rx,
            handle,
        })
    }

    async fn run_job(
        &self,
        request: &BulkSendRequest,
        cancel: &CancelFlag,
        events: &EventSender,
    ) -> SmtpResult<Vec<LogEntry>> {
        if request.validate_first {
            if let Some(err) = self.transport.validate(&request.config).await.into_error() {
                return Err(err);
            }
        }
        bulk_send(
            self.transport.as_ref(),
            &request.config,
            &request.recipients,
            &request.subject,
            &request.body,
            &request.attachments,
            &request.options,
            cancel,
            Some(events),
        )
        .await
    }

    /// Ask a running job to stop. Returns `false` for unknown ids.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.jobs.read().await.get(job_id) {
            Some(flag) => {
                flag.cancel();
                info!("[bulk-service] cancel requested for {}", job_id);
                true
            }
            None => false,
        }
    }

    /// Ids of jobs that have not finished yet.
    pub async fn active_jobs(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Probe `config` on a separate task.
    pub async fn validate(&self, config: SmtpConfig) -> ValidationOutcome {
        let transport = Arc::clone(&self.transport);
        match tokio::spawn(async move { transport.validate(&config).await }).await {
            Ok(outcome) => outcome,
            Err(e) => ValidationOutcome::failed(&SmtpError::cancelled(format!(
                "Validation task failed: {}",
                e
            ))),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
