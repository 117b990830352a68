//! **bulkmail-smtp** — bulk HTML email sending over a single SMTP account.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Error type, SMTP configuration, addresses, replies, capabilities |
//! | [`validator`] | Syntactic email-address check |
//! | [`recipients`] | Recipient list import from text and CSV files |
//! | [`message`] | Per-recipient MIME message (HTML + plain fallback + attachments) |
//! | [`client`] | Low-level SMTP protocol engine (EHLO, STARTTLS, DATA) |
//! | [`auth`] | SMTP authentication mechanisms (PLAIN, LOGIN, CRAM-MD5) |
//! | [`transport`] | Session setup, validation probe, `MailTransport` seam |
//! | [`sender`] | Throttled, retry-once bulk-send loop |
//! | [`send_log`] | Send log entries and CSV export |
//! | [`templates`] | JSON template store |
//! | [`service`] | Background job runner with cancellation and events |

pub mod types;
pub mod validator;
pub mod recipients;
pub mod message;
pub mod client;
pub mod auth;
pub mod transport;
pub mod sender;
pub mod send_log;
pub mod templates;
pub mod service;

pub use message::{build_message, inline_image_tag, render_message, Attachment, Message};
pub use recipients::{clean_recipient_list, count_recipients_in_file, load_recipients};
pub use send_log::{export_logs_csv, LogEntry, SendOutcome, SendSummary};
pub use sender::{bulk_send, BulkSendEvent, BulkSendOptions, CancelFlag};
pub use service::{BulkMailService, BulkSendJob, BulkSendRequest};
pub use templates::{Template, TemplateStore};
pub use transport::{MailTransport, SmtpTransport, ValidationOutcome};
pub use types::{EmailAddress, SmtpConfig, SmtpError, SmtpErrorKind, SmtpResult};
pub use validator::is_valid_email;
