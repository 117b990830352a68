//! MIME message builder.
//!
//! Builds one [`Message`] per recipient and renders it into an RFC 5322 /
//! MIME string suitable for the SMTP DATA command.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Local};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::types::*;

/// Plain-text part sent alongside every HTML body.
pub const PLAIN_FALLBACK: &str = "This is an HTML email. Please view in HTML capable client.";

/// Content type given to every file attachment.
pub const ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

// ─── Types ──────────────────────────────────────────────────────────

/// A file attachment, already base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Base name of the source file.
    pub filename: String,
    pub content_type: String,
    pub data_base64: String,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, data: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            content_type: ATTACHMENT_CONTENT_TYPE.into(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }
}

/// A single-recipient HTML message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub date: DateTime<Local>,
    pub from: EmailAddress,
    pub to: EmailAddress,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    pub attachments: Vec<Attachment>,
}

// ─── Building ───────────────────────────────────────────────────────

/// Build the message for one recipient.
///
/// The account username is the `From` address and must be valid, and the
/// subject must fit on one header line. Attachment
/// paths that do not exist are skipped; files that exist but cannot be read
/// are skipped with a warning.
pub async fn build_message(
    config: &SmtpConfig,
    recipient: &EmailAddress,
    subject: &str,
    body: &str,
    attachments: &[PathBuf],
) -> SmtpResult<Message> {
    let from = EmailAddress::parse(config.username.as_str()).map_err(|_| {
        SmtpError::invalid(format!(
            "Sender address {:?} is not a valid email address",
            config.username
        ))
    })?;
    check_subject(subject)?;

    let mut parts = Vec::with_capacity(attachments.len());
    for path in attachments {
        if let Some(att) = load_attachment(path).await {
            parts.push(att);
        }
    }

    Ok(Message {
        id: format!("{}@{}", uuid::Uuid::new_v4().simple(), from.domain()),
        date: Local::now(),
        from,
        to: recipient.clone(),
        subject: subject.to_string(),
        html_body: body.to_string(),
        text_body: PLAIN_FALLBACK.to_string(),
        attachments: parts,
    })
}

/// Reject a subject containing CR or LF.
pub fn check_subject(subject: &str) -> SmtpResult<()> {
    if subject.contains(['\r', '\n']) {
        return Err(SmtpError::invalid(format!(
            "Subject {:?} must not contain line breaks",
            subject
        )));
    }
    Ok(())
}

async fn load_attachment(path: &Path) -> Option<Attachment> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            debug!("[message] attachment {} is not a file, skipping", path.display());
            return None;
        }
        Err(_) => {
            debug!("[message] attachment {} not found, skipping", path.display());
            return None;
        }
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".into());

    match tokio::fs::read(path).await {
        Ok(data) => Some(Attachment::new(filename, &data)),
        Err(e) => {
            warn!("[message] cannot read attachment {}: {}", path.display(), e);
            None
        }
    }
}

// ─── Rendering ──────────────────────────────────────────────────────

/// Render the message as the DATA payload.
///
/// Without attachments the top level is `multipart/alternative`; with
/// attachments it is `multipart/mixed` wrapping the alternative part.
pub fn render_message(msg: &Message) -> String {
    let mut out = String::with_capacity(msg.html_body.len() * 2 + 1024);
    let boundary_mixed = format!("----=_Part_{}", uuid::Uuid::new_v4().simple());
    let boundary_alt = format!("----=_Alt_{}", uuid::Uuid::new_v4().simple());

    write_header(&mut out, "Message-ID", &format!("<{}>", msg.id));
    write_header(&mut out, "Date", &msg.date.to_rfc2822());
    write_header(&mut out, "From", msg.from.as_str());
    write_header(&mut out, "To", msg.to.as_str());
    write_header(&mut out, "Subject", &encode_header_value(&msg.subject));
    write_header(&mut out, "MIME-Version", "1.0");

    if msg.attachments.is_empty() {
        write_alternative(&mut out, msg, &boundary_alt);
        return out;
    }

    write_header(
        &mut out,
        "Content-Type",
        &format!("multipart/mixed; boundary=\"{}\"", boundary_mixed),
    );
    out.push_str("\r\n");
    out.push_str("This is a multi-part message in MIME format.\r\n");
    out.push_str(&format!("\r\n--{}\r\n", boundary_mixed));
    write_alternative(&mut out, msg, &boundary_alt);
    for att in &msg.attachments {
        out.push_str(&format!("\r\n--{}\r\n", boundary_mixed));
        write_attachment(&mut out, att);
    }
    out.push_str(&format!("\r\n--{}--\r\n", boundary_mixed));
    out
}

fn write_alternative(out: &mut String, msg: &Message, boundary: &str) {
    write_header(
        out,
        "Content-Type",
        &format!("multipart/alternative; boundary=\"{}\"", boundary),
    );
    out.push_str("\r\n");
    write_text_part(out, "text/plain", &msg.text_body, boundary);
    write_text_part(out, "text/html", &msg.html_body, boundary);
    out.push_str(&format!("\r\n--{}--\r\n", boundary));
}

fn write_text_part(out: &mut String, content_type: &str, body: &str, boundary: &str) {
    out.push_str(&format!("\r\n--{}\r\n", boundary));
    write_header(
        out,
        "Content-Type",
        &format!("{}; charset=\"utf-8\"", content_type),
    );
    write_header(out, "Content-Transfer-Encoding", "quoted-printable");
    out.push_str("\r\n");
    out.push_str(&quoted_printable::encode_to_str(body.as_bytes()));
    out.push_str("\r\n");
}

fn write_attachment(out: &mut String, att: &Attachment) {
    write_header(
        out,
        "Content-Type",
        &format!("{}; name={}", att.content_type, quote_param(&att.filename)),
    );
    write_header(
        out,
        "Content-Disposition",
        &format!("attachment; filename={}", quote_param(&att.filename)),
    );
    write_header(out, "Content-Transfer-Encoding", "base64");
    out.push_str("\r\n");
    // Wrap base64 at 76 chars per line
    for chunk in att.data_base64.as_bytes().chunks(76) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        out.push_str("\r\n");
    }
}

// ── Header helpers ──────────────────────────────────────────────────

fn write_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// RFC 2047 encode a header value if it contains non-ASCII characters.
///
/// CR and LF are replaced by spaces so the value stays on its header line.
pub fn encode_header_value(value: &str) -> String {
    let value = value.replace(['\r', '\n'], " ");
    if value.is_ascii() {
        return value;
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());
    format!("=?UTF-8?B?{}?=", encoded)
}

/// RFC 2045 quoted-string for a parameter value. Control characters become `_`.
fn quote_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push('_'),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// ── HTML snippets ───────────────────────────────────────────────────

/// `<img>` snippet pointing at a local image, for pasting into a body.
///
/// Returns an empty string when `path` does not exist.
pub fn inline_image_tag(path: impl AsRef<Path>, width: u32) -> String {
    match std::fs::canonicalize(path.as_ref()) {
        Ok(abs) => format!(
            "<img src=\"file://{}\" width=\"{}\"><br>",
            abs.display(),
            width
        ),
        Err(_) => String::new(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
