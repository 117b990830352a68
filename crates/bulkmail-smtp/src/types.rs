//! All data types, error handling and configuration for the SMTP crate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::validator::is_valid_email;

// ─── Error ──────────────────────────────────────────────────────────

/// Kinds of errors produced by the sending path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SmtpErrorKind {
    /// Contradictory port / SSL / TLS choice, rejected before any network I/O.
    ConfigConflict,
    /// The reachability probe to host:port failed.
    Unreachable,
    /// A network operation exceeded its time budget.
    Timeout,
    /// The server rejected the credentials.
    AuthError,
    /// Protocol-level failure (bad reply, TLS failure, rejected envelope).
    TransportError,
    /// Local file read/write failure.
    IoFailure,
    /// Structurally invalid input (no recipients, unbuildable message).
    InvalidInput,
    /// A background job was cancelled before it produced a result.
    Cancelled,
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Top-level error type for the SMTP crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpError {
    pub kind: SmtpErrorKind,
    pub message: String,
    /// The SMTP reply code (e.g. 550) if available.
    pub code: Option<u16>,
}

impl SmtpError {
    pub fn new(kind: SmtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigConflict, msg)
    }

    pub fn unreachable(host: &str, port: u16, cause: impl fmt::Display) -> Self {
        Self::new(
            SmtpErrorKind::Unreachable,
            format!("Cannot reach {}:{}: {}", host, port, cause),
        )
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Timeout, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::AuthError, msg)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TransportError, msg)
    }

    pub fn server(code: u16, msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TransportError, msg).with_code(code)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::IoFailure, msg)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidInput, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Cancelled, msg)
    }

    pub fn is_kind(&self, kind: SmtpErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[SMTP {}] {}: {}", code, self.kind, self.message)
        } else {
            write!(f, "[SMTP] {}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for SmtpError {}

impl From<std::io::Error> for SmtpError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

pub type SmtpResult<T> = Result<T, SmtpError>;

// ─── Enums ──────────────────────────────────────────────────────────

/// Resolved transport security for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmtpSecurity {
    /// Plaintext for the whole session.
    None,
    /// Plaintext greeting, upgraded via STARTTLS when advertised.
    StartTls,
    /// Implicit TLS (SMTPS) from the first byte.
    ImplicitTls,
}

impl fmt::Display for SmtpSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "plaintext"),
            Self::StartTls => write!(f, "STARTTLS"),
            Self::ImplicitTls => write!(f, "implicit TLS"),
        }
    }
}

/// Supported authentication mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmtpAuthMethod {
    Plain,
    Login,
    CramMd5,
}

impl fmt::Display for SmtpAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "PLAIN"),
            Self::Login => write!(f, "LOGIN"),
            Self::CramMd5 => write!(f, "CRAM-MD5"),
        }
    }
}

// ─── Configuration ──────────────────────────────────────────────────

/// Default timeout applied to every network operation, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 12;
/// Default timeout of the raw reachability probe, in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// SMTP server configuration.
///
/// Field names on the wire follow the account form of the desktop tool
/// (`server`, `port`, `email`, `password`, `ssl`, `tls`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Hostname or IP of the SMTP server.
    #[serde(rename = "server")]
    pub host: String,
    /// Port (25 / 465 / 587 / 2525).
    pub port: u16,
    /// Implicit TLS. `None` means "derive from the port".
    #[serde(rename = "ssl", default)]
    pub use_ssl: Option<bool>,
    /// STARTTLS. `None` means "derive from the port".
    #[serde(rename = "tls", default)]
    pub use_tls: Option<bool>,
    /// Account address; also used as the `From` of every message.
    #[serde(rename = "email", default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Budget for each connect / handshake / read, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Budget for the raw reachability probe, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Domain to use in EHLO/HELO command.
    #[serde(default = "default_ehlo_domain")]
    pub ehlo_domain: String,
    /// Whether to verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub verify_certificates: bool,
    /// Optional path to a custom CA certificate PEM file.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Forced AUTH mechanism. `None` picks from the EHLO capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<SmtpAuthMethod>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_ehlo_domain() -> String {
    "localhost".into()
}

fn default_true() -> bool {
    true
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            use_ssl: None,
            use_tls: None,
            username: String::new(),
            password: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            ehlo_domain: default_ehlo_domain(),
            verify_certificates: true,
            ca_cert_path: None,
            auth_method: None,
        }
    }
}

impl SmtpConfig {
    /// Configuration for `host:port` with the usual security flags for
    /// well-known submission ports pre-selected.
    pub fn for_port(host: impl Into<String>, port: u16) -> Self {
        let (use_ssl, use_tls) = match port {
            465 => (Some(true), Some(false)),
            587 => (Some(false), Some(true)),
            25 => (Some(false), Some(false)),
            _ => (None, None),
        };
        Self {
            host: host.into(),
            port,
            use_ssl,
            use_tls,
            ..Self::default()
        }
    }

    /// Credentials carried by this configuration.
    pub fn credentials(&self) -> SmtpCredentials {
        SmtpCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
            method: self.auth_method,
        }
    }

    /// Whether both username and password are present.
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("timeout_secs", &self.timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .field("ehlo_domain", &self.ehlo_domain)
            .field("verify_certificates", &self.verify_certificates)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("auth_method", &self.auth_method)
            .finish()
    }
}

/// Credentials for SMTP authentication.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
    /// The auth mechanism to use. `None` picks from the EHLO capabilities.
    pub method: Option<SmtpAuthMethod>,
}

// ─── Email Address ──────────────────────────────────────────────────

/// A syntactically valid email address.
///
/// Only obtainable through [`EmailAddress::parse`], so holding one means the
/// address passed [`is_valid_email`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(input: impl Into<String>) -> SmtpResult<Self> {
        let input = input.into();
        if is_valid_email(&input) {
            Ok(Self(input))
        } else {
            Err(SmtpError::invalid(format!("Invalid email address: {:?}", input)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the domain part.
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = SmtpError;

    fn try_from(value: String) -> SmtpResult<Self> {
        Self::parse(value)
    }
}

impl From<EmailAddress> for String {
    fn from(addr: EmailAddress) -> Self {
        addr.0
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ─── SMTP Reply ─────────────────────────────────────────────────────

/// A parsed SMTP reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpReply {
    /// The 3-digit reply code.
    pub code: u16,
    /// Reply text lines.
    pub lines: Vec<String>,
    /// Whether this is a multi-line reply.
    pub is_multiline: bool,
}

impl SmtpReply {
    /// Whether this is a positive completion (2xx).
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether this is a positive intermediate (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Whether this reply indicates an error.
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// The full reply text.
    pub fn text(&self) -> String {
        self.lines.join("\r\n")
    }

    /// Parse an SMTP reply from raw lines.
    pub fn parse(raw: &str) -> SmtpResult<Self> {
        let mut code: Option<u16> = None;
        let mut lines = Vec::new();
        let mut multiline = false;

        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            let c: u16 = line
                .get(..3)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| SmtpError::transport(format!("Invalid reply code in: {}", line)))?;
            if code.is_none() {
                code = Some(c);
            }
            if line.as_bytes().get(3) == Some(&b'-') {
                multiline = true;
            }
            lines.push(line.get(4..).unwrap_or("").to_string());
        }

        match code {
            Some(c) => Ok(SmtpReply {
                code: c,
                lines,
                is_multiline: multiline,
            }),
            None => Err(SmtpError::transport("Empty SMTP reply")),
        }
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

// ─── EHLO Capabilities ─────────────────────────────────────────────

/// Parsed EHLO capability set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EhloCapabilities {
    /// The server greeting name.
    pub server_name: String,
    /// Maximum message size (SIZE extension).
    pub max_size: Option<u64>,
    /// Supported auth mechanisms.
    pub auth_mechanisms: Vec<String>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
}

impl EhloCapabilities {
    /// Parse EHLO response lines into capabilities.
    pub fn parse(reply: &SmtpReply) -> Self {
        let mut caps = Self::default();
        for (i, line) in reply.lines.iter().enumerate() {
            if i == 0 {
                caps.server_name = line.clone();
                continue;
            }
            let upper = line.to_uppercase();
            let (keyword, param) = upper.split_once(' ').unwrap_or((upper.as_str(), ""));

            match keyword {
                "SIZE" => caps.max_size = param.parse().ok(),
                "AUTH" => {
                    caps.auth_mechanisms =
                        param.split_whitespace().map(|s| s.to_string()).collect();
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
        }
        caps
    }

    /// Check if a specific auth mechanism is supported.
    pub fn supports_auth(&self, method: &str) -> bool {
        let upper = method.to_uppercase();
        self.auth_mechanisms.iter().any(|m| m == &upper)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
