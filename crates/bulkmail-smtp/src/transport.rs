//! Session establishment and delivery.
//!
//! Turns an [`SmtpConfig`] into an authenticated [`SmtpClient`]: resolves the
//! security mode, rejects contradictory settings, probes reachability, opens
//! the session and logs in. [`MailTransport`] is the seam the bulk sender
//! delivers through.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::auth;
use crate::client::SmtpClient;
use crate::message::{render_message, Message};
use crate::types::*;

pub const VALIDATION_OK: &str = "SMTP configuration is valid";

// ─── Security resolution ────────────────────────────────────────────

/// Derive the session security from the port and the explicit flags.
///
/// Unset flags follow the port: 465 means implicit TLS, 25 means
/// plaintext, anything else means STARTTLS. Port 465 without SSL and
/// port 587 with SSL are rejected.
pub fn resolve_security(config: &SmtpConfig) -> SmtpResult<SmtpSecurity> {
    let port = config.port;
    let use_ssl = config.use_ssl.unwrap_or(port == 465);
    let use_tls = config.use_tls.unwrap_or(port != 465 && port != 25);

    if port == 465 && !use_ssl {
        return Err(SmtpError::conflict(
            "Port 465 requires SSL; enable SSL or use port 587 with TLS",
        ));
    }
    if port == 587 && use_ssl {
        return Err(SmtpError::conflict(
            "Port 587 uses STARTTLS, not SSL; disable SSL or use port 465",
        ));
    }

    Ok(if use_ssl {
        SmtpSecurity::ImplicitTls
    } else if use_tls {
        SmtpSecurity::StartTls
    } else {
        SmtpSecurity::None
    })
}

// ─── Connection ─────────────────────────────────────────────────────

/// Raw TCP reachability check, bounded by `probe_timeout_secs`.
pub async fn probe(config: &SmtpConfig) -> SmtpResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let budget = Duration::from_secs(config.probe_timeout_secs);
    match tokio::time::timeout(budget, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(SmtpError::unreachable(&config.host, config.port, e)),
        Err(_) => Err(SmtpError::unreachable(
            &config.host,
            config.port,
            format!("no answer within {}s", config.probe_timeout_secs),
        )),
    }
}

/// Open a session ready for authentication.
///
/// Conflicting settings are rejected before any socket is opened. On any
/// failure after the socket is open the session is closed before returning.
pub async fn connect(config: &SmtpConfig) -> SmtpResult<SmtpClient> {
    let security = resolve_security(config)?;
    probe(config).await?;

    let mut client = SmtpClient::new(config.clone());
    match establish(&mut client, security).await {
        Ok(()) => Ok(client),
        Err(e) => {
            client.close().await;
            Err(e)
        }
    }
}

async fn establish(client: &mut SmtpClient, security: SmtpSecurity) -> SmtpResult<()> {
    client.connect(security).await?;
    let caps = client.ehlo().await?;

    if security == SmtpSecurity::StartTls {
        if caps.starttls {
            client.starttls().await?;
        } else {
            warn!(
                "[transport] {} does not advertise STARTTLS, continuing in plaintext",
                client.config().host
            );
        }
    }
    Ok(())
}

/// Log in when both username and password are set.
pub async fn authenticate(
    client: &mut SmtpClient,
    username: &str,
    password: &str,
) -> SmtpResult<()> {
    let creds = SmtpCredentials {
        username: username.to_string(),
        password: password.to_string(),
        method: client.config().auth_method,
    };
    auth::authenticate(client, &creds).await
}

async fn open_authenticated(config: &SmtpConfig) -> SmtpResult<SmtpClient> {
    let mut client = connect(config).await?;
    if !config.has_credentials() {
        debug!("[transport] no credentials for {}, sending unauthenticated", config.host);
        return Ok(client);
    }
    if let Err(e) = auth::authenticate(&mut client, &config.credentials()).await {
        client.close().await;
        return Err(e);
    }
    Ok(client)
}

// ─── Validation ─────────────────────────────────────────────────────

/// Result of a configuration probe, ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub message: String,
    /// Kind of the error that made validation fail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SmtpErrorKind>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: VALIDATION_OK.into(),
            kind: None,
        }
    }

    pub fn failed(err: &SmtpError) -> Self {
        Self {
            valid: false,
            message: format!("SMTP validation failed: {}", err),
            kind: Some(err.kind),
        }
    }

    /// The failure as an error, `None` when valid.
    pub fn into_error(self) -> Option<SmtpError> {
        if self.valid {
            return None;
        }
        let kind = self.kind.unwrap_or(SmtpErrorKind::TransportError);
        Some(SmtpError::new(kind, self.message))
    }
}

/// Connect, log in and NOOP, exactly as a send would.
pub async fn validate(config: &SmtpConfig) -> ValidationOutcome {
    match open_authenticated(config).await {
        Ok(mut client) => {
            if let Err(e) = client.noop().await {
                debug!("[transport] NOOP failed (ignored): {}", e);
            }
            client.close().await;
            info!("[transport] {}:{} validated", config.host, config.port);
            ValidationOutcome::ok()
        }
        Err(e) => {
            warn!("[transport] validation of {}:{} failed: {}", config.host, config.port, e);
            ValidationOutcome::failed(&e)
        }
    }
}

// ─── MailTransport ──────────────────────────────────────────────────

/// Delivery backend used by the bulk sender.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver one message through a fresh session.
    async fn deliver(&self, config: &SmtpConfig, message: &Message) -> SmtpResult<()>;

    /// Probe the configuration without sending anything.
    async fn validate(&self, config: &SmtpConfig) -> ValidationOutcome;
}

/// [`MailTransport`] over real SMTP sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpTransport;

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn deliver(&self, config: &SmtpConfig, message: &Message) -> SmtpResult<()> {
        let mut client = open_authenticated(config).await?;
        let payload = render_message(message);
        let result = client
            .send_envelope(message.from.as_str(), &[message.to.as_str()], &payload)
            .await;
        client.close().await;
        let reply = result?;
        debug!("[transport] {} accepted: {}", message.to, reply);
        Ok(())
    }

    async fn validate(&self, config: &SmtpConfig) -> ValidationOutcome {
        validate(config).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Scripted in-process SMTP server. Accepts any number of sessions and
    /// records the DATA payload of each delivered message.
    pub(crate) struct TestServer {
        pub port: u16,
        pub messages: Arc<Mutex<Vec<String>>>,
        pub commands: Arc<Mutex<Vec<String>>>,
    }

    #[derive(Clone, Copy)]
    pub(crate) enum Behaviour {
        Normal,
        /// Accept TCP but never send a greeting.
        Silent,
        /// Advertise STARTTLS, then refuse it with 454.
        StartTlsRefused,
        /// Advertise STARTTLS, accept it, then hang up before the handshake.
        StartTlsHangUp,
    }

    impl TestServer {
        pub(crate) async fn start(behaviour: Behaviour) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let messages = Arc::new(Mutex::new(Vec::new()));
            let commands = Arc::new(Mutex::new(Vec::new()));
            let (m, c) = (messages.clone(), commands.clone());
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok((sock, _)) = listener.accept().await {
                    match behaviour {
                        Behaviour::Silent => held.push(sock),
                        _ => {
                            tokio::spawn(serve(sock, behaviour, m.clone(), c.clone()));
                        }
                    }
                }
            });
            Self {
                port,
                messages,
                commands,
            }
        }

        pub(crate) fn config(&self) -> SmtpConfig {
            SmtpConfig {
                username: "sender@example.com".into(),
                password: "secret".into(),
                timeout_secs: 2,
                probe_timeout_secs: 2,
                ..SmtpConfig::for_port("127.0.0.1", self.port)
            }
        }

        fn saw(&self, prefix: &str) -> bool {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with(prefix))
        }
    }

    async fn serve(
        sock: TcpStream,
        behaviour: Behaviour,
        messages: Arc<Mutex<Vec<String>>>,
        commands: Arc<Mutex<Vec<String>>>,
    ) {
        let mut reader = BufReader::new(sock);
        if reader
            .get_mut()
            .write_all(b"220 test.local ESMTP ready\r\n")
            .await
            .is_err()
        {
            return;
        }
        let good_plain = auth::build_plain_payload("sender@example.com", "secret");
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let cmd = line.trim_end().to_string();
            commands.lock().unwrap().push(cmd.clone());
            let upper = cmd.to_uppercase();
            let starttls = matches!(
                behaviour,
                Behaviour::StartTlsRefused | Behaviour::StartTlsHangUp
            );
            let reply: &[u8] = if upper.starts_with("EHLO") && starttls {
                b"250-test.local\r\n250-STARTTLS\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n"
            } else if upper.starts_with("EHLO") {
                b"250-test.local\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n"
            } else if upper == "STARTTLS" {
                if let Behaviour::StartTlsHangUp = behaviour {
                    let _ = reader.get_mut().write_all(b"220 2.0.0 Ready to start TLS\r\n").await;
                    return;
                }
                b"454 4.7.0 TLS not available due to temporary reason\r\n"
            } else if let Some(payload) = cmd.strip_prefix("AUTH PLAIN ") {
                if payload == good_plain {
                    b"235 2.7.0 Authentication successful\r\n"
                } else {
                    b"535 5.7.8 Authentication credentials invalid\r\n"
                }
            } else if upper.starts_with("MAIL FROM") {
                b"250 OK\r\n"
            } else if upper.starts_with("RCPT TO") {
                if cmd.contains("reject") {
                    b"550 5.1.1 No such user\r\n"
                } else {
                    b"250 OK\r\n"
                }
            } else if upper == "DATA" {
                let _ = reader.get_mut().write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await;
                let mut body = String::new();
                loop {
                    let mut l = String::new();
                    match reader.read_line(&mut l).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    if l == ".\r\n" {
                        break;
                    }
                    body.push_str(&l);
                }
                messages.lock().unwrap().push(body);
                b"250 2.0.0 Queued\r\n"
            } else if upper == "NOOP" {
                b"250 OK\r\n"
            } else if upper == "QUIT" {
                let _ = reader.get_mut().write_all(b"221 Bye\r\n").await;
                return;
            } else {
                b"502 Command not implemented\r\n"
            };
            if reader.get_mut().write_all(reply).await.is_err() {
                return;
            }
        }
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn message(to: &str) -> Message {
        Message {
            id: "1@example.com".into(),
            date: chrono::Local::now(),
            from: EmailAddress::parse("sender@example.com").unwrap(),
            to: EmailAddress::parse(to).unwrap(),
            subject: "Hello".into(),
            html_body: "<p>Hi</p>\r\n.leading dot".into(),
            text_body: crate::message::PLAIN_FALLBACK.into(),
            attachments: vec![],
        }
    }

    // ── Security resolution ─────────────────────────────────────

    #[test]
    fn security_derived_from_port() {
        let cfg = |port| SmtpConfig {
            port,
            ..SmtpConfig::default()
        };
        assert_eq!(resolve_security(&cfg(465)).unwrap(), SmtpSecurity::ImplicitTls);
        assert_eq!(resolve_security(&cfg(587)).unwrap(), SmtpSecurity::StartTls);
        assert_eq!(resolve_security(&cfg(25)).unwrap(), SmtpSecurity::None);
        assert_eq!(resolve_security(&cfg(2525)).unwrap(), SmtpSecurity::StartTls);
    }

    #[test]
    fn explicit_flags_override_port() {
        let cfg = SmtpConfig {
            port: 2525,
            use_ssl: Some(false),
            use_tls: Some(false),
            ..SmtpConfig::default()
        };
        assert_eq!(resolve_security(&cfg).unwrap(), SmtpSecurity::None);
        let cfg = SmtpConfig {
            port: 25,
            use_ssl: Some(true),
            ..SmtpConfig::default()
        };
        assert_eq!(resolve_security(&cfg).unwrap(), SmtpSecurity::ImplicitTls);
    }

    #[test]
    fn conflicting_flags_rejected() {
        let cfg = SmtpConfig {
            port: 465,
            use_ssl: Some(false),
            ..SmtpConfig::default()
        };
        assert!(resolve_security(&cfg).unwrap_err().is_kind(SmtpErrorKind::ConfigConflict));
        let cfg = SmtpConfig {
            port: 587,
            use_ssl: Some(true),
            ..SmtpConfig::default()
        };
        assert!(resolve_security(&cfg).unwrap_err().is_kind(SmtpErrorKind::ConfigConflict));
    }

    // ── Connection ──────────────────────────────────────────────

    #[tokio::test]
    async fn conflict_reported_before_any_socket() {
        let cfg = SmtpConfig {
            use_ssl: Some(false),
            ..SmtpConfig::for_port("unreachable.invalid", 465)
        };
        let err = connect(&cfg).await.err().unwrap();
        assert_eq!(err.kind, SmtpErrorKind::ConfigConflict);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let port = closed_port().await;
        let err = connect(&SmtpConfig::for_port("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, SmtpErrorKind::Unreachable);
        assert!(err.message.contains(&format!("127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let server = TestServer::start(Behaviour::Silent).await;
        let cfg = SmtpConfig {
            timeout_secs: 1,
            ..server.config()
        };
        let err = connect(&cfg).await.err().unwrap();
        assert_eq!(err.kind, SmtpErrorKind::Timeout);
    }

    #[tokio::test]
    async fn connect_without_starttls_falls_back_to_plaintext() {
        let server = TestServer::start(Behaviour::Normal).await;
        let mut client = connect(&server.config()).await.unwrap();
        assert!(client.is_connected());
        assert!(!client.is_tls_active());
        assert!(!server.saw("STARTTLS"));
        client.close().await;
    }

    #[tokio::test]
    async fn refused_starttls_is_transport_error_and_quits() {
        let server = TestServer::start(Behaviour::StartTlsRefused).await;
        let err = connect(&server.config()).await.err().unwrap();
        assert_eq!(err.kind, SmtpErrorKind::TransportError);
        assert_eq!(err.code, Some(454));
        assert!(server.saw("STARTTLS"));
        assert!(server.saw("QUIT"));
        assert!(!server.saw("AUTH"));
    }

    #[tokio::test]
    async fn hang_up_during_tls_upgrade_is_transport_error() {
        let server = TestServer::start(Behaviour::StartTlsHangUp).await;
        let err = connect(&server.config()).await.err().unwrap();
        assert_eq!(err.kind, SmtpErrorKind::TransportError);
        assert!(err.message.contains("TLS handshake failed"));
        assert!(server.saw("STARTTLS"));
    }

    #[tokio::test]
    async fn wrong_password_is_auth_error() {
        let server = TestServer::start(Behaviour::Normal).await;
        let mut client = connect(&server.config()).await.unwrap();
        let err = authenticate(&mut client, "sender@example.com", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err.kind, SmtpErrorKind::AuthError);
        assert_eq!(err.code, Some(535));
        client.close().await;
    }

    // ── Validation ──────────────────────────────────────────────

    #[tokio::test]
    async fn validate_reports_success() {
        let server = TestServer::start(Behaviour::Normal).await;
        let outcome = validate(&server.config()).await;
        assert_eq!(outcome, ValidationOutcome::ok());
        assert!(server.saw("AUTH PLAIN"));
        assert!(server.saw("NOOP"));
        assert!(server.saw("QUIT"));
    }

    #[tokio::test]
    async fn validate_reports_failure_message() {
        let port = closed_port().await;
        let outcome = validate(&SmtpConfig::for_port("127.0.0.1", port)).await;
        assert!(!outcome.valid);
        assert!(outcome.message.starts_with("SMTP validation failed: "));
        assert!(outcome.message.contains("Unreachable"));
        assert_eq!(outcome.kind, Some(SmtpErrorKind::Unreachable));
        let err = outcome.into_error().unwrap();
        assert!(err.is_kind(SmtpErrorKind::Unreachable));
    }

    #[tokio::test]
    async fn validate_without_credentials_skips_auth() {
        let server = TestServer::start(Behaviour::Normal).await;
        let cfg = SmtpConfig {
            password: String::new(),
            ..server.config()
        };
        assert!(validate(&cfg).await.valid);
        assert!(!server.saw("AUTH"));
    }

    #[tokio::test]
    async fn validate_honours_forced_auth_method() {
        let server = TestServer::start(Behaviour::Normal).await;
        let cfg = SmtpConfig {
            auth_method: Some(SmtpAuthMethod::Login),
            ..server.config()
        };
        let outcome = validate(&cfg).await;
        assert!(!outcome.valid);
        assert_eq!(outcome.kind, Some(SmtpErrorKind::AuthError));
        assert!(server.saw("AUTH LOGIN"));
        assert!(!server.saw("AUTH PLAIN"));
        assert!(server.saw("QUIT"));
    }

    // ── Delivery ────────────────────────────────────────────────

    #[tokio::test]
    async fn deliver_sends_envelope_and_body() {
        let server = TestServer::start(Behaviour::Normal).await;
        SmtpTransport
            .deliver(&server.config(), &message("rcpt@example.com"))
            .await
            .unwrap();
        assert!(server.saw("MAIL FROM:<sender@example.com>"));
        assert!(server.saw("RCPT TO:<rcpt@example.com>"));
        assert!(server.saw("QUIT"));
        let messages = server.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Subject: Hello\r\n"));
    }

    #[tokio::test]
    async fn deliver_rejected_recipient_is_transport_error() {
        let server = TestServer::start(Behaviour::Normal).await;
        let err = SmtpTransport
            .deliver(&server.config(), &message("reject@example.com"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SmtpErrorKind::TransportError);
        assert_eq!(err.code, Some(550));
        assert!(server.saw("QUIT"));
        assert!(server.messages.lock().unwrap().is_empty());
    }
}
