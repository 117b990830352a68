//! Low-level SMTP protocol engine.
//!
//! Handles TCP connection, implicit TLS and STARTTLS, EHLO/HELO negotiation,
//! command/response exchange and the DATA transfer. Every socket operation
//! is bounded by [`SmtpConfig::timeout_secs`].

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::types::*;

// ─── Stream Abstraction ─────────────────────────────────────────────

/// Wrapper over plain-text or TLS socket so the rest of the engine is generic.
enum SmtpStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl SmtpStream {
    async fn read_line(&mut self, buf: &mut String) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.read_line(buf).await,
            Self::Tls(r) => r.read_line(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().write_all(data).await,
            Self::Tls(r) => r.get_mut().write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(r) => r.get_mut().flush().await,
            Self::Tls(r) => r.get_mut().flush().await,
        }
    }
}

// ─── SmtpClient ─────────────────────────────────────────────────────

/// One SMTP session. Owned exclusively by the task that opened it.
pub struct SmtpClient {
    stream: Option<SmtpStream>,
    config: SmtpConfig,
    capabilities: Option<EhloCapabilities>,
    tls_active: bool,
    authenticated: bool,
    messages_sent: u64,
}

impl SmtpClient {
    /// Create a new SMTP client with the given configuration.
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            stream: None,
            config,
            capabilities: None,
            tls_active: false,
            authenticated: false,
            messages_sent: 0,
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Option<&EhloCapabilities> {
        self.capabilities.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    // ── Connection ──────────────────────────────────────────────

    /// Connect to the SMTP server and read the greeting.
    ///
    /// With [`SmtpSecurity::ImplicitTls`] the TLS handshake happens before the
    /// greeting; otherwise the session starts in plaintext.
    pub async fn connect(&mut self, security: SmtpSecurity) -> SmtpResult<SmtpReply> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("Connecting to SMTP server {} ({})", addr, security);

        let tcp = tokio::time::timeout(self.io_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                SmtpError::timeout(format!(
                    "Connection to {} timed out after {}s",
                    addr, self.config.timeout_secs
                ))
            })?
            .map_err(|e| SmtpError::unreachable(&self.config.host, self.config.port, e))?;

        if security == SmtpSecurity::ImplicitTls {
            let tls_stream = self.upgrade_to_tls_raw(tcp).await?;
            self.stream = Some(SmtpStream::Tls(Box::new(BufReader::new(tls_stream))));
            self.tls_active = true;
        } else {
            self.stream = Some(SmtpStream::Plain(BufReader::new(tcp)));
        }

        let greeting = self.read_reply().await?;
        if greeting.is_error() {
            return Err(SmtpError::server(
                greeting.code,
                format!("Server rejected connection: {}", greeting.text()),
            ));
        }
        info!("SMTP connected to {} – {}", addr, greeting.text());
        Ok(greeting)
    }

    /// Perform EHLO (falling back to HELO) and parse capabilities.
    pub async fn ehlo(&mut self) -> SmtpResult<EhloCapabilities> {
        let domain = self.config.ehlo_domain.clone();
        let reply = self.command(&format!("EHLO {}", domain)).await?;
        if reply.is_positive() {
            let caps = EhloCapabilities::parse(&reply);
            self.capabilities = Some(caps.clone());
            return Ok(caps);
        }
        debug!("EHLO rejected, trying HELO");
        let reply = self.command(&format!("HELO {}", domain)).await?;
        if reply.is_positive() {
            let caps = EhloCapabilities {
                server_name: reply.lines.first().cloned().unwrap_or_default(),
                ..Default::default()
            };
            self.capabilities = Some(caps.clone());
            Ok(caps)
        } else {
            Err(SmtpError::server(
                reply.code,
                format!("HELO rejected: {}", reply.text()),
            ))
        }
    }

    /// Upgrade the current plain-text connection to TLS via STARTTLS.
    pub async fn starttls(&mut self) -> SmtpResult<()> {
        if self.tls_active {
            return Ok(());
        }
        let reply = self.command("STARTTLS").await?;
        if !reply.is_positive() {
            return Err(SmtpError::server(
                reply.code,
                format!("STARTTLS rejected: {}", reply.text()),
            ));
        }

        let stream = self
            .stream
            .take()
            .ok_or_else(|| SmtpError::transport("Not connected"))?;
        let tcp = match stream {
            SmtpStream::Plain(r) => r.into_inner(),
            SmtpStream::Tls(_) => return Err(SmtpError::transport("Already using TLS")),
        };

        let tls_stream = self.upgrade_to_tls_raw(tcp).await?;
        self.stream = Some(SmtpStream::Tls(Box::new(BufReader::new(tls_stream))));
        self.tls_active = true;
        info!("STARTTLS upgrade successful");

        // RFC 3207 §4.2: capabilities must be re-discovered.
        self.ehlo().await?;
        Ok(())
    }

    /// Close the session with QUIT. Errors are swallowed.
    pub async fn close(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.command("QUIT").await {
                debug!("QUIT failed (ignored): {}", e);
            }
            self.stream = None;
        }
        self.tls_active = false;
        self.authenticated = false;
        self.capabilities = None;
        debug!("SMTP connection closed");
    }

    // ── Mail Transaction ────────────────────────────────────────

    /// Issue MAIL FROM.
    pub async fn mail_from(&mut self, sender: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command(&format!("MAIL FROM:<{}>", sender)).await?;
        if reply.is_error() {
            return Err(SmtpError::server(
                reply.code,
                format!("MAIL FROM rejected: {}", reply.text()),
            ));
        }
        Ok(reply)
    }

    /// Issue RCPT TO.
    pub async fn rcpt_to(&mut self, recipient: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command(&format!("RCPT TO:<{}>", recipient)).await?;
        if reply.is_error() {
            return Err(SmtpError::server(
                reply.code,
                format!("RCPT TO rejected for {}: {}", recipient, reply.text()),
            ));
        }
        Ok(reply)
    }

    /// Issue DATA and send the message body.
    /// Returns the final reply (should be 250).
    pub async fn data(&mut self, body: &str) -> SmtpResult<SmtpReply> {
        let reply = self.command("DATA").await?;
        if !reply.is_intermediate() {
            return Err(SmtpError::server(
                reply.code,
                format!("DATA rejected: {}", reply.text()),
            ));
        }

        let body = Self::dot_stuff(body);
        self.write_raw(body.as_bytes()).await?;
        self.write_raw(b".\r\n").await?;
        self.flush().await?;

        let reply = self.read_reply().await?;
        if reply.is_error() {
            return Err(SmtpError::server(
                reply.code,
                format!("DATA body rejected: {}", reply.text()),
            ));
        }
        Ok(reply)
    }

    /// NOOP command (liveness probe).
    pub async fn noop(&mut self) -> SmtpResult<SmtpReply> {
        self.command("NOOP").await
    }

    /// Send a complete message through the envelope (MAIL FROM + RCPT TO + DATA).
    pub async fn send_envelope(
        &mut self,
        from: &str,
        recipients: &[&str],
        body: &str,
    ) -> SmtpResult<SmtpReply> {
        self.mail_from(from).await?;
        for rcpt in recipients {
            self.rcpt_to(rcpt).await?;
        }
        let reply = self.data(body).await?;
        self.messages_sent += 1;
        Ok(reply)
    }

    /// Mark as authenticated (called by auth module after successful auth).
    pub fn set_authenticated(&mut self, auth: bool) {
        self.authenticated = auth;
    }

    // ── Low-level I/O ───────────────────────────────────────────

    /// Send a command and read the reply.
    pub async fn command(&mut self, cmd: &str) -> SmtpResult<SmtpReply> {
        debug!("C: {}", cmd);
        self.exchange(cmd).await
    }

    /// Like [`command`](Self::command) but keeps the line out of the log.
    pub async fn command_redacted(&mut self, cmd: &str) -> SmtpResult<SmtpReply> {
        debug!("C: <credentials>");
        self.exchange(cmd).await
    }

    async fn exchange(&mut self, cmd: &str) -> SmtpResult<SmtpReply> {
        self.write_raw(format!("{}\r\n", cmd).as_bytes()).await?;
        self.flush().await?;
        self.read_reply().await
    }

    /// Read a complete SMTP reply (may be multi-line).
    pub async fn read_reply(&mut self) -> SmtpResult<SmtpReply> {
        let timeout = self.io_timeout();
        let timeout_secs = self.config.timeout_secs;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::transport("Not connected"))?;

        let mut full_response = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(timeout, stream.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::timeout(format!("No reply within {}s", timeout_secs)))?
                .map_err(|e| SmtpError::transport(format!("Read error: {}", e)))?;

            if n == 0 {
                return Err(SmtpError::transport("Connection closed by server"));
            }
            full_response.push_str(&line);
            debug!("S: {}", line.trim_end());

            // Final line: code followed by space, not dash.
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                break;
            }
            if line.trim_end().len() == 3 {
                break;
            }
        }

        SmtpReply::parse(&full_response)
    }

    async fn write_raw(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout = self.io_timeout();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::transport("Not connected"))?;
        tokio::time::timeout(timeout, stream.write_all(data))
            .await
            .map_err(|_| SmtpError::timeout("Write timed out"))?
            .map_err(|e| SmtpError::transport(format!("Write error: {}", e)))
    }

    async fn flush(&mut self) -> SmtpResult<()> {
        let timeout = self.io_timeout();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SmtpError::transport("Not connected"))?;
        tokio::time::timeout(timeout, stream.flush())
            .await
            .map_err(|_| SmtpError::timeout("Flush timed out"))?
            .map_err(|e| SmtpError::transport(format!("Write error: {}", e)))
    }

    // ── TLS helper ──────────────────────────────────────────────

    async fn upgrade_to_tls_raw(&self, tcp: TcpStream) -> SmtpResult<TlsStream<TcpStream>> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ref ca_path) = self.config.ca_cert_path {
            let pem_data = tokio::fs::read(ca_path)
                .await
                .map_err(|e| SmtpError::io(format!("Failed to read CA cert: {}", e)))?;
            let mut cursor = Cursor::new(pem_data);
            let certs = rustls_pemfile::certs(&mut cursor)
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            for cert in certs {
                root_store
                    .add(cert)
                    .map_err(|e| SmtpError::transport(format!("Failed to add CA cert: {}", e)))?;
            }
        }

        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !self.config.verify_certificates {
            warn!("TLS certificate verification disabled – insecure!");
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertVerifier));
        }

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(self.config.host.clone())
            .map_err(|e| SmtpError::transport(format!("Invalid server name: {}", e)))?;

        tokio::time::timeout(self.io_timeout(), connector.connect(server_name, tcp))
            .await
            .map_err(|_| SmtpError::timeout("TLS handshake timed out"))?
            .map_err(|e| SmtpError::transport(format!("TLS handshake failed: {}", e)))
    }

    // ── Dot-stuffing ────────────────────────────────────────────

    /// Perform SMTP dot-stuffing on the message body and normalise line
    /// endings to CRLF. The result always ends with CRLF.
    fn dot_stuff(body: &str) -> String {
        let mut result = String::with_capacity(body.len() + 64);
        let body = body.strip_suffix('\n').unwrap_or(body);
        let body = body.strip_suffix('\r').unwrap_or(body);
        for line in body.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.starts_with('.') {
                result.push('.');
            }
            result.push_str(line);
            result.push_str("\r\n");
        }
        result
    }
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
