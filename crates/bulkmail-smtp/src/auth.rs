//! SMTP authentication mechanisms.
//!
//! Supports PLAIN, LOGIN and CRAM-MD5. Credentials never reach the debug
//! log; every line carrying them goes through
//! [`SmtpClient::command_redacted`].

use base64::Engine;
use log::debug;

use crate::client::SmtpClient;
use crate::types::*;

/// Log in on an established session.
///
/// A missing username or password means the server is used without
/// authentication, so nothing is sent and `Ok` is returned.
pub async fn authenticate(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    if creds.username.is_empty() || creds.password.is_empty() {
        debug!("[auth] no credentials configured, skipping AUTH");
        return Ok(());
    }

    let method = select_auth_method(client.capabilities(), creds);
    debug!("[auth] authenticating as {} with {}", creds.username, method);

    match method {
        SmtpAuthMethod::Plain => auth_plain(client, creds).await,
        SmtpAuthMethod::Login => auth_login(client, creds).await,
        SmtpAuthMethod::CramMd5 => auth_cram_md5(client, creds).await,
    }
}

/// Pick the mechanism: an explicit choice wins, then CRAM-MD5 > PLAIN > LOGIN
/// among those advertised, then PLAIN.
fn select_auth_method(
    caps: Option<&EhloCapabilities>,
    creds: &SmtpCredentials,
) -> SmtpAuthMethod {
    if let Some(m) = creds.method {
        return m;
    }

    if let Some(caps) = caps {
        if caps.supports_auth("CRAM-MD5") {
            return SmtpAuthMethod::CramMd5;
        }
        if caps.supports_auth("PLAIN") {
            return SmtpAuthMethod::Plain;
        }
        if caps.supports_auth("LOGIN") {
            return SmtpAuthMethod::Login;
        }
    }

    SmtpAuthMethod::Plain
}

fn rejected(step: &str, reply: &SmtpReply) -> SmtpError {
    SmtpError::auth(format!("{} failed: {} {}", step, reply.code, reply.text())).with_code(reply.code)
}

// ── AUTH PLAIN ──────────────────────────────────────────────────────

/// AUTH PLAIN: sends `\0username\0password` base64-encoded in one shot.
async fn auth_plain(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    let encoded = build_plain_payload(&creds.username, &creds.password);
    let reply = client
        .command_redacted(&format!("AUTH PLAIN {}", encoded))
        .await?;

    if reply.is_positive() {
        client.set_authenticated(true);
        Ok(())
    } else {
        Err(rejected("AUTH PLAIN", &reply))
    }
}

// ── AUTH LOGIN ──────────────────────────────────────────────────────

/// AUTH LOGIN: challenge-response with base64 username then password.
async fn auth_login(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    let reply = client.command("AUTH LOGIN").await?;
    if !reply.is_intermediate() {
        return Err(rejected("AUTH LOGIN", &reply));
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let reply = client
        .command_redacted(&engine.encode(creds.username.as_bytes()))
        .await?;
    if !reply.is_intermediate() {
        return Err(rejected("AUTH LOGIN username", &reply));
    }

    let reply = client
        .command_redacted(&engine.encode(creds.password.as_bytes()))
        .await?;
    if reply.is_positive() {
        client.set_authenticated(true);
        Ok(())
    } else {
        Err(rejected("AUTH LOGIN password", &reply))
    }
}

// ── AUTH CRAM-MD5 ───────────────────────────────────────────────────

/// AUTH CRAM-MD5: HMAC-MD5 challenge-response.
async fn auth_cram_md5(client: &mut SmtpClient, creds: &SmtpCredentials) -> SmtpResult<()> {
    let reply = client.command("AUTH CRAM-MD5").await?;
    if !reply.is_intermediate() {
        return Err(rejected("AUTH CRAM-MD5", &reply));
    }

    let challenge_b64 = reply.lines.first().cloned().unwrap_or_default();
    let challenge = base64::engine::general_purpose::STANDARD
        .decode(challenge_b64.trim().as_bytes())
        .map_err(|e| SmtpError::auth(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

    let response = build_cram_md5_response(&creds.username, &creds.password, &challenge)?;
    let reply = client.command_redacted(&response).await?;

    if reply.is_positive() {
        client.set_authenticated(true);
        Ok(())
    } else {
        Err(rejected("AUTH CRAM-MD5", &reply))
    }
}

// ── Payload builders ────────────────────────────────────────────────

/// Build the AUTH PLAIN payload.
pub fn build_plain_payload(username: &str, password: &str) -> String {
    let payload = format!("\0{}\0{}", username, password);
    base64::engine::general_purpose::STANDARD.encode(payload.as_bytes())
}

/// Build the CRAM-MD5 response: `base64(username + " " + hex(hmac_md5))`.
pub fn build_cram_md5_response(
    username: &str,
    password: &str,
    challenge: &[u8],
) -> SmtpResult<String> {
    use hmac::{Hmac, Mac};
    type HmacMd5 = Hmac<md5::Md5>;

    let mut mac = HmacMd5::new_from_slice(password.as_bytes())
        .map_err(|e| SmtpError::auth(format!("CRAM-MD5 key rejected: {}", e)))?;
    mac.update(challenge);
    let digest = hex::encode(mac.finalize().into_bytes());
    let response = format!("{} {}", username, digest);
    Ok(base64::engine::general_purpose::STANDARD.encode(response.as_bytes()))
}

// ─── Tests ──────────────────────────────────────────────────────────
