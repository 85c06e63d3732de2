//! Email transport: raw IMAP over rustls for fetching, SMTP via lettre for
//! sending. Both run on the blocking pool.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::pipeline::types::InboundMessage;
use crate::transport::MailTransport;

// ── Configuration ───────────────────────────────────────────────────

/// IMAP/SMTP settings, built from environment variables.
#[derive(Debug)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// IMAP folder to poll.
    pub mailbox: String,
    /// Socket read timeout for IMAP and SMTP.
    pub io_timeout: Duration,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let mailbox = std::env::var("EMAIL_MAILBOX").unwrap_or_else(|_| "INBOX".to_string());

        let io_timeout = std::env::var("EMAIL_IO_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            mailbox,
            io_timeout,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

pub struct ImapSmtpTransport {
    config: Arc<EmailConfig>,
}

impl ImapSmtpTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl MailTransport for ImapSmtpTransport {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<InboundMessage>, TransportError> {
        let config = Arc::clone(&self.config);
        let host = config.imap_host.clone();
        let messages = tokio::task::spawn_blocking(move || fetch_since_blocking(&config, since))
            .await
            .map_err(|e| TransportError::FetchFailed {
                host,
                reason: format!("fetch task failed: {e}"),
            })??;
        debug!(count = messages.len(), since = %since, "Fetched messages");
        Ok(messages)
    }

    async fn send(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        let config = Arc::clone(&self.config);
        let (from, to_owned, subject, body) =
            (from.to_string(), to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || send_blocking(&config, &from, &to_owned, &subject, &body))
            .await
            .map_err(|e| TransportError::SendFailed {
                to: to.to_string(),
                reason: format!("send task failed: {e}"),
            })?
    }
}

// ── SMTP ────────────────────────────────────────────────────────────

fn parse_mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

fn send_blocking(
    config: &EmailConfig,
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<(), TransportError> {
    let send_failed = |reason: String| TransportError::SendFailed {
        to: to.to_string(),
        reason,
    };

    let email = Message::builder()
        .from(parse_mailbox(from)?)
        .to(parse_mailbox(to)?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    // Port 465 is implicit TLS; anything else negotiates STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    }
    .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(config.smtp_port)
        .credentials(Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        ))
        .timeout(Some(config.io_timeout))
        .build();

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    info!(to, "Email sent");
    Ok(())
}

// ── IMAP ────────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One untagged response line, with its literal payload if it carried one.
#[derive(Debug, Default)]
struct Untagged {
    line: String,
    literal: Option<Vec<u8>>,
}

/// Minimal IMAP4rev1 client: tagged commands, untagged responses, literals.
struct ImapSession {
    stream: TlsStream,
    host: String,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, TransportError> {
        let host = config.imap_host.clone();
        let fail = |reason: String| TransportError::FetchFailed {
            host: host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))
            .map_err(|e| fail(format!("connect: {e}")))?;
        tcp.set_read_timeout(Some(config.io_timeout))
            .map_err(|e| fail(format!("socket: {e}")))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| fail(format!("server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| fail(format!("tls: {e}")))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            host,
            next_tag: 1,
        };
        let _greeting = session.read_line()?;
        Ok(session)
    }

    fn io_error(&self, e: std::io::Error) -> TransportError {
        TransportError::FetchFailed {
            host: self.host.clone(),
            reason: format!("io: {e}"),
        }
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(TransportError::FetchFailed {
                        host: self.host.clone(),
                        reason: "IMAP connection closed".into(),
                    });
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    /// Send a command and collect untagged responses up to the tagged
    /// completion. A non-OK completion is an error.
    fn command(&mut self, command: &str) -> Result<Vec<Untagged>, TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {command}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| self.io_error(e))?;

        let verb = command.split_whitespace().next().unwrap_or("command");
        let mut responses = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&tag) {
                let status = status.trim();
                if status.starts_with("OK") {
                    return Ok(responses);
                }
                return Err(TransportError::FetchFailed {
                    host: self.host.clone(),
                    reason: format!("{verb} failed: {status}"),
                });
            }

            let mut response = Untagged {
                line,
                literal: None,
            };
            if let Some(size) = literal_size(&response.line) {
                let mut payload = vec![0u8; size];
                self.stream
                    .read_exact(&mut payload)
                    .map_err(|e| self.io_error(e))?;
                response.literal = Some(payload);
                let rest = self.read_line()?;
                response.line.push_str(&rest);
            }
            responses.push(response);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        let command = format!("LOGIN {} {}", quote(username), quote(password));
        self.command(&command).map(|_| ()).map_err(|_| TransportError::AuthFailed {
            host: self.host.clone(),
        })
    }
}

fn fetch_since_blocking(
    config: &EmailConfig,
    since: DateTime<Utc>,
) -> Result<Vec<InboundMessage>, TransportError> {
    let mut session = ImapSession::connect(config)?;
    session.login(&config.username, config.password.expose_secret())?;

    let select = session.command(&format!("SELECT {}", quote(&config.mailbox)))?;
    let uidvalidity = select
        .iter()
        .find_map(|r| parse_uidvalidity(&r.line))
        .unwrap_or(0);

    let search = session.command(&format!("UID SEARCH SINCE {}", imap_date(since)))?;
    let uids: Vec<u32> = search.iter().flat_map(|r| parse_search(&r.line)).collect();

    let fetched_at = Utc::now();
    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        // PEEK leaves \Seen alone; the ledger tracks what has been handled.
        let responses =
            session.command(&format!("UID FETCH {uid} (INTERNALDATE BODY.PEEK[])"))?;
        let delivered_at = responses.iter().find_map(|r| parse_internal_date(&r.line));
        let Some(raw) = responses.into_iter().find_map(|r| r.literal) else {
            warn!(uid, "FETCH returned no body");
            continue;
        };
        if delivered_at.is_none() {
            debug!(uid, "No INTERNALDATE, using the Date header");
        }
        match parse_message(&raw, format!("imap:{uidvalidity}:{uid}"), delivered_at, fetched_at) {
            Some(message) => messages.push(message),
            None => warn!(uid, "Skipping unparseable message"),
        }
    }

    if let Err(e) = session.command("LOGOUT") {
        debug!(error = %e, "LOGOUT did not complete cleanly");
    }
    Ok(messages)
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Quote an IMAP string argument.
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// IMAP `SINCE` date, e.g. `6-Mar-2026`. Day granularity only.
pub fn imap_date(ts: DateTime<Utc>) -> String {
    ts.format("%-d-%b-%Y").to_string()
}

/// Size of a trailing `{N}` literal marker.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

fn parse_uidvalidity(line: &str) -> Option<u32> {
    let start = line.find("[UIDVALIDITY ")? + "[UIDVALIDITY ".len();
    let rest = &line[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

/// Server arrival time from a FETCH response, e.g.
/// `INTERNALDATE " 6-Mar-2026 16:00:00 +0000"`.
fn parse_internal_date(line: &str) -> Option<DateTime<Utc>> {
    let start = line.find("INTERNALDATE \"")? + "INTERNALDATE \"".len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    DateTime::parse_from_str(rest[..end].trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_search(line: &str) -> Vec<u32> {
    line.strip_prefix("* SEARCH")
        .map(|rest| rest.split_whitespace().filter_map(|s| s.parse().ok()).collect())
        .unwrap_or_default()
}

/// Canonical form of a Message-ID: no angle brackets, lowercase.
pub fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

/// SHA-256 of the normalised Message-ID, hex encoded.
pub fn hash_message_id(id: &str) -> String {
    let digest = Sha256::digest(normalize_message_id(id).as_bytes());
    format!("{digest:x}")
}

fn header_ids(value: &HeaderValue<'_>) -> Vec<String> {
    let ids: Vec<&Cow<'_, str>> = match value {
        HeaderValue::Text(id) => vec![id],
        HeaderValue::TextList(ids) => ids.iter().collect(),
        _ => Vec::new(),
    };
    ids.into_iter()
        .map(|id| normalize_message_id(id))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_sender(parsed: &mail_parser::Message) -> (String, Option<String>) {
    let first = parsed.from().and_then(|addr| addr.first());
    let address = first
        .and_then(|a| a.address())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    let name = first
        .and_then(|a| a.name())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    (address, name)
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Turn a raw RFC 5322 message into an [`InboundMessage`].
///
/// The thread id is the conversation root: the first `References` entry,
/// else `In-Reply-To`, else the message's own Message-ID.
///
/// `received_at` is the server's delivery time when known. The sender's
/// `Date:` header is used only without it, then `fetched_at`.
pub fn parse_message(
    raw: &[u8],
    provider_id: String,
    delivered_at: Option<DateTime<Utc>>,
    fetched_at: DateTime<Utc>,
) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let own_id = parsed
        .message_id()
        .map(normalize_message_id)
        .filter(|id| !id.is_empty());
    let thread_id = header_ids(parsed.references())
        .into_iter()
        .next()
        .or_else(|| header_ids(parsed.in_reply_to()).into_iter().next())
        .or_else(|| own_id.clone());

    let (sender, sender_name) = extract_sender(&parsed);
    let received_at = delivered_at
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or(fetched_at);

    Some(InboundMessage {
        message_id: provider_id,
        message_id_hash: own_id.as_deref().map(hash_message_id),
        thread_id,
        sender,
        sender_name,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        content: extract_text(&parsed),
        received_at,
        has_attachments: parsed.attachments().next().is_some(),
    })
}
