//! IMAP mailbox access for the email source.
//!
//! Raw IMAP over rustls, run on a blocking thread. Per cycle and mailbox:
//! `LOGIN`, `SELECT`, `UID SEARCH UNSEEN UID n+1:*`, then for each new UID
//! `UID FETCH <uid> BODY.PEEK[]` followed by `UID STORE <uid> +FLAGS (\Seen)`
//! once the message parsed, then `LOGOUT`. A UID whose fetch fails is
//! skipped and left unseen.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::error::ChannelError;

// ── Configuration ───────────────────────────────────────────────────

/// One IMAP mailbox.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Login and display name, e.g. `me@example.com`.
    pub account: String,
    pub imap_host: String,
    pub imap_port: u16,
    /// Password or app authorization code.
    pub password: SecretString,
    pub folder: String,
}

/// Email source configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub mailboxes: Vec<MailboxConfig>,
    pub poll_interval_secs: u64,
    /// Cursor floor applied to every mailbox.
    pub uid_floor: i64,
    /// Most messages fetched per mailbox per cycle.
    pub fetch_limit: usize,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_ACCOUNTS` is not set (source disabled).
    ///
    /// Mailbox lists are `;`-separated and matched by position:
    /// `EMAIL_ACCOUNTS`, `EMAIL_IMAP_SERVERS`, `EMAIL_IMAP_PORTS`,
    /// `EMAIL_AUTHORIZATION_CODES`.
    pub fn from_env() -> Option<Self> {
        let accounts = std::env::var("EMAIL_ACCOUNTS").ok()?;
        let servers = std::env::var("EMAIL_IMAP_SERVERS").unwrap_or_default();
        let ports = std::env::var("EMAIL_IMAP_PORTS").unwrap_or_else(|_| "993".to_string());
        let codes = std::env::var("EMAIL_AUTHORIZATION_CODES").unwrap_or_default();
        let folder = std::env::var("EMAIL_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        let mailboxes = parse_mailboxes(&accounts, &servers, &ports, &codes, &folder);
        if mailboxes.is_empty() {
            return None;
        }

        let poll_interval_secs: u64 = std::env::var("EMAIL_CHECK_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let uid_floor: i64 = std::env::var("EMAIL_UID_FLOOR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let fetch_limit: usize = std::env::var("EMAIL_FETCH_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        Some(Self {
            mailboxes,
            poll_interval_secs,
            uid_floor,
            fetch_limit,
        })
    }
}

/// Zip the `;`-separated lists into mailboxes. Missing servers fall back to
/// the first server, missing ports to 993, missing codes to empty.
pub fn parse_mailboxes(
    accounts: &str,
    servers: &str,
    ports: &str,
    codes: &str,
    folder: &str,
) -> Vec<MailboxConfig> {
    let split = |s: &str| -> Vec<String> { s.split(';').map(|p| p.trim().to_string()).collect() };
    let servers = split(servers);
    let ports = split(ports);
    let codes = split(codes);

    accounts
        .split(';')
        .map(str::trim)
        .enumerate()
        .filter(|(_, account)| !account.is_empty())
        .filter_map(|(idx, account)| {
            let host = servers
                .get(idx)
                .filter(|s| !s.is_empty())
                .or_else(|| servers.first())
                .filter(|s| !s.is_empty())?
                .clone();
            let port = ports
                .get(idx)
                .and_then(|p| p.parse().ok())
                .unwrap_or(993);
            let password = codes.get(idx).cloned().unwrap_or_default();
            Some(MailboxConfig {
                account: account.to_string(),
                imap_host: host,
                imap_port: port,
                password: SecretString::from(password),
                folder: folder.to_string(),
            })
        })
        .collect()
}

// ── Fetched messages ────────────────────────────────────────────────

/// A message pulled from a mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEmail {
    pub uid: i64,
    pub message_id: Option<String>,
    pub sender_name: Option<String>,
    pub sender_address: String,
    pub subject: String,
    pub body: String,
    /// Date header in unix seconds (fetch time when absent).
    pub date: i64,
}

impl FetchedEmail {
    /// `Name <address>`, or the bare address.
    pub fn sender_display(&self) -> String {
        match self.sender_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => format!("{name} <{}>", self.sender_address),
            None => self.sender_address.clone(),
        }
    }
}

/// Access to mailboxes.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Unseen messages with UID above `since_uid`, lowest UID first, at
    /// most `limit`.
    async fn fetch_since(
        &self,
        mailbox: &MailboxConfig,
        since_uid: i64,
        limit: usize,
    ) -> Result<Vec<FetchedEmail>, ChannelError>;
}

/// `MailboxClient` over IMAPS.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImapMailbox;

#[async_trait]
impl MailboxClient for ImapMailbox {
    async fn fetch_since(
        &self,
        mailbox: &MailboxConfig,
        since_uid: i64,
        limit: usize,
    ) -> Result<Vec<FetchedEmail>, ChannelError> {
        let cfg = mailbox.clone();
        let account = mailbox.account.clone();
        tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg, since_uid, limit))
            .await
            .map_err(|e| ChannelError::TaskFailed {
                name: "email".into(),
                reason: e.to_string(),
            })?
            .map_err(|e| ChannelError::Imap {
                account,
                reason: e.to_string(),
            })
    }
}

// ── IMAP session ────────────────────────────────────────────────────

/// Error type for IMAP operations.
pub type ImapError = Box<dyn std::error::Error + Send + Sync>;

/// Tagged response to one command.
#[derive(Debug, Default)]
pub struct ImapResponse {
    /// Untagged and tagged lines, CRLF stripped.
    pub lines: Vec<String>,
    /// Literal payloads (`{n}` blocks) in order of appearance.
    pub literals: Vec<Vec<u8>>,
}

impl ImapResponse {
    fn status_line(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }

    /// Whether the tagged status is `OK`.
    pub fn is_ok(&self) -> bool {
        self.status_line()
            .split_whitespace()
            .nth(1)
            .is_some_and(|s| s.eq_ignore_ascii_case("OK"))
    }
}

/// A minimal IMAP4rev1 client over any byte stream.
pub struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap a connected stream and consume the server greeting.
    pub fn start(stream: S) -> Result<Self, ImapError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(format!("unexpected IMAP greeting: {}", greeting.trim_end()).into());
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err("IMAP connection closed".into());
        }
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    /// Send `cmd` with a fresh tag and collect the response up to the
    /// tagged status line.
    pub fn command(&mut self, cmd: &str) -> Result<ImapResponse, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let inner = self.stream.get_mut();
        inner.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        inner.flush()?;

        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_length(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            let done = line.starts_with(&format!("{tag} "));
            response.lines.push(line.trim_end().to_string());
            if done {
                return Ok(response);
            }
        }
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), ImapError> {
        let resp = self.command(&format!("LOGIN {} {}", quote(user), quote(password)))?;
        if !resp.is_ok() {
            return Err("IMAP login failed".into());
        }
        Ok(())
    }

    pub fn select(&mut self, folder: &str) -> Result<(), ImapError> {
        let resp = self.command(&format!("SELECT {}", quote(folder)))?;
        if !resp.is_ok() {
            return Err(format!("IMAP select {folder} failed: {}", resp.status_line()).into());
        }
        Ok(())
    }

    /// UIDs of unseen messages above `since_uid`, ascending.
    pub fn search_unseen_since(&mut self, since_uid: i64) -> Result<Vec<i64>, ImapError> {
        let resp = self.command(&format!("UID SEARCH UNSEEN UID {}:*", since_uid + 1))?;
        if !resp.is_ok() {
            return Err(format!("IMAP search failed: {}", resp.status_line()).into());
        }
        // `n:*` always includes the highest UID, even when it is <= n.
        let mut uids: Vec<i64> = resp
            .lines
            .iter()
            .filter(|l| l.starts_with("* SEARCH"))
            .flat_map(|l| l.split_whitespace().skip(2))
            .filter_map(|u| u.parse().ok())
            .filter(|&uid| uid > since_uid)
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    /// Full source of one message. `BODY.PEEK[]` leaves `\Seen` untouched.
    pub fn fetch_message(&mut self, uid: i64) -> Result<Option<Vec<u8>>, ImapError> {
        let mut resp = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if !resp.is_ok() {
            return Err(format!("IMAP fetch {uid} failed: {}", resp.status_line()).into());
        }
        Ok(resp.literals.pop())
    }

    pub fn mark_seen(&mut self, uid: i64) -> Result<(), ImapError> {
        let resp = self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        if !resp.is_ok() {
            return Err(format!("IMAP store {uid} failed: {}", resp.status_line()).into());
        }
        Ok(())
    }

    pub fn logout(&mut self) -> Result<(), ImapError> {
        self.command("LOGOUT").map(|_| ())
    }
}

/// `{123}` at the end of a line announces a literal of 123 bytes.
fn literal_length(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let start = line.rfind('{')?;
    line.strip_suffix('}')?[start + 1..].parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Run one search-and-fetch cycle on an open session.
pub fn fetch_with_session<S: Read + Write>(
    session: &mut ImapSession<S>,
    mailbox: &MailboxConfig,
    since_uid: i64,
    limit: usize,
) -> Result<Vec<FetchedEmail>, ImapError> {
    session.login(&mailbox.account, mailbox.password.expose_secret())?;
    session.select(&mailbox.folder)?;

    let uids = session.search_unseen_since(since_uid)?;
    debug!(account = %mailbox.account, since_uid, found = uids.len(), "IMAP search done");

    // A failed UID is skipped and stays unseen; the rest of the batch
    // is still returned.
    let mut results = Vec::new();
    for uid in uids.into_iter().take(limit) {
        let raw = match session.fetch_message(uid) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(uid, "FETCH returned no message body");
                continue;
            }
            Err(e) => {
                warn!(account = %mailbox.account, uid, "Skipping message: {e}");
                continue;
            }
        };
        let Some(email) = parse_email(uid, &raw) else {
            debug!(uid, "Unparseable message skipped");
            continue;
        };
        if let Err(e) = session.mark_seen(uid) {
            warn!(account = %mailbox.account, uid, "Failed to flag message as seen: {e}");
        }
        results.push(email);
    }

    let _ = session.logout();
    Ok(results)
}

/// Fetch unseen emails via raw IMAP over TLS (blocking, run in spawn_blocking).
fn fetch_unseen_imap(
    mailbox: &MailboxConfig,
    since_uid: i64,
    limit: usize,
) -> Result<Vec<FetchedEmail>, ImapError> {
    // Connect TCP
    let tcp = TcpStream::connect((&*mailbox.imap_host, mailbox.imap_port))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    // TLS via rustls
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(mailbox.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let tls = rustls::StreamOwned::new(conn, tcp);

    let mut session = ImapSession::start(tls)?;
    fetch_with_session(&mut session, mailbox, since_uid, limit)
}

// ── Message parsing ─────────────────────────────────────────────────

/// Parse an RFC822 message. `None` when the bytes are not a message.
pub fn parse_email(uid: i64, raw: &[u8]) -> Option<FetchedEmail> {
    let parsed = MessageParser::default().parse(raw)?;
    let (sender_name, sender_address) = extract_sender(&parsed);

    Some(FetchedEmail {
        uid,
        message_id: parsed.message_id().map(str::to_string),
        sender_name,
        sender_address,
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: strip_quoted_text(&extract_text(&parsed)),
        date: parsed
            .date()
            .map(mail_parser::DateTime::to_timestamp)
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
    })
}

/// Extract the sender display name and address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> (Option<String>, String) {
    let first = parsed.from().and_then(|addr| addr.first());
    let name = first
        .and_then(|a| a.name())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let address = first
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    (name, address)
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0)
        && !text.trim().is_empty()
    {
        return text.trim().to_string();
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
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    "(no readable content)".to_string()
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
    let result = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip quoted text from an email body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - "On ... wrote:" attribution lines and everything after
/// - "--- Original Message ---" separators and everything after
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        // Skip quoted lines (> prefix)
        if trimmed.starts_with('>') {
            continue;
        }

        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    // Trim trailing blank lines
    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[path = "email_tests.rs"]
mod tests;
