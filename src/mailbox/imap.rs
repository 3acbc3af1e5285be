//! Raw IMAP over TLS — blocking, run under `spawn_blocking`.
//!
//! Speaks just enough IMAP for cursor-based polling: LOGIN, SELECT,
//! UID SEARCH, UID FETCH, UID STORE, LOGOUT.

use std::io::{Read as IoRead, Write as IoWrite};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::FetchItem;
use crate::pipeline::types::RawMessage;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A logged-in IMAP session with a selected folder.
struct ImapSession {
    stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
    host: String,
    tag: u32,
}

impl ImapSession {
    /// Connect, read the greeting, and log in.
    fn open(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| MailboxError::Transient(format!("connect {}: {e}", config.host)))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| MailboxError::Transient(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.host.clone()).map_err(|e| {
                MailboxError::Protocol {
                    host: config.host.clone(),
                    reason: format!("invalid server name: {e}"),
                }
            })?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Transient(format!("TLS setup: {e}")))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            host: config.host.clone(),
            tag: 0,
        };

        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !tagged_ok(&login) {
            return Err(MailboxError::Auth {
                mailbox: config.id.clone(),
            });
        }

        Ok(session)
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let response = self.command(&format!("SELECT \"{folder}\""))?;
        if !tagged_ok(&response) {
            return Err(self.protocol(format!("SELECT {folder} failed")));
        }
        Ok(())
    }

    /// Send one tagged command and collect lines through its tagged reply.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailboxError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        let full = format!("{tag} {cmd}\r\n");
        self.stream
            .write_all(full.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| MailboxError::Transient(format!("write: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(MailboxError::Transient("connection closed".into()));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(MailboxError::Transient(format!("read: {e}"))),
            }
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }

    fn protocol(&self, reason: String) -> MailboxError {
        MailboxError::Protocol {
            host: self.host.clone(),
            reason,
        }
    }
}

/// Whether the tagged reply (last line) reports OK.
fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .is_some_and(|l| l.split_whitespace().nth(1) == Some("OK"))
}

/// Fetch all messages with UID strictly greater than `since_uid`, ascending.
pub(crate) fn fetch_since(
    config: &MailboxConfig,
    folder: &str,
    since_uid: u32,
) -> Result<Vec<FetchItem>, MailboxError> {
    let mut session = ImapSession::open(config)?;
    session.select(folder)?;

    let search = session.command(&format!("UID SEARCH UID {}:*", since_uid + 1))?;
    let mut uids: Vec<u32> = Vec::new();
    for line in &search {
        if let Some(rest) = line.strip_prefix("* SEARCH") {
            uids.extend(rest.split_whitespace().filter_map(|t| t.parse::<u32>().ok()));
        }
    }
    // A `n:*` range always returns the highest existing UID, even when it is
    // below the requested floor; drop anything at or under the cursor.
    uids.retain(|uid| *uid > since_uid);
    uids.sort_unstable();

    let mut items = Vec::with_capacity(uids.len());
    for uid in uids {
        let response = session.command(&format!("UID FETCH {uid} (RFC822)"))?;
        if !tagged_ok(&response) {
            session.logout();
            return Err(MailboxError::Transient(format!("UID FETCH {uid} failed")));
        }

        // Everything between the untagged FETCH line and the closing line is
        // the message literal.
        let raw: String = response
            .iter()
            .skip(1)
            .take(response.len().saturating_sub(3))
            .cloned()
            .collect();

        items.push(parse_message(config, folder, uid, raw.as_bytes()));
    }

    session.logout();
    Ok(items)
}

/// Mark the given UIDs `\Seen`.
pub(crate) fn mark_seen(
    config: &MailboxConfig,
    folder: &str,
    uids: &[u32],
) -> Result<(), MailboxError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut session = ImapSession::open(config)?;
    session.select(folder)?;

    let set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let response = session.command(&format!("UID STORE {set} +FLAGS (\\Seen)"))?;
    let ok = tagged_ok(&response);
    session.logout();
    if ok {
        Ok(())
    } else {
        Err(MailboxError::Transient("UID STORE failed".into()))
    }
}

/// Parse one RFC822 literal into a `RawMessage`, or a Malformed item when
/// the parser cannot make sense of it.
fn parse_message(config: &MailboxConfig, folder: &str, uid: u32, raw: &[u8]) -> FetchItem {
    let parsed = MessageParser::default().parse(raw);
    // The parser is lenient; headerless garbage still yields a Message.
    // Require at least one identifying header before trusting the parse.
    let usable = parsed.as_ref().is_some_and(|p| {
        p.message_id().is_some() || p.from().is_some() || p.subject().is_some()
    });
    let Some(parsed) = parsed.filter(|_| usable) else {
        return FetchItem::Malformed {
            uid,
            message_id: format!("malformed-{folder}-{uid}"),
            reason: "unparseable RFC822 payload".into(),
        };
    };

    let message_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(&parsed);

    FetchItem::Message(RawMessage {
        mailbox: config.id.clone(),
        folder: folder.to_string(),
        uid,
        message_id,
        sender,
        subject,
        body,
        fetched_at: chrono::Utc::now(),
    })
}

/// Extract readable text: plain part first, HTML part stripped as fallback.
fn extract_text(parsed: &mail_parser::Message<'_>) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
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
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
