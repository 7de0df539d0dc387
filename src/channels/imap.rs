//! IMAP message source: raw IMAP over rustls, MIME via mail-parser.
//!
//! Fetching uses `EXAMINE` and `BODY.PEEK[]`, so it never sets `\Seen`.
//! Marking read is a separate `UID STORE` after the sink has the row.
//! All socket I/O is blocking and runs on `spawn_blocking`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::config::{Lookup, parse_or, process_env, required};
use crate::error::{ConfigError, SourceError};
use crate::pipeline::types::{AttachmentMeta, Message, MessageSource};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

impl ImapConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: required(lookup, "EMAIL_IMAP_HOST")?,
            port: parse_or(lookup, "EMAIL_IMAP_PORT", 993u16)?,
            username: required(lookup, "EMAIL_USERNAME")?,
            password: SecretString::from(required(lookup, "EMAIL_PASSWORD")?),
        })
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Where a fetched message lives on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    folder: String,
    uid: u32,
}

/// [`MessageSource`] backed by an IMAP mailbox.
pub struct ImapSource {
    config: Arc<ImapConfig>,
    /// Message id → server location, filled by `fetch_unread`.
    locations: Arc<Mutex<HashMap<String, Location>>>,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
            locations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn location_of(&self, id: &str) -> Result<Location, SourceError> {
        let guard = self
            .locations
            .lock()
            .map_err(|_| SourceError::Protocol("location map poisoned".into()))?;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::UnknownMessage(id.to_string()))
    }
}

#[async_trait]
impl MessageSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_unread(
        &self,
        max_results: usize,
        folders: &[String],
    ) -> Result<Vec<Message>, SourceError> {
        let config = Arc::clone(&self.config);
        let folders = folders.to_vec();

        let fetched = tokio::task::spawn_blocking(move || {
            fetch_unseen(&config, max_results, &folders)
        })
        .await
        .map_err(|e| SourceError::Protocol(format!("IMAP fetch task panicked: {e}")))??;

        let mut locations = self
            .locations
            .lock()
            .map_err(|_| SourceError::Protocol("location map poisoned".into()))?;
        let messages = fetched
            .into_iter()
            .map(|(location, message)| {
                locations.insert(message.id.clone(), location);
                message
            })
            .collect::<Vec<_>>();

        info!(count = messages.len(), host = %self.config.host, "Fetched unread messages");
        Ok(messages)
    }

    async fn mark_read(&self, id: &str) -> Result<(), SourceError> {
        let location = self.location_of(id)?;
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || store_seen(&config, &location))
            .await
            .map_err(|e| SourceError::Protocol(format!("IMAP store task panicked: {e}")))??;

        debug!(id, "Marked read");
        Ok(())
    }
}

// ── IMAP session (blocking) ─────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One tagged response: untagged lines, literals, and the final status line.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
    status: String,
}

impl Response {
    fn is_ok(&self) -> bool {
        self.status
            .split_whitespace()
            .nth(1)
            .is_some_and(|s| s.eq_ignore_ascii_case("OK"))
    }
}

struct Session {
    tls: TlsStream,
    tag: u32,
}

impl Session {
    fn connect(config: &ImapConfig) -> Result<Self, SourceError> {
        let connection_error = |reason: String| SourceError::Connection {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connection_error(e.to_string()))?;
        tcp.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        tcp.set_write_timeout(Some(SOCKET_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| connection_error(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connection_error(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(connection_error(format!("unexpected greeting: {}", greeting.trim())));
        }

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !login.is_ok() {
            return Err(SourceError::Auth(login.status.trim().to_string()));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte)? {
                0 => return Err(SourceError::Protocol("IMAP connection closed".into())),
                _ => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
            }
        }
    }

    fn command(&mut self, cmd: &str) -> Result<Response, SourceError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.tls.read_exact(&mut literal)?;
                response.literals.push(literal);
                response.lines.push(line);
                continue;
            }
            if line.starts_with(&format!("{tag} ")) {
                response.status = line;
                return Ok(response);
            }
            response.lines.push(line);
        }
    }

    /// Like [`command`](Self::command) but a non-OK status is an error.
    fn expect_ok(&mut self, cmd: &str) -> Result<Response, SourceError> {
        let response = self.command(cmd)?;
        if response.is_ok() {
            Ok(response)
        } else {
            let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
            Err(SourceError::Protocol(format!(
                "{verb} failed: {}",
                response.status.trim()
            )))
        }
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }
}

fn fetch_unseen(
    config: &ImapConfig,
    max_results: usize,
    folders: &[String],
) -> Result<Vec<(Location, Message)>, SourceError> {
    let mut session = Session::connect(config)?;
    let mut results = Vec::new();

    'folders: for folder in folders {
        session.expect_ok(&format!("EXAMINE {}", quote(folder)))?;
        let search = session.expect_ok("UID SEARCH UNSEEN")?;
        let uids = parse_search(&search.lines);
        debug!(folder = %folder, unseen = uids.len(), "Searched folder");

        for uid in uids {
            if results.len() >= max_results {
                break 'folders;
            }
            let fetch = session.expect_ok(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
            let Some(raw) = fetch.literals.first() else {
                warn!(folder = %folder, uid, "FETCH returned no body, skipping");
                continue;
            };
            match parse_message(raw, folder, uid) {
                Some(message) => results.push((
                    Location {
                        folder: folder.clone(),
                        uid,
                    },
                    message,
                )),
                None => warn!(folder = %folder, uid, "Unparseable message, skipping"),
            }
        }
    }

    session.logout();
    Ok(results)
}

fn store_seen(config: &ImapConfig, location: &Location) -> Result<(), SourceError> {
    let mut session = Session::connect(config)?;
    session.expect_ok(&format!("SELECT {}", quote(&location.folder)))?;
    session.expect_ok(&format!("UID STORE {} +FLAGS (\\Seen)", location.uid))?;
    session.logout();
    Ok(())
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Quote an IMAP string argument.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Byte length of a literal announced at the end of `line` (`... {123}\r\n`).
pub fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches("\r\n");
    let open = line.rfind('{')?;
    let inner = line[open + 1..].strip_suffix('}')?;
    inner.trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` lines, ascending.
pub fn parse_search(lines: &[String]) -> Vec<u32> {
    let mut uids: Vec<u32> = lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|u| u.parse().ok()))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build a [`Message`] from raw RFC 822 bytes.
///
/// Messages without a `Message-ID` get a stable id derived from folder and
/// UID, so the same message maps to the same id on every run.
pub fn parse_message(raw: &[u8], folder: &str, uid: u32) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let id = parsed
        .message_id()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("uid-{folder}-{uid}"));

    let timestamp = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let attachments = parsed
        .attachments()
        .map(|part| AttachmentMeta {
            name: part.attachment_name().unwrap_or_default().to_string(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into()),
            size: part.contents().len(),
        })
        .collect();

    Some(Message {
        id,
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or_default().to_string(),
        timestamp,
        body: extract_text(&parsed),
        size: raw.len(),
        attachments,
        folder: Some(folder.to_string()),
    })
}

/// `Name <address>` when a display name exists, else the bare address.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => {
            format!("{} <{address}>", name.trim())
        }
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Readable text: plain part, else de-tagged HTML, else empty.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}
