//! Minimal IMAP4rev1 client used as the inbound message source.
//!
//! Only the handful of commands the pipeline needs are spoken: LOGIN, SELECT,
//! UID SEARCH, UID FETCH, UID STORE, CLOSE and LOGOUT. Messages are fetched
//! with `BODY.PEEK[]` so that reading a message never marks it `\Seen`; only
//! an explicit `mark_consumed` does.

use log::{debug, error, info, warn};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::config::ImapSettings;
use crate::message::InboundMessage;
use crate::pipeline::MessageSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IO_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("{command} rejected: {text}")]
    Rejected { command: String, text: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid message UID: {0}")]
    InvalidUid(String),
}

/// Untagged data returned by one command, with any literals it carried.
#[derive(Debug, Default)]
pub struct Response {
    pub lines: Vec<String>,
    pub literals: Vec<Vec<u8>>,
}

/// One authenticated-or-not IMAP conversation over any byte stream.
pub struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap a connected stream and consume the server greeting.
    pub fn new(stream: S) -> Result<Self, ImapError> {
        let mut session = ImapSession {
            stream: BufReader::new(stream),
            next_tag: 0,
        };
        let greeting = session.read_line()?;
        debug!("[imap] greeting: {}", greeting);
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(ImapError::Protocol(format!("unexpected greeting: {}", greeting)));
        }
        Ok(session)
    }

    pub fn login(&mut self, user: &str, password: &str) -> Result<(), ImapError> {
        let args = [
            Arg::Raw("LOGIN ".to_string()),
            astring(user),
            Arg::Raw(" ".to_string()),
            astring(password),
        ];
        self.command_args("LOGIN", &args).map(|_| ())
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), ImapError> {
        let args = [Arg::Raw("SELECT ".to_string()), astring(mailbox)];
        self.command_args("SELECT", &args).map(|_| ())
    }

    /// UIDs of all messages without the `\Seen` flag.
    pub fn search_unseen(&mut self) -> Result<Vec<u32>, ImapError> {
        let resp = self.command("UID SEARCH", "UID SEARCH UNSEEN")?;
        let uids = resp
            .lines
            .iter()
            .filter_map(|line| line.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .collect();
        Ok(uids)
    }

    /// Raw RFC 822 bytes of one message, leaving its flags untouched.
    pub fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ImapError> {
        let cmd = format!("UID FETCH {} (BODY.PEEK[])", uid);
        let mut resp = self.command("UID FETCH", &cmd)?;
        if resp.literals.is_empty() {
            return Err(ImapError::Protocol(format!("no message body returned for UID {}", uid)));
        }
        Ok(resp.literals.swap_remove(0))
    }

    pub fn mark_seen(&mut self, uid: u32) -> Result<(), ImapError> {
        let cmd = format!("UID STORE {} +FLAGS (\\Seen)", uid);
        self.command("UID STORE", &cmd).map(|_| ())
    }

    pub fn logout(&mut self) -> Result<(), ImapError> {
        // CLOSE is refused when no mailbox is selected; LOGOUT still applies.
        match self.command("CLOSE", "CLOSE") {
            Ok(_) => {}
            Err(ImapError::Rejected { text, .. }) => debug!("[imap] CLOSE refused: {}", text),
            Err(e) => return Err(e),
        }
        self.command("LOGOUT", "LOGOUT").map(|_| ())
    }

    fn command(&mut self, label: &str, cmd: &str) -> Result<Response, ImapError> {
        self.command_args(label, &[Arg::Raw(cmd.to_string())])
    }

    /// Send one tagged command and collect everything up to its completion.
    ///
    /// `label` is what appears in logs and errors, so credentials never do.
    fn command_args(&mut self, label: &str, args: &[Arg]) -> Result<Response, ImapError> {
        self.next_tag += 1;
        let tag = format!("A{:04}", self.next_tag);
        debug!("[imap] {} {}", tag, label);

        let mut pending = format!("{} ", tag).into_bytes();
        for arg in args {
            match arg {
                Arg::Raw(text) => pending.extend_from_slice(text.as_bytes()),
                Arg::Literal(bytes) => {
                    pending.extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
                    self.send(&pending)?;
                    self.await_continuation(&tag, label)?;
                    pending = bytes.clone();
                }
            }
        }
        pending.extend_from_slice(b"\r\n");
        self.send(&pending)?;

        let mut resp = Response::default();
        loop {
            let line = self.read_line()?;

            if let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal)?;
                resp.literals.push(literal);
                resp.lines.push(line);
                continue;
            }

            if let Some(result) = completion(&line, &tag, label) {
                return result.map(|()| resp);
            }

            resp.lines.push(line);
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ImapError> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Wait for the `+` that allows a literal to be sent.
    fn await_continuation(&mut self, tag: &str, label: &str) -> Result<(), ImapError> {
        loop {
            let line = self.read_line()?;
            if line.starts_with('+') {
                return Ok(());
            }
            if let Some(result) = completion(&line, tag, label) {
                result?;
                return Err(ImapError::Protocol(format!(
                    "{} completed before its literal was sent",
                    label
                )));
            }
        }
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(ImapError::Protocol("connection closed by server".to_string()));
        }
        Ok(String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string())
    }
}

/// Size of the literal announced at the end of a response line, if any.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// Outcome of a tagged completion line for `tag`, or `None` for any other line.
fn completion(line: &str, tag: &str, label: &str) -> Option<Result<(), ImapError>> {
    let rest = line.strip_prefix(tag)?.strip_prefix(' ')?;
    let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
    Some(match status.to_ascii_uppercase().as_str() {
        "OK" => Ok(()),
        "NO" | "BAD" => Err(ImapError::Rejected {
            command: label.to_string(),
            text: text.to_string(),
        }),
        other => Err(ImapError::Protocol(format!(
            "unexpected completion {} for {}",
            other, label
        ))),
    })
}

/// One piece of a command line.
enum Arg {
    Raw(String),
    /// Sent as a synchronizing `{n}` literal.
    Literal(Vec<u8>),
}

/// Quoted string when 7-bit safe, literal otherwise.
fn astring(s: &str) -> Arg {
    if s.bytes().all(|b| b.is_ascii() && b != b'\r' && b != b'\n' && b != 0) {
        Arg::Raw(quote(s))
    } else {
        Arg::Literal(s.as_bytes().to_vec())
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

fn tls_config() -> Result<ClientConfig, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(config)
}

fn open_session(settings: &ImapSettings) -> Result<ImapSession<TlsStream>, ImapError> {
    let addr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ImapError::Protocol(format!("no address found for {}", settings.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    tcp.set_read_timeout(Some(IO_TIMEOUT))?;
    tcp.set_write_timeout(Some(IO_TIMEOUT))?;

    let server_name = ServerName::try_from(settings.host.clone())
        .map_err(|_| ImapError::InvalidServerName(settings.host.clone()))?;
    let conn = ClientConnection::new(Arc::new(tls_config()?), server_name)?;

    let mut session = ImapSession::new(StreamOwned::new(conn, tcp))?;
    session.login(&settings.login, &settings.password)?;
    Ok(session)
}

/// IMAPS mailbox acting as the pipeline's message source.
pub struct ImapSource {
    settings: ImapSettings,
    session: Option<ImapSession<TlsStream>>,
}

impl ImapSource {
    pub fn new(settings: ImapSettings) -> Self {
        ImapSource {
            settings,
            session: None,
        }
    }
}

impl MessageSource for ImapSource {
    fn connect(&mut self) -> bool {
        let attempts = self.settings.connect_retries.max(1);
        for attempt in 1..=attempts {
            info!(
                "[imap] connecting to {}:{} (attempt {}/{})",
                self.settings.host, self.settings.port, attempt, attempts
            );
            match open_session(&self.settings) {
                Ok(session) => {
                    self.session = Some(session);
                    info!("[imap] connected and logged in as {}", self.settings.login);
                    return true;
                }
                Err(e) => {
                    error!("[imap] attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        thread::sleep(self.settings.retry_delay);
                    }
                }
            }
        }
        error!("[imap] could not connect to the mail server after {} attempts", attempts);
        false
    }

    fn fetch_unconsumed(&mut self) -> Vec<InboundMessage> {
        let mailbox = self.settings.mailbox.clone();
        let Some(session) = self.session.as_mut() else {
            error!("[imap] no active connection");
            return Vec::new();
        };

        if let Err(e) = session.select(&mailbox) {
            error!("[imap] failed to select {}: {}", mailbox, e);
            return Vec::new();
        }
        let uids = match session.search_unseen() {
            Ok(uids) => uids,
            Err(e) => {
                error!("[imap] search for unseen messages failed: {}", e);
                return Vec::new();
            }
        };
        if uids.is_empty() {
            info!("[imap] no unseen messages in {}", mailbox);
            return Vec::new();
        }

        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            let raw = match session.fetch_raw(uid) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("[imap] failed to fetch UID {}: {}", uid, e);
                    continue;
                }
            };
            match InboundMessage::parse(&uid.to_string(), &raw) {
                Ok(msg) => messages.push(msg),
                Err(e) => error!("[imap] failed to parse UID {}: {}", uid, e),
            }
        }
        info!("[imap] fetched {} unseen messages from {}", messages.len(), mailbox);
        messages
    }

    fn mark_consumed(&mut self, id: &str) -> bool {
        let Some(session) = self.session.as_mut() else {
            error!("[imap] no active connection, cannot mark UID {} as seen", id);
            return false;
        };
        let result = id
            .parse::<u32>()
            .map_err(|_| ImapError::InvalidUid(id.to_string()))
            .and_then(|uid| session.mark_seen(uid));
        match result {
            Ok(()) => {
                debug!("[imap] UID {} marked as seen", id);
                true
            }
            Err(e) => {
                error!("[imap] failed to mark UID {} as seen: {}", id, e);
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.logout() {
                Ok(()) => info!("[imap] connection closed"),
                Err(e) => warn!("[imap] error while closing connection: {}", e),
            }
        }
    }
}
