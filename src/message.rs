//! Inbound message snapshots and plain-text body assembly.

use chrono::{DateTime, Local, TimeZone};
use log::{debug, warn};
use mailparse::{DispositionType, MailParseError, ParsedMail};
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use std::sync::OnceLock;

/// Immutable snapshot of one mailbox item taken at fetch time.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Source-stable identifier (the IMAP UID).
    pub id: String,
    pub from: String,
    pub subject: String,
    pub received: DateTime<Local>,
    /// Plain-text body, preferring `text/plain` over `text/html`.
    pub body: String,
}

impl InboundMessage {
    /// Build a snapshot from a raw RFC 822 message.
    pub fn parse(id: &str, raw: &[u8]) -> Result<InboundMessage, MailParseError> {
        let parsed = mailparse::parse_mail(raw)?;

        let from = header(&parsed, "From").unwrap_or_default();
        let subject = header(&parsed, "Subject").unwrap_or_default();
        let date = header(&parsed, "Date").unwrap_or_default();
        let received = parse_date(&date).unwrap_or_else(|| {
            warn!("[message] invalid Date header {:?} in message {}, using current time", date, id);
            Local::now()
        });
        let body = extract_body(&parsed);
        debug!("[message] parsed message {} ({} body chars)", id, body.chars().count());

        Ok(InboundMessage {
            id: id.to_string(),
            from,
            subject,
            received,
            body,
        })
    }

    /// Wrap free text that carries no mail headers at all.
    pub fn from_text(id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            from: String::new(),
            subject: String::new(),
            received: Local::now(),
            body: normalize_newlines(text).trim().to_string(),
        }
    }
}

static HEADER_LINE: OnceLock<Regex> = OnceLock::new();

fn header_line_re() -> &'static Regex {
    HEADER_LINE.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]+:").expect("Invalid regex"))
}

/// True when the first line of `raw` looks like an RFC 822 header.
pub fn looks_like_rfc822(raw: &str) -> bool {
    raw.lines()
        .next()
        .map(|line| header_line_re().is_match(line))
        .unwrap_or(false)
}

fn header(parsed: &ParsedMail, name: &str) -> Option<String> {
    parsed
        .headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case(name))
        .map(|h| h.get_value().trim().to_string())
}

fn parse_date(value: &str) -> Option<DateTime<Local>> {
    if value.is_empty() {
        return None;
    }
    let ts = mailparse::dateparse(value).ok()?;
    Local.timestamp_opt(ts, 0).single()
}

fn extract_body(parsed: &ParsedMail) -> String {
    let body = if let Some(text) = find_body_part(parsed, "text/plain") {
        text
    } else if let Some(html) = find_body_part(parsed, "text/html") {
        html_to_text(&html)
    } else {
        parsed.get_body().unwrap_or_default()
    };
    normalize_newlines(&body).trim().to_string()
}

fn find_body_part(parsed: &ParsedMail, mime_type: &str) -> Option<String> {
    if parsed.get_content_disposition().disposition == DispositionType::Attachment {
        return None;
    }
    if parsed.subparts.is_empty() {
        if parsed.ctype.mimetype.eq_ignore_ascii_case(mime_type) {
            return parsed.get_body().ok().filter(|b| !b.trim().is_empty());
        }
        return None;
    }
    parsed
        .subparts
        .iter()
        .find_map(|part| find_body_part(part, mime_type))
}

/// Elements whose text never belongs to the message body.
const SKIPPED_ELEMENTS: &[&str] = &["head", "title", "style", "script"];
/// Elements that end a line of text.
const LINE_ELEMENTS: &[&str] = &[
    "br", "p", "div", "tr", "li", "ul", "ol", "table", "blockquote", "h1", "h2", "h3", "h4",
    "h5", "h6",
];

/// Reduce an HTML body to its text lines, with all entities decoded.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();
    collect_text(document.root_element(), &mut text);
    text.replace('\u{a0}', " ")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_ELEMENTS.contains(&name) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, out);
                }
            }
            _ => {}
        }
    }
    if LINE_ELEMENTS.contains(&name) {
        out.push('\n');
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract;
    use chrono::Datelike;

    #[test]
    fn parses_plain_message() {
        let raw = b"From: Sender <sender@example.com>\r\nSubject: =?UTF-8?B?0J/RgNC+0L/Rg9GB0Lo=?=\r\nDate: Fri, 05 Dec 2025 10:00:00 +0300\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nHello\r\nWorld\r\n";
        let msg = InboundMessage::parse("42", raw).unwrap();
        assert_eq!(msg.id, "42");
        assert_eq!(msg.from, "Sender <sender@example.com>");
        assert_eq!(msg.subject, "Пропуск");
        assert_eq!(msg.received.year(), 2025);
        assert_eq!(msg.body, "Hello\nWorld");
    }

    #[test]
    fn prefers_plain_over_html() {
        let raw = b"Subject: x\r\nContent-Type: multipart/alternative; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/html\r\n\r\n<p>html body</p>\r\n--b\r\nContent-Type: text/plain\r\n\r\nplain body\r\n--b--\r\n";
        let msg = InboundMessage::parse("1", raw).unwrap();
        assert_eq!(msg.body, "plain body");
    }

    #[test]
    fn falls_back_to_html_text() {
        let raw = b"Subject: x\r\nContent-Type: text/html\r\n\r\n<html><head><style>p{}</style></head><body><p>line one</p>line&nbsp;two<br>three</body></html>\r\n";
        let msg = InboundMessage::parse("1", raw).unwrap();
        assert_eq!(msg.body, "line one\nline two\nthree");
    }

    #[test]
    fn html_entities_are_decoded() {
        let raw = "Subject: x\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<div>Марка ТС: КАМАЗ 65115&nbsp;&mdash; самосвал</div><div>&#1040;123&#1042;&#1057;77 05.12.2025</div><p>Цель: &laquo;Доставка&raquo;</p>\r\n";
        let msg = InboundMessage::parse("1", raw.as_bytes()).unwrap();
        assert_eq!(
            msg.body,
            "Марка ТС: КАМАЗ 65115 — самосвал\nА123ВС77 05.12.2025\nЦель: «Доставка»"
        );

        let record = extract(&msg.body, &msg.subject);
        assert_eq!(record.vehicle.as_deref(), Some("КАМАЗ 65115"));
        assert_eq!(record.license_plate.as_deref(), Some("А123ВС77"));
        assert_eq!(record.visit_purpose.as_deref(), Some("«Доставка»"));
    }

    #[test]
    fn skips_text_attachments() {
        let raw = b"Subject: x\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\nContent-Disposition: attachment; filename=\"a.txt\"\r\n\r\nattached\r\n--b\r\nContent-Type: text/plain\r\n\r\ninline\r\n--b--\r\n";
        let msg = InboundMessage::parse("1", raw).unwrap();
        assert_eq!(msg.body, "inline");
    }

    #[test]
    fn missing_date_falls_back_to_now() {
        let raw = b"Subject: x\r\n\r\nbody\r\n";
        let before = Local::now();
        let msg = InboundMessage::parse("1", raw).unwrap();
        assert!(msg.received >= before - chrono::Duration::seconds(1));
    }

    #[test]
    fn detects_rfc822_header_line() {
        assert!(looks_like_rfc822("From: a@b.c\n\nbody"));
        assert!(!looks_like_rfc822("Автомобиль: Toyota Camry\nа123вс77"));
        assert!(!looks_like_rfc822(""));
    }

    #[test]
    fn from_text_normalizes_newlines() {
        let msg = InboundMessage::from_text("stdin", "a\r\nb\r\n");
        assert_eq!(msg.body, "a\nb");
        assert!(msg.subject.is_empty());
    }
}
