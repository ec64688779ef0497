//! DOCX memo rendering from a template with `{placeholder}` fields.
//!
//! A DOCX file is a ZIP archive; every `word/*.xml` part (body, headers,
//! footers) gets its placeholders replaced paragraph by paragraph, all other
//! entries are copied as they are.

use chrono::{Local, NaiveDate};
use log::{debug, error, info, warn};
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::extract::ExtractedRecord;
use crate::pipeline::DocumentRenderer;

const FILE_PREFIX: &str = "СЗ";
const DATE_FORMAT: &str = "%d.%m.%Y";
const DEFAULT_PLATE: &str = "Номер не указан";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template not found: {0}")]
    TemplateNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid DOCX archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid document XML in {part}: {message}")]
    Xml { part: String, message: String },
}

/// Renders the memo template into `<output_dir>/СЗ_<plate>_<YYMMDD>.docx`.
pub struct DocxRenderer {
    template_path: PathBuf,
    output_dir: PathBuf,
}

impl DocxRenderer {
    pub fn new(template_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        DocxRenderer {
            template_path: template_path.into(),
            output_dir: output_dir.into(),
        }
    }

    fn render_on(&self, record: &ExtractedRecord, today: NaiveDate) -> Result<PathBuf, RenderError> {
        if !self.template_path.is_file() {
            error!("[render] template not found: {}", self.template_path.display());
            return Err(RenderError::TemplateNotFound(self.template_path.clone()));
        }
        let template = fs::read(&self.template_path)?;

        let visit_date = normalize_visit_date(record.visit_date.as_deref(), today);
        let values = placeholder_values(record, visit_date, today);
        let plate = record.license_plate.as_deref().unwrap_or(DEFAULT_PLATE);
        let filename = output_filename(plate, &short_visit_date(record.visit_date.as_deref(), today));

        let document = fill_template(&template, &values)?;

        fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(&filename);
        fs::write(&path, document)?;
        info!("[render] memo saved: {}", path.display());
        Ok(path)
    }
}

impl DocumentRenderer for DocxRenderer {
    fn render(&self, record: &ExtractedRecord) -> Result<PathBuf, RenderError> {
        self.render_on(record, Local::now().date_naive())
    }
}

/// Parse `DD.MM.YYYY`, falling back to `today` when absent or malformed.
pub fn normalize_visit_date(value: Option<&str>, today: NaiveDate) -> NaiveDate {
    match value {
        None => today,
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).unwrap_or_else(|_| {
            warn!("[render] invalid visit date {:?}, using today's date", raw);
            today
        }),
    }
}

/// `YYMMDD` taken from the digits of a `DD.MM.YYYY` string as written.
///
/// The string is not checked against the calendar, so `31.02.2025` still
/// gives `250231` and a message always maps to the same file name. Anything
/// else falls back to `today`.
pub fn short_visit_date(value: Option<&str>, today: NaiveDate) -> String {
    match value.map(str::trim).and_then(date_parts) {
        Some((day, month, year)) => format!("{}{}{}", &year[2..], month, day),
        None => today.format("%y%m%d").to_string(),
    }
}

fn date_parts(raw: &str) -> Option<(&str, &str, &str)> {
    let mut parts = raw.split('.');
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    let digits = |p: &str, len: usize| p.len() == len && p.bytes().all(|b| b.is_ascii_digit());
    if parts.next().is_none() && digits(day, 2) && digits(month, 2) && digits(year, 4) {
        Some((day, month, year))
    } else {
        None
    }
}

/// Deterministic memo file name for a plate and a `YYMMDD` date.
pub fn output_filename(license_plate: &str, short_date: &str) -> String {
    let plate: String = license_plate.split_whitespace().collect();
    format!("{}_{}_{}.docx", FILE_PREFIX, plate, short_date)
}

/// Placeholder/value pairs; absent fields get their printed defaults.
fn placeholder_values(
    record: &ExtractedRecord,
    visit_date: NaiveDate,
    today: NaiveDate,
) -> Vec<(&'static str, String)> {
    fn or(value: &Option<String>, default: &str) -> String {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    vec![
        ("{current_date}", today.format(DATE_FORMAT).to_string()),
        ("{vehicle}", or(&record.vehicle, "Автомобиль не указан")),
        ("{license_plate}", or(&record.license_plate, DEFAULT_PLATE)),
        ("{driver_name}", or(&record.driver_name, "ФИО не указано")),
        ("{driver_phone}", or(&record.driver_phone, "Телефон не указан")),
        ("{visit_date}", visit_date.format(DATE_FORMAT).to_string()),
        ("{visit_time_start}", or(&record.visit_time_start, "время не указано")),
        ("{visit_time_end}", or(&record.visit_time_end, "время не указано")),
        ("{visit_purpose}", or(&record.visit_purpose, "Цель не указана")),
    ]
}

/// Copy a DOCX archive, substituting placeholders in its Word XML parts.
pub fn fill_template(template: &[u8], values: &[(&str, String)]) -> Result<Vec<u8>, RenderError> {
    let mut archive = ZipArchive::new(Cursor::new(template))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if entry.is_dir() {
            writer.add_directory(name, deflated())?;
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        if name.starts_with("word/") && name.ends_with(".xml") {
            debug!("[render] filling placeholders in {}", name);
            data = replace_placeholders(&data, values).map_err(|message| RenderError::Xml {
                part: name.clone(),
                message,
            })?;
        }

        writer.start_file(name, deflated())?;
        writer.write_all(&data)?;
    }

    Ok(writer.finish()?.into_inner())
}

fn deflated() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

enum Mark {
    ParagraphStart,
    ParagraphEnd,
    Eof,
    Other,
}

/// Replace placeholders inside each `<w:p>` of a WordprocessingML part.
///
/// Word splits text into runs freely, so a placeholder may span several
/// `<w:t>` elements. A paragraph that holds a placeholder gets its whole
/// replaced text written into its first `<w:t>`; the others are emptied.
/// Paragraphs without placeholders are written back untouched.
pub fn replace_placeholders(xml: &[u8], values: &[(&str, String)]) -> Result<Vec<u8>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::new());
    let mut paragraph: Vec<Event> = Vec::new();
    let mut depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let mark = match &event {
            Event::Start(e) if e.name().as_ref() == b"w:p" => Mark::ParagraphStart,
            Event::End(e) if e.name().as_ref() == b"w:p" => Mark::ParagraphEnd,
            Event::Eof => Mark::Eof,
            _ => Mark::Other,
        };

        match mark {
            Mark::Eof => break,
            Mark::ParagraphStart => {
                depth += 1;
                paragraph.push(event);
            }
            Mark::ParagraphEnd if depth > 0 => {
                depth -= 1;
                paragraph.push(event);
                if depth == 0 {
                    for ev in rewrite_paragraph(std::mem::take(&mut paragraph), values) {
                        writer.write_event(ev).map_err(|e| e.to_string())?;
                    }
                }
            }
            _ if depth > 0 => paragraph.push(event),
            _ => writer.write_event(event).map_err(|e| e.to_string())?,
        }
    }

    // Unbalanced input: flush whatever is left as it was.
    for ev in paragraph {
        writer.write_event(ev).map_err(|e| e.to_string())?;
    }
    Ok(writer.into_inner())
}

fn is_text_run(e: &BytesStart) -> bool {
    e.name().as_ref() == b"w:t"
}

fn rewrite_paragraph<'a>(events: Vec<Event<'a>>, values: &[(&str, String)]) -> Vec<Event<'a>> {
    let text = paragraph_text(&events);
    if !values.iter().any(|(placeholder, _)| text.contains(placeholder)) {
        return events;
    }

    let replaced = values
        .iter()
        .fold(text, |acc, (placeholder, value)| acc.replace(placeholder, value));

    let mut out = Vec::with_capacity(events.len());
    let mut in_text = false;
    let mut written = false;
    for event in events {
        let (opens_text, closes_text) = match &event {
            Event::Start(e) => (is_text_run(e), false),
            Event::End(e) => (false, e.name().as_ref() == b"w:t"),
            _ => (false, false),
        };

        if opens_text {
            in_text = true;
            if written {
                out.push(event);
            } else {
                out.push(Event::Start(
                    BytesStart::new("w:t").with_attributes([("xml:space", "preserve")]),
                ));
                out.push(Event::Text(BytesText::new(&replaced).into_owned()));
                written = true;
            }
        } else if closes_text {
            in_text = false;
            out.push(event);
        } else if !(in_text && matches!(event, Event::Text(_) | Event::GeneralRef(_))) {
            out.push(event);
        }
    }
    out
}

/// Concatenated, unescaped text of every `<w:t>` in a paragraph.
fn paragraph_text(events: &[Event]) -> String {
    let mut raw = String::new();
    let mut in_text = false;
    for event in events {
        match event {
            Event::Start(e) if is_text_run(e) => in_text = true,
            Event::End(e) if e.name().as_ref() == b"w:t" => in_text = false,
            Event::Text(t) if in_text => raw.push_str(&String::from_utf8_lossy(t)),
            Event::GeneralRef(r) if in_text => {
                raw.push('&');
                raw.push_str(&String::from_utf8_lossy(r));
                raw.push(';');
            }
            _ => {}
        }
    }
    match quick_xml::escape::unescape(&raw) {
        Ok(Cow::Borrowed(_)) => raw,
        Ok(Cow::Owned(text)) => text,
        Err(_) => raw,
    }
}

/// File name part of a rendered artifact path.
pub fn artifact_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
