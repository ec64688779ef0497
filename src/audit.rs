//! Daily-rotated CSV audit trail, one row per processed message.

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{debug, error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::pipeline::ProcessingOutcome;

const HEADER: [&str; 5] = [
    "timestamp",
    "status",
    "license_plate",
    "output_filename",
    "error_message",
];
const STATUS_SUCCESS: &str = "Успех";
const STATUS_FAILURE: &str = "Ошибка";
pub const MAX_ERROR_CHARS: usize = 500;

/// Append-only log handle; reopens on the first write of each new day.
pub struct AuditLog {
    dir: PathBuf,
    current_date: Option<NaiveDate>,
    writer: Option<csv::Writer<File>>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        AuditLog {
            dir: dir.into(),
            current_date: None,
            writer: None,
        }
    }

    /// Path of the log file for a given day.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("log_{}.csv", date.format("%Y-%m-%d")))
    }

    pub fn record(&mut self, outcome: &ProcessingOutcome) {
        self.record_at(Local::now().naive_local(), outcome);
    }

    /// Append one outcome row stamped with `now`.
    ///
    /// Write errors are logged and otherwise ignored so that one unwritable
    /// row never stops the batch.
    pub fn record_at(&mut self, now: NaiveDateTime, outcome: &ProcessingOutcome) {
        if let Err(e) = self.append(now, outcome) {
            error!("[audit] failed to write audit record: {}", e);
        }
    }

    fn append(&mut self, now: NaiveDateTime, outcome: &ProcessingOutcome) -> Result<(), csv::Error> {
        let date = now.date();
        let mut writer = match self.writer.take() {
            Some(writer) if self.current_date == Some(date) => writer,
            stale => {
                if let Some(mut old) = stale {
                    old.flush()?;
                    debug!("[audit] day changed, rotating log file");
                }
                let writer = open_writer(&self.dir, &self.path_for(date))?;
                self.current_date = Some(date);
                writer
            }
        };

        let (status, plate, filename, error) = match outcome {
            ProcessingOutcome::Success {
                license_plate,
                output_filename,
            } => (STATUS_SUCCESS, license_plate.as_str(), output_filename.as_str(), ""),
            ProcessingOutcome::Failure {
                license_plate,
                output_filename,
                error_message,
            } => (
                STATUS_FAILURE,
                license_plate.as_deref().unwrap_or(""),
                output_filename.as_deref().unwrap_or(""),
                error_message.as_str(),
            ),
        };
        let error = truncate_chars(error, MAX_ERROR_CHARS);
        let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();

        writer.write_record([timestamp.as_str(), status, plate, filename, error])?;
        writer.flush()?;
        self.writer = Some(writer);
        Ok(())
    }

    /// Flush and release the current file, if any.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("[audit] failed to flush audit log: {}", e);
            }
        }
        self.current_date = None;
    }
}

fn open_writer(dir: &Path, path: &Path) -> Result<csv::Writer<File>, csv::Error> {
    fs::create_dir_all(dir)?;
    let is_new = !path.is_file();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(HEADER)?;
        writer.flush()?;
        info!("[audit] created audit log {}", path.display());
    }
    Ok(writer)
}

/// First `max` characters of `s`, never splitting a character.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
