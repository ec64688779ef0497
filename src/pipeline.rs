//! Per-message processing: extract, validate, render, dispatch, consume.
//!
//! A message is marked consumed only after its memo has been rendered and
//! delivered. Any failure before that leaves it unconsumed so the next run
//! picks it up again; rendering is a pure function of the message content and
//! overwrites the same file, so retries are safe.

use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::audit::{truncate_chars, AuditLog, MAX_ERROR_CHARS};
use crate::dispatch::DispatchError;
use crate::extract::{extract, ExtractedRecord};
use crate::message::InboundMessage;
use crate::render::{artifact_name, RenderError};

/// Supplies unconsumed inbound messages and accepts acknowledgements.
pub trait MessageSource {
    /// Establish the connection, retrying a bounded number of times.
    fn connect(&mut self) -> bool;
    /// All pending messages; empty when there are none or on fetch errors.
    fn fetch_unconsumed(&mut self) -> Vec<InboundMessage>;
    fn mark_consumed(&mut self, id: &str) -> bool;
    /// Best-effort; never fails.
    fn disconnect(&mut self);
}

pub trait DocumentRenderer {
    fn render(&self, record: &ExtractedRecord) -> Result<PathBuf, RenderError>;
}

pub trait Dispatcher {
    fn dispatch(
        &self,
        destination: &str,
        license_plate: &str,
        visit_date: &str,
        artifact: &Path,
    ) -> Result<(), DispatchError>;
}

/// Why a single message could not be handled.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("MissingRequiredField: {0}")]
    MissingRequiredField(String),

    #[error("RenderFailure: {0}")]
    Render(#[from] RenderError),

    #[error("DispatchFailure: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("UnexpectedFailure: {0}")]
    Unexpected(String),
}

/// Why a whole run stopped early.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("ConnectionFailure: could not connect to the mail server")]
    Connection,

    #[error("UnexpectedFailure: {0}")]
    Unexpected(String),
}

/// Terminal result for exactly one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success {
        license_plate: String,
        output_filename: String,
    },
    Failure {
        license_plate: Option<String>,
        output_filename: Option<String>,
        error_message: String,
    },
}

impl ProcessingOutcome {
    fn failure(license_plate: Option<String>, output_filename: Option<String>, error: &str) -> Self {
        ProcessingOutcome::Failure {
            license_plate,
            output_filename,
            error_message: truncate_chars(error, MAX_ERROR_CHARS).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success { .. })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Fields that must be present before anything is rendered.
struct Required<'a> {
    license_plate: &'a str,
    visit_date: &'a str,
}

fn validate(record: &ExtractedRecord) -> Result<Required<'_>, ProcessError> {
    let missing: Vec<&str> = [
        ("license_plate", record.license_plate.is_none()),
        ("visit_date", record.visit_date.is_none()),
    ]
    .iter()
    .filter(|(_, absent)| *absent)
    .map(|(name, _)| *name)
    .collect();

    match (&record.license_plate, &record.visit_date) {
        (Some(license_plate), Some(visit_date)) => Ok(Required {
            license_plate,
            visit_date,
        }),
        _ => Err(ProcessError::MissingRequiredField(missing.join(", "))),
    }
}

/// Pulls messages from a source and drives each one to a terminal outcome.
pub struct Pipeline<S: MessageSource, R: DocumentRenderer, D: Dispatcher> {
    source: S,
    renderer: R,
    dispatcher: D,
    audit: AuditLog,
    recipient: String,
    finished: bool,
}

impl<S: MessageSource, R: DocumentRenderer, D: Dispatcher> Pipeline<S, R, D> {
    pub fn new(source: S, renderer: R, dispatcher: D, audit: AuditLog, recipient: impl Into<String>) -> Self {
        Pipeline {
            source,
            renderer,
            dispatcher,
            audit,
            recipient: recipient.into(),
            finished: false,
        }
    }

    /// Process every pending message once, then release the source and log.
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_batch()));
        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                let detail = format!(
                    "Критическая ошибка в основном цикле: {}",
                    panic_message(payload.as_ref())
                );
                error!("[pipeline] {}", detail);
                let err = RunError::Unexpected(detail);
                self.audit
                    .record(&ProcessingOutcome::failure(None, None, &err.to_string()));
                Err(err)
            }
        };
        self.finish();
        result
    }

    fn run_batch(&mut self) -> Result<RunSummary, RunError> {
        if !self.source.connect() {
            let err = RunError::Connection;
            error!("[pipeline] {}", err);
            self.audit
                .record(&ProcessingOutcome::failure(None, None, &err.to_string()));
            return Err(err);
        }

        let messages = self.source.fetch_unconsumed();
        if messages.is_empty() {
            info!("[pipeline] no new messages");
        }

        let mut summary = RunSummary::default();
        for msg in &messages {
            info!(
                "[pipeline] processing message {} from {:?}, subject {:?}",
                msg.id, msg.from, msg.subject
            );
            debug!("[pipeline] message {} received at {}", msg.id, msg.received);

            let outcome = self.process(msg);
            match &outcome {
                ProcessingOutcome::Success { license_plate, .. } => {
                    info!("[pipeline] message {} processed: {}", msg.id, license_plate)
                }
                ProcessingOutcome::Failure { error_message, .. } => {
                    error!("[pipeline] message {} failed: {}", msg.id, error_message)
                }
            }
            if outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            self.audit.record(&outcome);
            summary.processed += 1;
        }

        info!(
            "[pipeline] run complete: {} processed, {} succeeded, {} failed",
            summary.processed, summary.succeeded, summary.failed
        );
        Ok(summary)
    }

    /// Drive one message to its outcome, consuming it only on success.
    ///
    /// A panic in any collaborator becomes an `UnexpectedFailure` that still
    /// carries the plate and, once rendered, the output file name.
    pub fn process(&mut self, msg: &InboundMessage) -> ProcessingOutcome {
        let record = extract(&msg.body, &msg.subject);
        let mut output_filename = None;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.deliver(msg, &record, &mut output_filename)
        }))
        .unwrap_or_else(|payload| Err(ProcessError::Unexpected(panic_message(payload.as_ref()))));

        match result {
            Ok(license_plate) => ProcessingOutcome::Success {
                license_plate,
                output_filename: output_filename.unwrap_or_default(),
            },
            Err(err) => ProcessingOutcome::failure(
                record.license_plate.clone(),
                output_filename,
                &err.to_string(),
            ),
        }
    }

    fn deliver(
        &mut self,
        msg: &InboundMessage,
        record: &ExtractedRecord,
        output_filename: &mut Option<String>,
    ) -> Result<String, ProcessError> {
        let required = validate(record)?;

        let artifact = self.renderer.render(record)?;
        *output_filename = Some(artifact_name(&artifact));

        self.dispatcher.dispatch(
            &self.recipient,
            required.license_plate,
            required.visit_date,
            &artifact,
        )?;

        // The memo is already sent; a message we fail to mark may be
        // processed again on the next run.
        if !self.source.mark_consumed(&msg.id) {
            warn!(
                "[pipeline] message {} was delivered but not marked consumed; it may be reprocessed",
                msg.id
            );
        }
        Ok(required.license_plate.to_string())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.source.disconnect();
        self.audit.close();
    }
}

impl<S: MessageSource, R: DocumentRenderer, D: Dispatcher> Drop for Pipeline<S, R, D> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
