use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::{debug, error, info};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::SmtpSettings;
use crate::pipeline::Dispatcher;
use crate::render::artifact_name;

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const STARTTLS_PORT: u16 = 587;
const AUTH_FAILURE_CODES: &[&str] = &["530", "534", "535"];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("attachment not found: {0}")]
    MissingArtifact(PathBuf),

    #[error("failed to read attachment: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("SMTP authentication failed: {0}")]
    Authentication(String),

    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),
}

/// Sends pass requests with the memo attached through an authenticated relay.
pub struct SmtpDispatcher {
    settings: SmtpSettings,
    body: String,
}

impl SmtpDispatcher {
    pub fn new(settings: SmtpSettings, body: impl Into<String>) -> Self {
        SmtpDispatcher {
            settings,
            body: body.into(),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, DispatchError> {
        let builder = if self.settings.port == STARTTLS_PORT {
            SmtpTransport::starttls_relay(&self.settings.host)
        } else {
            SmtpTransport::relay(&self.settings.host)
        }
        .map_err(|e| DispatchError::Transport(e.to_string()))?;

        Ok(builder
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.login.clone(),
                self.settings.password.clone(),
            ))
            .build())
    }
}

impl Dispatcher for SmtpDispatcher {
    fn dispatch(
        &self,
        destination: &str,
        license_plate: &str,
        visit_date: &str,
        artifact: &Path,
    ) -> Result<(), DispatchError> {
        if !artifact.is_file() {
            error!("[dispatch] attachment not found: {}", artifact.display());
            return Err(DispatchError::MissingArtifact(artifact.to_path_buf()));
        }
        let data = fs::read(artifact)?;
        let filename = artifact_name(artifact);

        let email = build_pass_request(
            &self.settings.login,
            destination,
            license_plate,
            visit_date,
            &self.body,
            &filename,
            data,
        )?;

        debug!(
            "[dispatch] sending via {}:{} to {}",
            self.settings.host, self.settings.port, destination
        );
        match self.transport()?.send(&email) {
            Ok(_) => {
                info!("[dispatch] pass request sent to {}, attachment {}", destination, filename);
                Ok(())
            }
            Err(e) => {
                let err = classify(&e);
                match &err {
                    DispatchError::Authentication(_) => error!(
                        "[dispatch] SMTP authentication failed for {}: check the login and the app password",
                        self.settings.login
                    ),
                    DispatchError::Rejected(_) => {
                        error!("[dispatch] server refused the message for {}: {}", destination, e)
                    }
                    _ => error!("[dispatch] SMTP error: {}", e),
                }
                Err(err)
            }
        }
    }
}

/// Build the pass request email with the memo attached.
pub fn build_pass_request(
    from: &str,
    to: &str,
    license_plate: &str,
    visit_date: &str,
    body: &str,
    filename: &str,
    attachment: Vec<u8>,
) -> Result<Message, DispatchError> {
    let from_mb: Mailbox = parse_address(from)?;
    let to_mb: Mailbox = parse_address(to)?;
    let content_type =
        ContentType::parse(DOCX_MIME).map_err(|e| DispatchError::Build(e.to_string()))?;

    Message::builder()
        .from(from_mb)
        .to(to_mb)
        .subject(format!("Пропуск для {} на {}", license_plate, visit_date))
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(body.to_string()))
                .singlepart(Attachment::new(filename.to_string()).body(attachment, content_type)),
        )
        .map_err(|e| DispatchError::Build(e.to_string()))
}

fn parse_address(address: &str) -> Result<Mailbox, DispatchError> {
    address.parse().map_err(|e: lettre::address::AddressError| DispatchError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

fn classify(err: &lettre::transport::smtp::Error) -> DispatchError {
    let detail = err.to_string();
    match err.status() {
        Some(code) if AUTH_FAILURE_CODES.contains(&code.to_string().as_str()) => {
            DispatchError::Authentication(detail)
        }
        Some(_) if err.is_permanent() => DispatchError::Rejected(detail),
        _ => DispatchError::Transport(detail),
    }
}
