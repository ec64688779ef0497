use log::{debug, warn};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PASS_REQUEST_BODY: &str =
    "Уважаемый Иван Сергеевич, прошу подготовить пропуск. Служебная записка во вложении.";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub mailbox: String,
    pub connect_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
}

/// Everything the `run` command needs, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    pub security_email: String,
    pub template_path: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub pass_request_body: String,
}

impl Config {
    /// Load from the process environment, after merging a `.env` file if present.
    pub fn from_env() -> Result<Config, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("[config] loaded environment from {}", path.display()),
            Err(e) if e.not_found() => debug!("[config] no .env file found"),
            Err(e) => warn!("[config] failed to read .env file: {}", e),
        }
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let login = required(&lookup, "MAIL_LOGIN")?;
        let password = required(&lookup, "MAIL_PASSWORD")?;
        let security_email = required(&lookup, "SECURITY_EMAIL")?;

        let imap = ImapSettings {
            host: or_default(&lookup, "IMAP_SERVER", "imap.mail.ru"),
            port: parsed(&lookup, "IMAP_PORT", 993)?,
            login: login.clone(),
            password: password.clone(),
            mailbox: or_default(&lookup, "IMAP_MAILBOX", "INBOX"),
            connect_retries: parsed(&lookup, "CONNECT_RETRIES", 3)?,
            retry_delay: Duration::from_secs(parsed(&lookup, "CONNECT_RETRY_DELAY_SECS", 10)?),
        };
        let smtp = SmtpSettings {
            host: or_default(&lookup, "SMTP_SERVER", "smtp.mail.ru"),
            port: parsed(&lookup, "SMTP_PORT", 465)?,
            login,
            password,
        };

        Ok(Config {
            imap,
            smtp,
            security_email,
            template_path: PathBuf::from(or_default(
                &lookup,
                "TEMPLATE_PATH",
                "templates/Шаблон_Служебной_записки.docx",
            )),
            output_dir: PathBuf::from(or_default(&lookup, "OUTPUT_DIR", "output")),
            log_dir: PathBuf::from(or_default(&lookup, "LOG_DIR", "logs")),
            pass_request_body: or_default(&lookup, "PASS_REQUEST_BODY", DEFAULT_PASS_REQUEST_BODY),
        })
    }
}

fn lookup_nonempty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_nonempty(lookup, key).ok_or(ConfigError::Missing(key))
}

fn or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup_nonempty(lookup, key).unwrap_or_else(|| {
        debug!("[config] {} not set, defaulting to {}", key, default);
        default.to_string()
    })
}

fn parsed<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Display,
{
    match lookup_nonempty(lookup, key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => {
            debug!("[config] {} not set, defaulting to {}", key, default);
            Ok(default)
        }
    }
}
