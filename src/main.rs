mod audit;
mod config;
mod dispatch;
mod extract;
mod imap;
mod message;
mod pipeline;
mod render;

use log::{debug, error, info, warn};
use std::env;
use std::fs;
use std::io::Read;
use std::process;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::dispatch::SmtpDispatcher;
use crate::imap::ImapSource;
use crate::message::{looks_like_rfc822, InboundMessage};
use crate::pipeline::{DocumentRenderer, Pipeline};
use crate::render::DocxRenderer;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    info!("[main] passmail starting, command={}", command);

    match command {
        "run" => {
            let config = match Config::from_env() {
                Ok(config) => config,
                Err(e) => {
                    error!("[main] configuration error: {}", e);
                    process::exit(2);
                }
            };

            info!(
                "[main] run: imap={}:{}, smtp={}:{}, recipient={}",
                config.imap.host,
                config.imap.port,
                config.smtp.host,
                config.smtp.port,
                config.security_email
            );

            let mut pipeline = Pipeline::new(
                ImapSource::new(config.imap),
                DocxRenderer::new(config.template_path, config.output_dir),
                SmtpDispatcher::new(config.smtp, config.pass_request_body),
                AuditLog::new(config.log_dir),
                config.security_email,
            );

            match pipeline.run() {
                Ok(summary) => info!(
                    "[main] done: {} processed, {} succeeded, {} failed",
                    summary.processed, summary.succeeded, summary.failed
                ),
                Err(e) => {
                    error!("[main] run aborted: {}", e);
                    drop(pipeline);
                    process::exit(1);
                }
            }
        }
        "parse" => {
            let msg = read_message(args.get(2).map(|s| s.as_str()));
            let record = extract::extract(&msg.body, &msg.subject);
            match serde_json::to_string_pretty(&record) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    error!("[parse] failed to serialize record: {}", e);
                    process::exit(1);
                }
            }
        }
        "render" => {
            let path = match args.get(2) {
                Some(path) => path.as_str(),
                None => {
                    error!("[render] usage: passmail render FILE");
                    process::exit(2);
                }
            };
            let template = env::var("TEMPLATE_PATH").unwrap_or_else(|_| {
                debug!("[render] TEMPLATE_PATH not set, using default template");
                "templates/Шаблон_Служебной_записки.docx".to_string()
            });
            let output_dir = env::var("OUTPUT_DIR").unwrap_or_else(|_| {
                debug!("[render] OUTPUT_DIR not set, defaulting to output");
                "output".to_string()
            });

            let msg = read_message(Some(path));
            let record = extract::extract(&msg.body, &msg.subject);
            if record.license_plate.is_none() {
                warn!("[render] no license plate found, the memo will use the placeholder");
            }

            match DocxRenderer::new(template, output_dir).render(&record) {
                Ok(artifact) => println!("{}", artifact.display()),
                Err(e) => {
                    error!("[render] {}", e);
                    process::exit(1);
                }
            }
        }
        other => {
            if other != "help" {
                error!("[main] unknown command: {}", other);
            }
            println!("Passmail - vehicle pass requests from inbound email");
            println!();
            println!("Usage:");
            println!("  passmail run            Process unread mail and send pass requests");
            println!("  passmail parse [FILE]   Print the fields extracted from FILE (or stdin) as JSON");
            println!("  passmail render FILE    Render the memo for FILE without sending it");
            println!();
            println!("Environment variables (a .env file is also read):");
            println!("  MAIL_LOGIN                Mailbox login, also the sender address (required)");
            println!("  MAIL_PASSWORD             Mailbox app password (required)");
            println!("  SECURITY_EMAIL            Pass request recipient (required)");
            println!("  IMAP_SERVER               IMAP host (default: imap.mail.ru)");
            println!("  IMAP_PORT                 IMAP TLS port (default: 993)");
            println!("  IMAP_MAILBOX              Mailbox to read (default: INBOX)");
            println!("  SMTP_SERVER               SMTP host (default: smtp.mail.ru)");
            println!("  SMTP_PORT                 SMTP port, 587 uses STARTTLS (default: 465)");
            println!("  TEMPLATE_PATH             Memo template (default: templates/Шаблон_Служебной_записки.docx)");
            println!("  OUTPUT_DIR                Rendered memos (default: output)");
            println!("  LOG_DIR                   Daily audit logs (default: logs)");
            println!("  CONNECT_RETRIES           IMAP connection attempts (default: 3)");
            println!("  CONNECT_RETRY_DELAY_SECS  Delay between attempts (default: 10)");
            println!("  PASS_REQUEST_BODY         Text of the pass request email");
        }
    }
}

/// Read a message from `path`, or stdin when absent, as RFC 822 or plain text.
fn read_message(path: Option<&str>) -> InboundMessage {
    let raw = match path {
        Some(path) => fs::read(path).unwrap_or_else(|e| {
            error!("[main] failed to read {}: {}", path, e);
            process::exit(1);
        }),
        None => {
            let mut buf = Vec::new();
            if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                error!("[main] failed to read stdin: {}", e);
                process::exit(1);
            }
            buf
        }
    };
    let id = path.unwrap_or("stdin");

    let text = String::from_utf8_lossy(&raw);
    if looks_like_rfc822(&text) {
        match InboundMessage::parse(id, &raw) {
            Ok(msg) => return msg,
            Err(e) => warn!("[main] not a parseable message ({}), treating as plain text", e),
        }
    }
    InboundMessage::from_text(id, &text)
}
