//! CLI entry point for emailit-relay.

use clap::{Args, Parser, Subcommand};
use emailit_relay::api::DEFAULT_ENDPOINT;
use emailit_relay::store::run_blocking;
use emailit_relay::{
    start_with, AttachmentInput, HostInfo, LogQuery, LogStore, MailRequest, Relay, RelayOptions, SmtpConfig,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "emailit-relay")]
#[command(about = "Relay application mail through the EmailIT API and keep a delivery log")]
struct Cli {
    /// SQLite database holding settings and the delivery log
    #[arg(long, env = "EMAILIT_DB", default_value = "emailit-relay.db")]
    db: PathBuf,

    /// Vendor API endpoint
    #[arg(long, env = "EMAILIT_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Administrator address, used when no sender is configured
    #[arg(long, env = "EMAILIT_ADMIN_EMAIL", default_value = "")]
    admin_email: String,

    /// Site name, used as the default sender name
    #[arg(long, env = "EMAILIT_SITE_NAME", default_value = "")]
    site_name: String,

    #[arg(long, env = "EMAILIT_SITE_URL", default_value = "")]
    site_url: String,

    #[command(flatten)]
    smtp: SmtpArgs,

    #[command(subcommand)]
    command: Command,
}

/// SMTP relay used while the API relay is disabled
#[derive(Args, Debug)]
struct SmtpArgs {
    #[arg(long, env = "EMAILIT_SMTP_HOST")]
    smtp_host: Option<String>,

    #[arg(long, env = "EMAILIT_SMTP_PORT", default_value = "0")]
    smtp_port: u16,

    /// Use STARTTLS
    #[arg(long, env = "EMAILIT_SMTP_TLS")]
    smtp_tls: bool,

    /// Use implicit TLS (SMTPS)
    #[arg(long, env = "EMAILIT_SMTP_IMPLICIT_TLS")]
    smtp_implicit_tls: bool,

    #[arg(long, env = "EMAILIT_SMTP_USERNAME")]
    smtp_username: Option<String>,

    #[arg(long, env = "EMAILIT_SMTP_PASSWORD", hide_env_values = true)]
    smtp_password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the admin HTTP server and the daily retention sweep
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        http_host: String,

        #[arg(short = 'p', long, env = "EMAILIT_HTTP_PORT", default_value = "8025")]
        http_port: u16,

        /// Seconds between retention sweeps
        #[arg(long, default_value = "86400")]
        cleanup_interval: u64,
    },
    /// Send one email
    Send {
        /// Recipient, repeatable
        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long, default_value = "")]
        subject: String,

        #[arg(long, default_value = "")]
        message: String,

        /// `Name: value` header line, repeatable
        #[arg(long = "header")]
        headers: Vec<String>,

        /// File to attach, repeatable
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Send the diagnostic test email
    Test { to: String },
    /// Delivery counters
    Stats,
    /// List delivery log records
    Logs {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        per_page: u32,

        #[arg(long)]
        orderby: Option<String>,

        #[arg(long)]
        order: Option<String>,
    },
    /// Delete records older than the retention window
    Cleanup,
    /// Delete every log record
    Clear,
    /// Change one setting; the value is parsed as JSON, else taken as a string
    Set { key: String, value: String },
    /// Configuration state and redacted settings
    Status,
    /// Drop the log table and every stored setting
    Uninstall {
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    fn options(&self) -> RelayOptions {
        let smtp_fallback = self.smtp.smtp_host.as_ref().map(|host| SmtpConfig {
            host: host.clone(),
            port: self.smtp.smtp_port,
            tls: self.smtp.smtp_tls,
            implicit_tls: self.smtp.smtp_implicit_tls,
            username: self.smtp.smtp_username.clone(),
            password: self.smtp.smtp_password.clone(),
        });

        RelayOptions {
            database_path: Some(self.db.clone()),
            endpoint: self.endpoint.clone(),
            host: HostInfo {
                admin_email: self.admin_email.clone(),
                site_name: self.site_name.clone(),
                site_url: self.site_url.clone(),
            },
            smtp_fallback,
            ..RelayOptions::default()
        }
    }
}

fn print_json(value: &impl Serialize) -> std::io::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> std::io::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut opts = cli.options();

    if let Command::Uninstall { yes: false } = cli.command {
        eprintln!("refusing to uninstall without --yes");
        return Ok(ExitCode::FAILURE);
    }

    if let Command::Serve {
        http_host,
        http_port,
        cleanup_interval,
    } = &cli.command
    {
        opts.http_host.clone_from(http_host);
        opts.http_port = Some(*http_port);
        opts.cleanup_interval = Some(Duration::from_secs((*cleanup_interval).max(1)));
    }

    let relay = Arc::new(Relay::open(&opts)?);

    match cli.command {
        Command::Serve { .. } => {
            let running = start_with(Arc::clone(&relay), &opts).await?;
            println!("Admin HTTP server listening on {}", running.http_addr);
            tokio::signal::ctrl_c().await?;
            running.stop().await;
        }
        Command::Send {
            to,
            subject,
            message,
            headers,
            attachments,
        } => {
            let mut request = MailRequest::new(to, subject, message).with_headers(headers);
            request
                .attachments
                .extend(attachments.into_iter().map(AttachmentInput::from));
            let success = relay.send_mail(&request).await;
            print_json(&json!({ "success": success }))?;
            return Ok(exit_code(success));
        }
        Command::Test { to } => {
            let result = relay.api().test_connection(&to).await;
            let success = result.is_ok();
            match result {
                Ok(response) => print_json(&json!({ "success": true, "response": response }))?,
                Err(e) => print_json(&json!({
                    "success": false,
                    "code": e.code(),
                    "message": e.to_string(),
                }))?,
            }
            return Ok(exit_code(success));
        }
        Command::Stats => print_json(&run_blocking(relay.logs(), LogStore::get_stats).await?)?,
        Command::Logs {
            status,
            search,
            page,
            per_page,
            orderby,
            order,
        } => {
            let query = LogQuery {
                per_page,
                page,
                status,
                search,
                orderby,
                order,
            };
            print_json(&run_blocking(relay.logs(), move |logs| logs.get_logs(&query)).await?)?;
        }
        Command::Cleanup => print_json(&json!({ "deleted": run_blocking(relay.logs(), LogStore::cleanup_old_logs).await? }))?,
        Command::Clear => print_json(&json!({ "deleted": run_blocking(relay.logs(), LogStore::clear_all_logs).await? }))?,
        Command::Set { key, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let changed = relay.settings().set(&key, value)?;
            print_json(&json!({ "changed": changed, "settings": relay.settings().current().redacted() }))?;
        }
        Command::Status => print_json(&json!({
            "enabled": relay.settings().is_enabled(),
            "configured": relay.settings().is_configured(),
            "errors": relay.settings().configuration_errors(),
            "schema_version": relay.database().schema_version()?,
            "settings": relay.settings().current().redacted(),
        }))?,
        Command::Uninstall { .. } => {
            relay.uninstall()?;
            print_json(&json!({ "uninstalled": true }))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
