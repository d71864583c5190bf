//! Fallback delivery used when the relay is switched off.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info, warn};

use crate::content::html_to_text;
use crate::email::MailRequest;
use crate::error::{Error, Result};
use crate::headers::parse_headers;
use crate::parser::{format_mailbox, load_attachments};
use crate::settings::HostInfo;

/// Anything able to send mail given the same request the relay accepts.
#[async_trait]
pub trait FallbackMailer: Send + Sync {
    /// True when the message was handed off successfully.
    async fn send(&self, request: &MailRequest) -> bool;
}

/// SMTP relay used by [`SmtpFallback`].
#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: String,
    /// 0 picks the default port for the TLS mode
    pub port: u16,
    /// STARTTLS
    pub tls: bool,
    /// Implicit TLS (SMTPS)
    pub implicit_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Sends through a plain SMTP relay with `lettre`.
pub struct SmtpFallback {
    config: SmtpConfig,
    host: HostInfo,
}

impl SmtpFallback {
    #[must_use]
    pub const fn new(config: SmtpConfig, host: HostInfo) -> Self {
        Self { config, host }
    }

    /// Build the MIME message for a request. Custom headers are not carried.
    pub fn build_message(&self, request: &MailRequest) -> Result<Message> {
        let headers = parse_headers(&request.headers);

        let from = if headers.from.is_empty() {
            format_mailbox(&self.host.site_name, &self.host.admin_email)
        } else {
            format_mailbox(&headers.from_name, &headers.from)
        };
        let mut builder = Message::builder()
            .from(mailbox(&from)?)
            .subject(request.subject.clone());

        let recipients: Vec<String> = request
            .to
            .recipients()
            .into_iter()
            .filter(|r| !r.is_empty())
            .collect();
        if recipients.is_empty() {
            return Err(Error::Fallback("no recipients".into()));
        }
        for recipient in &recipients {
            builder = builder.to(mailbox(recipient)?);
        }
        for cc in &headers.cc {
            builder = builder.cc(mailbox(cc)?);
        }
        for bcc in &headers.bcc {
            builder = builder.bcc(mailbox(bcc)?);
        }
        if !headers.reply_to.is_empty() {
            builder = builder.reply_to(mailbox(&headers.reply_to)?);
        }
        if !headers.custom.is_empty() {
            debug!(count = headers.custom.len(), "custom headers dropped by SMTP fallback");
        }

        let is_html = headers.content_type.contains("text/html");
        let alternative = || {
            MultiPart::alternative()
                .singlepart(SinglePart::plain(html_to_text(&request.message)))
                .singlepart(SinglePart::html(request.message.clone()))
        };
        let plain = || SinglePart::plain(request.message.clone());

        let attachments = load_attachments(&request.attachments);
        let message = if attachments.is_empty() {
            if is_html {
                builder.multipart(alternative())
            } else {
                builder.singlepart(plain())
            }
        } else {
            let mut mixed = if is_html {
                MultiPart::mixed().multipart(alternative())
            } else {
                MultiPart::mixed().singlepart(plain())
            };
            for attachment in attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .or_else(|_| ContentType::parse("application/octet-stream"))
                    .map_err(|e| Error::Fallback(e.to_string()))?;
                mixed = mixed.singlepart(
                    MailAttachment::new(attachment.filename).body(attachment.content, content_type),
                );
            }
            builder.multipart(mixed)
        };

        message.map_err(|e| Error::Fallback(e.to_string()))
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if self.config.implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
                .map_err(|e| Error::Fallback(e.to_string()))?
        } else if self.config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
                .map_err(|e| Error::Fallback(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
        };

        if self.config.port != 0 {
            builder = builder.port(self.config.port);
        }
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }

    async fn deliver(&self, request: &MailRequest) -> Result<()> {
        let message = self.build_message(request)?;
        let transport = self.build_transport()?;
        transport
            .send(message)
            .await
            .map_err(|e| Error::Fallback(e.to_string()))?;
        Ok(())
    }
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse()
        .map_err(|_| Error::Fallback(format!("invalid address: {address}")))
}

#[async_trait]
impl FallbackMailer for SmtpFallback {
    async fn send(&self, request: &MailRequest) -> bool {
        match self.deliver(request).await {
            Ok(()) => {
                info!(relay = %self.config.host, "email sent through SMTP fallback");
                true
            }
            Err(e) => {
                warn!(relay = %self.config.host, error = %e, "SMTP fallback failed");
                false
            }
        }
    }
}
