//! Turns a [`MailRequest`] into a [`NormalizedEmail`] template.

use crate::content::{html_to_text, looks_like_html, text_to_html};
use crate::email::{Attachment, AttachmentInput, MailRequest, NormalizedEmail};
use crate::headers::{parse_headers, ParsedHeaders};
use crate::settings::{HostInfo, Settings};
use std::path::Path;

/// Content type assumed when the caller sends none.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Fallback MIME type for attachments.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Build the per-send template. `to` holds every recipient joined by `, `;
/// the orchestrator substitutes one address per API call.
#[must_use]
pub fn normalize(request: &MailRequest, settings: &Settings, host: &HostInfo) -> NormalizedEmail {
    let headers = parse_headers(&request.headers);

    let from = resolve_sender(&headers, settings, host);
    let reply_to = resolve_reply_to(&headers, settings, host);
    let (html, text) = split_body(&request.message, content_type(&headers));

    NormalizedEmail {
        to: request.to.recipients().join(", "),
        from,
        reply_to: non_empty(reply_to),
        subject: request.subject.clone(),
        html: non_empty(html),
        text: non_empty(text),
        attachments: load_attachments(&request.attachments),
        headers: headers.transmit_headers(),
        original_headers: headers,
    }
}

/// `Name <address>` when a name is present, else the bare address.
#[must_use]
pub fn format_mailbox(name: &str, email: &str) -> String {
    if name.is_empty() {
        email.to_string()
    } else {
        format!("{name} <{email}>")
    }
}

fn resolve_sender(headers: &ParsedHeaders, settings: &Settings, host: &HostInfo) -> String {
    if settings.force_from || headers.from.is_empty() {
        if settings.from_email.is_empty() {
            format_mailbox(&host.site_name, &host.admin_email)
        } else {
            format_mailbox(&settings.from_name, &settings.from_email)
        }
    } else {
        format_mailbox(&headers.from_name, &headers.from)
    }
}

fn resolve_reply_to(headers: &ParsedHeaders, settings: &Settings, host: &HostInfo) -> String {
    [
        &headers.reply_to,
        &settings.reply_to,
        &settings.from_email,
        &host.admin_email,
    ]
    .into_iter()
    .find(|candidate| !candidate.is_empty())
    .cloned()
    .unwrap_or_default()
}

fn content_type(headers: &ParsedHeaders) -> &str {
    if headers.content_type.is_empty() {
        DEFAULT_CONTENT_TYPE
    } else {
        &headers.content_type
    }
}

/// Returns `(html, text)`.
fn split_body(message: &str, content_type: &str) -> (String, String) {
    if content_type.to_ascii_lowercase().contains("text/html") {
        (message.to_string(), html_to_text(message))
    } else if looks_like_html(message) {
        (text_to_html(message), message.to_string())
    } else {
        (String::new(), message.to_string())
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Resolve attachment inputs. Unreadable paths are skipped.
#[must_use]
pub fn load_attachments(inputs: &[AttachmentInput]) -> Vec<Attachment> {
    inputs
        .iter()
        .filter_map(|input| match input {
            AttachmentInput::Path(path) => read_attachment(path),
            AttachmentInput::Blob {
                filename,
                content,
                content_type,
            } => Some(Attachment {
                filename: base_name(Path::new(filename)),
                content: content.clone(),
                content_type: content_type
                    .clone()
                    .filter(|ct| !ct.is_empty())
                    .unwrap_or_else(|| OCTET_STREAM.to_string()),
            }),
        })
        .collect()
}

fn read_attachment(path: &Path) -> Option<Attachment> {
    match std::fs::read(path) {
        Ok(content) => Some(Attachment {
            filename: base_name(path),
            content,
            content_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        }),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "skipping attachment");
            None
        }
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
