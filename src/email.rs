//! Inbound send requests and the normalized email handed to the API client.

use crate::headers::ParsedHeaders;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Recipients as the calling application supplied them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipientInput {
    /// Comma-separated addresses
    Raw(String),
    List(Vec<String>),
}

impl Default for RecipientInput {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

impl RecipientInput {
    /// Individual trimmed addresses, in the order given.
    ///
    /// Never empty: a blank input yields one blank recipient so the send is
    /// still attempted, rejected and logged.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        let list: Vec<String> = match self {
            Self::Raw(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Self::List(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        };
        if list.is_empty() {
            vec![String::new()]
        } else {
            list
        }
    }
}

impl From<&str> for RecipientInput {
    fn from(s: &str) -> Self {
        Self::Raw(s.to_string())
    }
}

impl From<String> for RecipientInput {
    fn from(s: String) -> Self {
        Self::Raw(s)
    }
}

impl From<Vec<String>> for RecipientInput {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Legacy header input: one newline-separated blob or a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderInput {
    Raw(String),
    Lines(Vec<String>),
}

impl Default for HeaderInput {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

impl HeaderInput {
    /// Individual header lines with CRLF line endings normalized away.
    #[must_use]
    pub fn lines(&self) -> Vec<&str> {
        match self {
            Self::Raw(raw) => raw
                .split('\n')
                .map(|l| l.strip_suffix('\r').unwrap_or(l))
                .collect(),
            Self::Lines(lines) => lines.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for HeaderInput {
    fn from(s: &str) -> Self {
        Self::Raw(s.to_string())
    }
}

impl From<String> for HeaderInput {
    fn from(s: String) -> Self {
        Self::Raw(s)
    }
}

impl From<Vec<String>> for HeaderInput {
    fn from(v: Vec<String>) -> Self {
        Self::Lines(v)
    }
}

/// An attachment as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttachmentInput {
    /// Local file, read at send time
    Path(PathBuf),
    /// Content already in memory
    Blob {
        filename: String,
        content: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
}

impl From<PathBuf> for AttachmentInput {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

impl From<&str> for AttachmentInput {
    fn from(p: &str) -> Self {
        Self::Path(PathBuf::from(p))
    }
}

/// One call of the legacy five-argument "send mail" function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRequest {
    pub to: RecipientInput,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub headers: HeaderInput,
    #[serde(default)]
    pub attachments: Vec<AttachmentInput>,
}

impl MailRequest {
    #[must_use]
    pub fn new(
        to: impl Into<RecipientInput>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: impl Into<HeaderInput>) -> Self {
        self.headers = headers.into();
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: impl Into<AttachmentInput>) -> Self {
        self.attachments.push(attachment.into());
        self
    }
}

/// A resolved attachment ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Canonical email, independent of how the caller expressed it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedEmail {
    pub to: String,
    /// `Name <address>` or a bare address
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Custom headers with title-cased names
    pub headers: BTreeMap<String, String>,
    /// Parsed input headers, kept for the delivery log
    pub original_headers: ParsedHeaders,
}

impl NormalizedEmail {
    /// Copy of this email addressed to a single recipient.
    #[must_use]
    pub fn for_recipient(&self, to: &str) -> Self {
        Self {
            to: to.to_string(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn has_content(&self) -> bool {
        self.html.as_deref().is_some_and(|s| !s.is_empty())
            || self.text.as_deref().is_some_and(|s| !s.is_empty())
    }
}
