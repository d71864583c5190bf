//! Client for the vendor's HTTP email API.

use crate::email::NormalizedEmail;
use crate::error::{Result, SendError};
use crate::parser::format_mailbox;
use crate::settings::SettingsStore;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use regex::Regex;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Production endpoint of the vendor API.
pub const DEFAULT_ENDPOINT: &str = "https://api.emailit.com/v1/emails";

/// Client-side timeout for one API call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("valid regex"));
static LOCAL_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9!#$%&'*+/=?^_`{|}~.-]+$").expect("valid regex")
});
static DOMAIN_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9-]+$").expect("valid regex"));

/// Transform applied to the outgoing JSON payload, in registration order.
pub type PayloadHook = Box<dyn Fn(&mut Value, &NormalizedEmail) + Send + Sync>;

/// Called with the posted payload after the vendor accepted it.
pub type SentObserver = Box<dyn Fn(&Value, &VendorResponse) + Send + Sync>;

/// Called with the posted payload after a transport or API failure. The
/// response is `None` when the vendor was never reached.
pub type FailedObserver = Box<dyn Fn(&Value, Option<&VendorResponse>, &SendError) + Send + Sync>;

/// What the vendor answered to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorResponse {
    /// HTTP status code
    pub code: u16,
    /// Body parsed as JSON, when it was JSON
    pub body: Option<Value>,
    pub raw: String,
}

impl VendorResponse {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// The `message` field of a JSON error body.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.body.as_ref()?.get("message")?.as_str()
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<PayloadAttachment<'a>>,
}

#[derive(Serialize)]
struct PayloadAttachment<'a> {
    filename: &'a str,
    content: String,
    content_type: &'a str,
}

fn present(field: Option<&String>) -> Option<&str> {
    field.map(String::as_str).filter(|s| !s.is_empty())
}

/// JSON body for one email, before payload hooks run.
#[must_use]
pub fn build_payload(email: &NormalizedEmail) -> Value {
    let payload = Payload {
        from: &email.from,
        to: &email.to,
        subject: &email.subject,
        reply_to: present(email.reply_to.as_ref()),
        html: present(email.html.as_ref()),
        text: present(email.text.as_ref()),
        headers: Some(&email.headers).filter(|h| !h.is_empty()),
        attachments: email
            .attachments
            .iter()
            .map(|a| PayloadAttachment {
                filename: &a.filename,
                content: BASE64_STANDARD.encode(&a.content),
                content_type: &a.content_type,
            })
            .collect(),
    };
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Syntax check for `address` or `Name <address>`.
#[must_use]
pub fn is_valid_email_format(candidate: &str) -> bool {
    let address = ANGLE_ADDRESS
        .captures(candidate)
        .map_or(candidate, |caps| caps.get(1).map_or(candidate, |m| m.as_str()));
    is_email(address.trim())
}

fn is_email(address: &str) -> bool {
    if address.len() < 6 {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || !LOCAL_PART.is_match(local) {
        return false;
    }
    if domain.contains("..") || domain.trim_matches(|c: char| c == '.' || c.is_whitespace()) != domain {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            label.trim_matches(|c: char| c == '-' || c.is_whitespace()) == *label
                && DOMAIN_LABEL.is_match(label)
        })
}

/// Sends normalized emails through the vendor API.
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    settings: Arc<SettingsStore>,
    hooks: RwLock<Vec<PayloadHook>>,
    on_sent: RwLock<Vec<SentObserver>>,
    on_failed: RwLock<Vec<FailedObserver>>,
    last_error: Mutex<String>,
    last_response: Mutex<Option<VendorResponse>>,
}

impl ApiClient {
    /// Client for the production endpoint.
    pub fn new(settings: Arc<SettingsStore>) -> Result<Self> {
        Self::with_endpoint(settings, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(settings: Arc<SettingsStore>, endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("emailit-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            settings,
            hooks: RwLock::new(Vec::new()),
            on_sent: RwLock::new(Vec::new()),
            on_failed: RwLock::new(Vec::new()),
            last_error: Mutex::new(String::new()),
            last_response: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register a payload transform. Hooks run in registration order.
    pub fn add_payload_hook<F>(&self, hook: F)
    where
        F: Fn(&mut Value, &NormalizedEmail) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Register an observer for accepted emails, run in registration order.
    pub fn on_sent<F>(&self, observer: F)
    where
        F: Fn(&Value, &VendorResponse) + Send + Sync + 'static,
    {
        self.on_sent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(observer));
    }

    /// Register an observer for emails the vendor did not accept. Validation
    /// failures never reach it: nothing was posted.
    pub fn on_failed<F>(&self, observer: F)
    where
        F: Fn(&Value, Option<&VendorResponse>, &SendError) + Send + Sync + 'static,
    {
        self.on_failed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(observer));
    }

    fn notify_sent(&self, payload: &Value, response: &VendorResponse) {
        let observers = self.on_sent.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(payload, response);
        }
    }

    fn notify_failed(&self, payload: &Value, response: Option<&VendorResponse>, error: &SendError) {
        let observers = self.on_failed.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(payload, response, error);
        }
    }

    /// Message of the most recent failure, empty after a success.
    #[must_use]
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recent vendor answer. `None` after a transport failure.
    #[must_use]
    pub fn last_response(&self) -> Option<VendorResponse> {
        self.last_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_error(&self, error: &SendError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error.to_string();
    }

    fn record_response(&self, response: Option<VendorResponse>) {
        *self.last_response.lock().unwrap_or_else(PoisonError::into_inner) = response;
    }

    /// Send one email. All validation happens before any network I/O.
    pub async fn send(&self, email: &NormalizedEmail) -> std::result::Result<VendorResponse, SendError> {
        let api_key = self.settings.current().api_key;
        if let Err(e) = validate(&api_key, email) {
            self.record_error(&e);
            return Err(e);
        }

        let mut payload = build_payload(email);
        {
            let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
            for hook in hooks.iter() {
                hook(&mut payload, email);
            }
        }

        debug!(to = %email.to, endpoint = %self.endpoint, "posting email to API");

        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(&api_key)
            .header(ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(self.transport_failure(&payload, &e)),
        };

        let code = response.status().as_u16();
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(e) => return Err(self.transport_failure(&payload, &e)),
        };
        let vendor = VendorResponse {
            code,
            body: serde_json::from_str(&raw).ok(),
            raw,
        };
        self.record_response(Some(vendor.clone()));

        if vendor.is_success() {
            self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clear();
            self.notify_sent(&payload, &vendor);
            return Ok(vendor);
        }

        let error = SendError::Api {
            status: code,
            message: vendor
                .message()
                .map_or_else(|| format!("API error (status {code})"), str::to_string),
        };
        warn!(to = %email.to, status = code, error = %error, "API rejected email");
        self.record_error(&error);
        self.notify_failed(&payload, Some(&vendor), &error);
        Err(error)
    }

    fn transport_failure(&self, payload: &Value, e: &reqwest::Error) -> SendError {
        let error = SendError::Transport(e.to_string());
        warn!(endpoint = %self.endpoint, error = %error, "API request failed");
        self.record_error(&error);
        self.record_response(None);
        self.notify_failed(payload, None, &error);
        error
    }

    /// Send a canned diagnostic email to `to` using the configured sender.
    pub async fn test_connection(&self, to: &str) -> std::result::Result<VendorResponse, SendError> {
        let settings = self.settings.current();
        if settings.from_email.is_empty() {
            let e = SendError::SenderNotConfigured;
            self.record_error(&e);
            return Err(e);
        }

        let site_name = &self.settings.host().site_name;
        let email = NormalizedEmail {
            to: to.to_string(),
            from: format_mailbox(&settings.from_name, &settings.from_email),
            reply_to: Some(settings.reply_to).filter(|r| !r.is_empty()),
            subject: format!("[Test] EmailIT Relay - {site_name}"),
            html: Some(test_email_html(site_name)),
            text: Some(test_email_text(site_name)),
            ..NormalizedEmail::default()
        };
        self.send(&email).await
    }
}

fn validate(api_key: &str, email: &NormalizedEmail) -> std::result::Result<(), SendError> {
    if api_key.is_empty() {
        return Err(SendError::ApiKeyMissing);
    }
    for (name, value) in [("from", &email.from), ("to", &email.to), ("subject", &email.subject)] {
        if value.is_empty() {
            return Err(SendError::MissingField(name));
        }
    }
    if !email.has_content() {
        return Err(SendError::MissingContent);
    }
    if !is_valid_email_format(&email.from) {
        return Err(SendError::InvalidFrom);
    }
    if !is_valid_email_format(&email.to) {
        return Err(SendError::InvalidTo);
    }
    Ok(())
}

fn test_email_html(site_name: &str) -> String {
    let site_name = html_escape::encode_text(site_name);
    format!(
        "<!DOCTYPE html>\n<html>\n<body style=\"font-family: sans-serif; color: #333;\">\n\
         <h2>EmailIT connection test</h2>\n\
         <p>This test email was sent from <strong>{site_name}</strong> through the EmailIT API.</p>\n\
         <p>If you are reading it, the relay is configured correctly and outgoing mail is working.</p>\n\
         </body>\n</html>\n"
    )
}

fn test_email_text(site_name: &str) -> String {
    format!(
        "EmailIT connection test\n\n\
         This test email was sent from {site_name} through the EmailIT API.\n\n\
         If you are reading it, the relay is configured correctly and outgoing mail is working.\n"
    )
}
