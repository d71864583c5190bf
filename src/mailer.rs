//! Per-recipient delivery with one log record per attempt.

use crate::api::ApiClient;
use crate::email::MailRequest;
use crate::error::SendError;
use crate::headers::ParsedHeaders;
use crate::parser::normalize;
use crate::settings::SettingsStore;
use crate::store::{run_blocking, LogStatus, LogStore};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Stored for a success when the vendor exchange cannot be serialized.
pub const SENT_SUCCESSFULLY: &str = "Sent successfully";

/// Called once per recipient that could not be sent, validation failures
/// included, with the recipient address and the reason.
pub type FailureObserver = Box<dyn Fn(&str, &SendError) + Send + Sync>;

/// Sends a [`MailRequest`] to each of its recipients in turn.
pub struct Mailer {
    settings: Arc<SettingsStore>,
    api: Arc<ApiClient>,
    logs: Arc<LogStore>,
    on_failure: RwLock<Vec<FailureObserver>>,
}

impl Mailer {
    #[must_use]
    pub const fn new(settings: Arc<SettingsStore>, api: Arc<ApiClient>, logs: Arc<LogStore>) -> Self {
        Self {
            settings,
            api,
            logs,
            on_failure: RwLock::new(Vec::new()),
        }
    }

    /// Register a failure observer. Observers run in registration order.
    pub fn on_failure<F>(&self, observer: F)
    where
        F: Fn(&str, &SendError) + Send + Sync + 'static,
    {
        self.on_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(observer));
    }

    fn notify_failure(&self, recipient: &str, error: &SendError) {
        let observers = self.on_failure.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(recipient, error);
        }
    }

    /// True only when every recipient was accepted by the API.
    ///
    /// Recipients are attempted sequentially and a failure never stops the
    /// remaining ones. Log write failures are reported and otherwise ignored.
    pub async fn send(&self, request: &MailRequest) -> bool {
        let template = normalize(request, &self.settings.current(), self.settings.host());
        let recipients = request.to.recipients();
        debug!(recipients = recipients.len(), subject = %template.subject, "dispatching email");

        let mut all_sent = true;
        for recipient in &recipients {
            let email = template.for_recipient(recipient);

            let (status, stored) = match self.api.send(&email).await {
                Ok(response) => {
                    info!(to = %recipient, status = response.code, "email sent");
                    let stored = serde_json::to_string(&response)
                        .unwrap_or_else(|_| SENT_SUCCESSFULLY.to_string());
                    (LogStatus::Sent, stored)
                }
                Err(e) => {
                    all_sent = false;
                    warn!(to = %recipient, code = e.code(), error = %e, "email not sent");
                    self.notify_failure(recipient, &e);
                    (LogStatus::Failed, e.to_string())
                }
            };

            self.record(recipient, &email.subject, status, stored, &template.original_headers)
                .await;
        }

        all_sent
    }

    async fn record(
        &self,
        recipient: &str,
        subject: &str,
        status: LogStatus,
        response: String,
        headers: &ParsedHeaders,
    ) {
        let to = recipient.to_string();
        let subject = subject.to_string();
        let headers = headers.clone();
        let logged = run_blocking(&self.logs, move |logs| {
            logs.log(&to, &subject, status, &response, Some(&headers))
        })
        .await;

        if let Err(e) = logged {
            warn!(to = %recipient, error = %e, "could not write delivery log");
        }
    }
}
