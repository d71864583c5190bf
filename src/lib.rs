//! Relay application mail through the EmailIT HTTP API, keep a queryable
//! delivery log and expose both through a small admin HTTP surface.

pub mod api;
pub mod content;
pub mod db;
pub mod email;
pub mod error;
pub mod forward;
pub mod headers;
mod http;
pub mod mailer;
pub mod parser;
pub mod schedule;
pub mod settings;
pub mod store;

pub use api::{ApiClient, FailedObserver, PayloadHook, SentObserver, VendorResponse};
pub use db::Database;
pub use email::{AttachmentInput, HeaderInput, MailRequest, NormalizedEmail, RecipientInput};
pub use error::{Error, Result, SendError};
pub use forward::{FallbackMailer, SmtpConfig, SmtpFallback};
pub use mailer::{FailureObserver, Mailer};
pub use settings::{HostInfo, Settings, SettingsPatch, SettingsStore};
pub use store::{LogQuery, LogRecord, LogStats, LogStatus, LogStore};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Default port of the admin HTTP surface.
pub const DEFAULT_HTTP_PORT: u16 = 8025;

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    pub endpoint: String,
    pub http_host: String,
    pub http_port: Option<u16>,
    pub host: HostInfo,
    pub smtp_fallback: Option<SmtpConfig>,
    pub cleanup_interval: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            database_path: None,
            endpoint: api::DEFAULT_ENDPOINT.to_string(),
            http_host: "127.0.0.1".to_string(),
            http_port: None,
            host: HostInfo::default(),
            smtp_fallback: None,
            cleanup_interval: None,
        }
    }
}

/// Application context owning the stores, the API client and the mailer.
pub struct Relay {
    db: Database,
    settings: Arc<SettingsStore>,
    api: Arc<ApiClient>,
    logs: Arc<LogStore>,
    mailer: Mailer,
    fallback: Option<Arc<dyn FallbackMailer>>,
}

impl Relay {
    /// Open the database, install the log table and seed default settings.
    pub fn open(opts: &RelayOptions) -> Result<Self> {
        let db = match &opts.database_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        db.install()?;

        let settings = Arc::new(SettingsStore::load(db.clone(), opts.host.clone())?);
        settings.set_defaults()?;

        let api = Arc::new(ApiClient::with_endpoint(Arc::clone(&settings), opts.endpoint.clone())?);
        let logs = Arc::new(LogStore::new(db.clone(), Arc::clone(&settings)));
        let mailer = Mailer::new(Arc::clone(&settings), Arc::clone(&api), Arc::clone(&logs));

        let fallback = opts
            .smtp_fallback
            .clone()
            .filter(SmtpConfig::is_enabled)
            .map(|config| Arc::new(SmtpFallback::new(config, opts.host.clone())) as Arc<dyn FallbackMailer>);

        Ok(Self {
            db,
            settings,
            api,
            logs,
            mailer,
            fallback,
        })
    }

    /// Replace the path used while the relay is disabled.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackMailer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Entry point replacing the host application's own mail function.
    ///
    /// Disabled: the fallback mailer handles the request, if there is one.
    /// Not configured: nothing is sent and `false` is returned.
    pub async fn send_mail(&self, request: &MailRequest) -> bool {
        if !self.settings.is_enabled() {
            return match &self.fallback {
                Some(fallback) => fallback.send(request).await,
                None => {
                    tracing::debug!("relay disabled and no fallback configured");
                    false
                }
            };
        }
        if !self.settings.is_configured() {
            tracing::warn!(errors = ?self.settings.configuration_errors(), "relay is not configured");
            return false;
        }
        self.mailer.send(request).await
    }

    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Shared handle, so callers can move store work onto the blocking pool.
    #[must_use]
    pub const fn logs(&self) -> &Arc<LogStore> {
        &self.logs
    }

    #[must_use]
    pub const fn mailer(&self) -> &Mailer {
        &self.mailer
    }

    /// Drop the log table and every stored option.
    pub fn uninstall(&self) -> Result<()> {
        self.db.uninstall()
    }
}

/// Handles of a relay started with [`start_relay`].
pub struct RunningRelay {
    pub http_addr: SocketAddr,
    relay: Arc<Relay>,
    http_handle: tokio::task::JoinHandle<()>,
    cleanup_handle: tokio::task::JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RunningRelay {
    #[must_use]
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Stop the admin server and the cleanup task, then checkpoint the database.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.http_handle.await;
        let _ = self.cleanup_handle.await;
        self.relay.database().checkpoint();
    }
}

/// Open the relay, bind the admin HTTP server and start the retention sweep.
pub async fn start_relay(opts: RelayOptions) -> std::io::Result<RunningRelay> {
    let relay = Arc::new(Relay::open(&opts)?);
    start_with(relay, &opts).await
}

/// Like [`start_relay`] for an already opened [`Relay`].
pub async fn start_with(relay: Arc<Relay>, opts: &RelayOptions) -> std::io::Result<RunningRelay> {
    let http_port = opts.http_port.unwrap_or(DEFAULT_HTTP_PORT);
    let every = opts.cleanup_interval.unwrap_or(schedule::CLEANUP_INTERVAL);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let listener = TcpListener::bind((opts.http_host.as_str(), http_port)).await?;
    let http_addr = listener.local_addr()?;
    tracing::info!(addr = %http_addr, "admin HTTP server listening");

    let http_relay = Arc::clone(&relay);
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        http::run_http_server(listener, http_relay, http_shutdown).await;
    });

    let cleanup_handle =
        schedule::spawn_cleanup_task(Arc::clone(&relay.logs), every, shutdown_tx.subscribe());

    Ok(RunningRelay {
        http_addr,
        relay,
        http_handle,
        cleanup_handle,
        shutdown_tx,
    })
}
