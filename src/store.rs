//! `SQLite`-backed delivery log.

use crate::db::Database;
use crate::error::Result;
use crate::headers::ParsedHeaders;
use crate::settings::SettingsStore;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Longest subject stored, in characters.
pub const MAX_SUBJECT_CHARS: usize = 255;

/// Longest response stored, in bytes.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Largest page size `get_logs` will return.
pub const MAX_PER_PAGE: u32 = 1000;

/// Storage format of `created_at`, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const COLUMNS: &str = "id, to_email, subject, status, response, headers, created_at";

/// Outcome recorded for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Sent,
    Failed,
}

impl LogStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything other than `sent` is treated as a failure.
impl From<&str> for LogStatus {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("sent") {
            Self::Sent
        } else {
            Self::Failed
        }
    }
}

/// One stored delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub to_email: String,
    pub subject: String,
    pub status: LogStatus,
    pub response: Option<String>,
    /// JSON of the parsed input headers
    pub headers: Option<String>,
    pub created_at: String,
}

impl LogRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            to_email: row.get(1)?,
            subject: row.get(2)?,
            status: LogStatus::from(status.as_str()),
            response: row.get(4)?,
            headers: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

/// Filters and paging for [`LogStore::get_logs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub per_page: u32,
    pub page: u32,
    /// `sent` or `failed`; anything else means no filter
    pub status: Option<String>,
    /// Substring of the recipient or subject
    pub search: Option<String>,
    pub orderby: Option<String>,
    pub order: Option<String>,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            per_page: 20,
            page: 1,
            status: None,
            search: None,
            orderby: None,
            order: None,
        }
    }
}

impl LogQuery {
    fn order_column(&self) -> &'static str {
        match self.orderby.as_deref() {
            Some("id") => "id",
            Some("to_email") => "to_email",
            Some("subject") => "subject",
            Some("status") => "status",
            _ => "created_at",
        }
    }

    fn order_direction(&self) -> &'static str {
        match self.order.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("asc") => "ASC",
            _ => "DESC",
        }
    }
}

/// One page of log records plus the number of records matching the filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    pub items: Vec<LogRecord>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub last_24h: u64,
}

/// Append-only delivery log with retention and capacity sweeps.
pub struct LogStore {
    db: Database,
    settings: Arc<SettingsStore>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Run `f` against the store on the blocking thread pool.
pub async fn run_blocking<T, F>(logs: &Arc<LogStore>, f: F) -> Result<T>
where
    F: FnOnce(&LogStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let logs = Arc::clone(logs);
    tokio::task::spawn_blocking(move || f(&logs)).await?
}

/// Oldest `created_at` that survives a sweep over `days`, or `None` when the
/// window reaches past the representable range and nothing can be that old.
fn retention_cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    Duration::try_days(i64::from(days)).and_then(|window| now.checked_sub_signed(window))
}

impl LogStore {
    #[must_use]
    pub const fn new(db: Database, settings: Arc<SettingsStore>) -> Self {
        Self { db, settings }
    }

    /// Store one delivery attempt. Returns `None` when logging is disabled.
    pub fn log(
        &self,
        to: &str,
        subject: &str,
        status: LogStatus,
        response: &str,
        headers: Option<&ParsedHeaders>,
    ) -> Result<Option<i64>> {
        if !self.settings.current().enable_logging {
            return Ok(None);
        }
        self.insert_at(to, subject, status, response, headers, Utc::now())
            .map(Some)
    }

    pub fn log_success(
        &self,
        to: &str,
        subject: &str,
        response: &str,
        headers: Option<&ParsedHeaders>,
    ) -> Result<Option<i64>> {
        self.log(to, subject, LogStatus::Sent, response, headers)
    }

    pub fn log_failure(
        &self,
        to: &str,
        subject: &str,
        error: &str,
        headers: Option<&ParsedHeaders>,
    ) -> Result<Option<i64>> {
        self.log(to, subject, LogStatus::Failed, error, headers)
    }

    #[allow(clippy::significant_drop_tightening)]
    pub(crate) fn insert_at(
        &self,
        to: &str,
        subject: &str,
        status: LogStatus,
        response: &str,
        headers: Option<&ParsedHeaders>,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let subject: String = subject.chars().take(MAX_SUBJECT_CHARS).collect();
        let response = truncate_bytes(response, MAX_RESPONSE_BYTES);
        let headers = match headers.filter(|h| !h.is_empty()) {
            Some(h) => Some(serde_json::to_string(h)?),
            None => None,
        };
        let max = self.settings.current().max_log_entries;

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO email_logs (to_email, subject, status, response, headers, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![to, subject, status.as_str(), response, headers, timestamp(at)],
        )?;
        let id = conn.last_insert_rowid();
        Self::enforce_max(&conn, max)?;
        Ok(id)
    }

    fn enforce_max(conn: &Connection, max: u32) -> Result<()> {
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM email_logs", [], |row| row.get(0))?;
        let excess = total - i64::from(max);
        if excess > 0 {
            let removed = conn.execute(
                "DELETE FROM email_logs WHERE id IN (
                     SELECT id FROM email_logs ORDER BY created_at ASC, id ASC LIMIT ?
                 )",
                params![excess],
            )?;
            tracing::debug!(removed, max, "capacity sweep");
        }
        Ok(())
    }

    /// A filtered, ordered page of records.
    #[allow(clippy::significant_drop_tightening)]
    pub fn get_logs(&self, query: &LogQuery) -> Result<LogPage> {
        let mut filter = String::from(" WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = query.status.as_deref() {
            if status == "sent" || status == "failed" {
                filter.push_str(" AND status = ?");
                params_vec.push(Box::new(status.to_string()));
            }
        }
        if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let pattern = escape_like(&search.to_lowercase());
            filter.push_str(
                " AND (unicode_lower(to_email) LIKE ? ESCAPE '\\' OR unicode_lower(subject) LIKE ? ESCAPE '\\')",
            );
            params_vec.push(Box::new(pattern.clone()));
            params_vec.push(Box::new(pattern));
        }

        let per_page = i64::from(query.per_page.clamp(1, MAX_PER_PAGE));
        let offset = i64::from(query.page.max(1) - 1).saturating_mul(per_page);
        let column = query.order_column();
        let direction = query.order_direction();
        let tiebreak = if column == "id" {
            String::new()
        } else {
            format!(", id {direction}")
        };

        let conn = self.db.lock();
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(AsRef::as_ref).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM email_logs{filter}"),
            params_refs.as_slice(),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {COLUMNS} FROM email_logs{filter} ORDER BY {column} {direction}{tiebreak} LIMIT {per_page} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_refs.as_slice(), LogRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(LogPage {
            items,
            total: count(total),
        })
    }

    pub fn get_log(&self, id: i64) -> Result<Option<LogRecord>> {
        let record = self
            .db
            .lock()
            .query_row(
                &format!("SELECT {COLUMNS} FROM email_logs WHERE id = ?"),
                params![id],
                LogRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_stats(&self) -> Result<LogStats> {
        let since = timestamp(Utc::now() - Duration::hours(24));
        let stats = self.db.lock().query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN created_at >= ?1 THEN 1 ELSE 0 END), 0)
             FROM email_logs",
            params![since],
            |row| {
                Ok(LogStats {
                    total: count(row.get(0)?),
                    sent: count(row.get(1)?),
                    failed: count(row.get(2)?),
                    last_24h: count(row.get(3)?),
                })
            },
        )?;
        Ok(stats)
    }

    /// Delete records older than the retention window. Returns how many went.
    pub fn cleanup_old_logs(&self) -> Result<usize> {
        let days = self.settings.current().log_retention_days;
        if days == 0 {
            return Ok(0);
        }
        let Some(cutoff) = retention_cutoff(Utc::now(), days) else {
            tracing::debug!(days, "retention window exceeds the calendar, nothing to sweep");
            return Ok(0);
        };
        let cutoff = timestamp(cutoff);
        let removed = self
            .db
            .lock()
            .execute("DELETE FROM email_logs WHERE created_at < ?", params![cutoff])?;
        if removed > 0 {
            tracing::info!(removed, days, "retention sweep");
        }
        Ok(removed)
    }

    pub fn clear_all_logs(&self) -> Result<usize> {
        let removed = self.db.lock().execute("DELETE FROM email_logs", [])?;
        tracing::info!(removed, "delivery log cleared");
        Ok(removed)
    }
}
