//! Persisted relay settings with typed defaults.

use crate::api::is_valid_email_format;
use crate::db::Database;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{PoisonError, RwLock};

/// Option row holding the settings document.
pub const OPTION_NAME: &str = "emailit_settings";

/// Lower bound for `max_log_entries`.
pub const MIN_LOG_ENTRIES: u32 = 10;

/// Upper bound for `max_log_entries`.
pub const MAX_LOG_ENTRIES: u32 = 1000;

/// Facts about the hosting application, used when the settings are silent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub admin_email: String,
    pub site_name: String,
    pub site_url: String,
}

/// Runtime settings. Keys missing from the stored document take the
/// compiled-in defaults; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    pub force_from: bool,
    pub reply_to: String,
    pub enable_logging: bool,
    /// 0 keeps logs forever.
    pub log_retention_days: u32,
    pub max_log_entries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            from_email: String::new(),
            from_name: String::new(),
            force_from: false,
            reply_to: String::new(),
            enable_logging: true,
            log_retention_days: 30,
            max_log_entries: 100,
        }
    }
}

impl Settings {
    /// Copy with the API key masked down to its last four characters.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            let chars: Vec<char> = copy.api_key.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
            copy.api_key = format!("{}{tail}", "•".repeat(20));
        }
        copy
    }

    /// Clamp the log capacity and clear addresses that fail the syntax check.
    fn sanitize(&mut self) {
        self.max_log_entries = self.max_log_entries.clamp(MIN_LOG_ENTRIES, MAX_LOG_ENTRIES);
        for (name, address) in [("from_email", &mut self.from_email), ("reply_to", &mut self.reply_to)] {
            let trimmed = address.trim();
            if !trimmed.is_empty() && !is_valid_email_format(trimmed) {
                tracing::warn!(setting = name, value = %trimmed, "ignoring malformed email address");
                address.clear();
            } else if trimmed.len() != address.len() {
                *address = trimmed.to_string();
            }
        }
    }
}

/// Partial settings update. `None` fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub force_from: Option<bool>,
    pub reply_to: Option<String>,
    pub enable_logging: Option<bool>,
    pub log_retention_days: Option<u32>,
    pub max_log_entries: Option<u32>,
}

impl SettingsPatch {
    fn apply_to(self, settings: &mut Settings) {
        if let Some(v) = self.enabled {
            settings.enabled = v;
        }
        // An empty key in a form submission means "unchanged", never "clear".
        if let Some(v) = self.api_key.map(|k| k.trim().to_string()) {
            if !v.is_empty() {
                settings.api_key = v;
            }
        }
        if let Some(v) = self.from_email {
            settings.from_email = v.trim().to_string();
        }
        if let Some(v) = self.from_name {
            settings.from_name = v.trim().to_string();
        }
        if let Some(v) = self.force_from {
            settings.force_from = v;
        }
        if let Some(v) = self.reply_to {
            settings.reply_to = v.trim().to_string();
        }
        if let Some(v) = self.enable_logging {
            settings.enable_logging = v;
        }
        if let Some(v) = self.log_retention_days {
            settings.log_retention_days = v;
        }
        if let Some(v) = self.max_log_entries {
            settings.max_log_entries = v;
        }
        settings.sanitize();
    }
}

/// Settings loaded once from the database and written back on every change.
pub struct SettingsStore {
    db: Database,
    host: HostInfo,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load the stored settings document, falling back to defaults.
    pub fn load(db: Database, host: HostInfo) -> Result<Self> {
        let current = match db.get_option(OPTION_NAME)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "stored settings unreadable, using defaults");
                Settings::default()
            }),
            None => Settings::default(),
        };

        Ok(Self {
            db,
            host,
            current: RwLock::new(current),
        })
    }

    /// Snapshot of the current settings.
    #[must_use]
    pub fn current(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Host facts this store was created with.
    #[must_use]
    pub const fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Look up a single setting by name. Unknown names yield `None`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self.current()) {
            Ok(Value::Object(mut map)) => map.remove(key),
            _ => None,
        }
    }

    /// Overwrite a single setting. Returns whether the stored value changed.
    pub fn set(&self, key: &str, value: Value) -> Result<bool> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);

        let Value::Object(mut map) = serde_json::to_value(&*guard)? else {
            return Err(Error::Config("settings are not a JSON object".into()));
        };
        if !map.contains_key(key) {
            return Err(Error::Config(format!("unknown setting \"{key}\"")));
        }
        map.insert(key.to_string(), value);

        let mut next: Settings = serde_json::from_value(Value::Object(map))
            .map_err(|e| Error::Config(format!("invalid value for \"{key}\": {e}")))?;
        next.sanitize();

        if next == *guard {
            return Ok(false);
        }
        self.persist(&next)?;
        *guard = next;
        drop(guard);
        tracing::info!(key, "setting updated");
        Ok(true)
    }

    /// Merge a partial update into the current settings and persist them.
    pub fn update(&self, patch: SettingsPatch) -> Result<bool> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        patch.apply_to(&mut next);

        if next == *guard {
            return Ok(false);
        }
        self.persist(&next)?;
        *guard = next;
        drop(guard);
        tracing::info!("settings updated");
        Ok(true)
    }

    /// Seed the stored settings on first install. Returns `false` when a
    /// settings document already exists.
    pub fn set_defaults(&self) -> Result<bool> {
        if self.db.get_option(OPTION_NAME)?.is_some() {
            return Ok(false);
        }

        let mut seeded = Settings {
            from_email: self.host.admin_email.clone(),
            from_name: self.host.site_name.clone(),
            ..Settings::default()
        };
        seeded.sanitize();
        self.persist(&seeded)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = seeded;
        tracing::info!("default settings stored");
        Ok(true)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.current().enabled
    }

    /// True when both an API key and a sender address are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let s = self.current();
        !s.api_key.is_empty() && !s.from_email.is_empty()
    }

    /// One message per missing required setting, in a fixed order.
    #[must_use]
    pub fn configuration_errors(&self) -> Vec<String> {
        let s = self.current();
        let mut errors = Vec::new();
        if s.api_key.is_empty() {
            errors.push("The EmailIT API key has not been configured.".to_string());
        }
        if s.from_email.is_empty() {
            errors.push("The sender email has not been configured.".to_string());
        }
        errors
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        let raw = serde_json::to_string(settings)?;
        self.db.put_option(OPTION_NAME, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SettingsStore {
        let db = Database::open_in_memory().unwrap();
        SettingsStore::load(
            db,
            HostInfo {
                admin_email: "admin@example.com".into(),
                site_name: "Example".into(),
                site_url: "https://example.com".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn unknown_and_missing_keys_use_defaults() {
        let db = Database::open_in_memory().unwrap();
        db.put_option(OPTION_NAME, r#"{"api_key":"k","bogus":1}"#).unwrap();
        let store = SettingsStore::load(db, HostInfo::default()).unwrap();

        let s = store.current();
        assert_eq!(s.api_key, "k");
        assert!(s.enabled);
        assert_eq!(s.log_retention_days, 30);
        assert_eq!(s.max_log_entries, 100);
        assert_eq!(store.get("bogus"), None);
        assert_eq!(store.get("max_log_entries"), Some(json!(100)));
    }

    #[test]
    fn empty_api_key_never_clears_stored_key() {
        let store = store();
        store
            .update(SettingsPatch {
                api_key: Some("secret-1234".into()),
                ..Default::default()
            })
            .unwrap();

        let changed = store
            .update(SettingsPatch {
                api_key: Some(String::new()),
                ..Default::default()
            })
            .unwrap();

        assert!(!changed);
        assert_eq!(store.current().api_key, "secret-1234");
    }

    #[test]
    fn update_merges_and_clamps() {
        let store = store();
        store
            .update(SettingsPatch {
                from_email: Some(" sender@example.com ".into()),
                max_log_entries: Some(5000),
                ..Default::default()
            })
            .unwrap();

        let s = store.current();
        assert_eq!(s.from_email, "sender@example.com");
        assert_eq!(s.max_log_entries, MAX_LOG_ENTRIES);
        assert!(s.enable_logging);

        store
            .update(SettingsPatch {
                max_log_entries: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.current().max_log_entries, MIN_LOG_ENTRIES);
        assert_eq!(store.current().from_email, "sender@example.com");
    }

    #[test]
    fn malformed_addresses_are_stored_empty() {
        let store = store();
        store
            .update(SettingsPatch {
                api_key: Some("key".into()),
                from_email: Some("not an address".into()),
                reply_to: Some("replies@example.com".into()),
                ..SettingsPatch::default()
            })
            .unwrap();
        let s = store.current();
        assert_eq!(s.from_email, "");
        assert_eq!(s.reply_to, "replies@example.com");
        assert!(!store.is_configured());
        assert_eq!(
            store.configuration_errors(),
            vec!["The sender email has not been configured.".to_string()]
        );

        store.set("reply_to", json!("nobody@")).unwrap();
        assert_eq!(store.current().reply_to, "");
    }

    #[test]
    fn set_rejects_unknown_keys_and_bad_types() {
        let store = store();
        assert!(store.set("nope", json!(1)).is_err());
        assert!(store.set("enabled", json!("yes")).is_err());
        assert!(store.set("force_from", json!(true)).unwrap());
        assert!(!store.set("force_from", json!(true)).unwrap());
        assert!(store.current().force_from);
    }

    #[test]
    fn set_defaults_seeds_from_host_only_once() {
        let store = store();
        assert!(store.set_defaults().unwrap());
        assert_eq!(store.current().from_email, "admin@example.com");
        assert_eq!(store.current().from_name, "Example");

        store.set("from_name", json!("Changed")).unwrap();
        assert!(!store.set_defaults().unwrap());
        assert_eq!(store.current().from_name, "Changed");
    }

    #[test]
    fn configuration_errors_follow_missing_fields() {
        let store = store();
        assert!(!store.is_configured());
        assert_eq!(store.configuration_errors().len(), 2);

        store.set("api_key", json!("k")).unwrap();
        let errors = store.configuration_errors();
        assert_eq!(errors, vec!["The sender email has not been configured.".to_string()]);

        store.set("from_email", json!("a@example.com")).unwrap();
        assert!(store.is_configured());
        assert!(store.configuration_errors().is_empty());
    }

    #[test]
    fn settings_survive_reload() {
        let db = Database::open_in_memory().unwrap();
        let store = SettingsStore::load(db.clone(), HostInfo::default()).unwrap();
        store.set("reply_to", json!("replies@example.com")).unwrap();

        let reloaded = SettingsStore::load(db, HostInfo::default()).unwrap();
        assert_eq!(reloaded.current().reply_to, "replies@example.com");
    }

    #[test]
    fn redacted_keeps_last_four_characters() {
        let settings = Settings {
            api_key: "abcdefgh".into(),
            ..Settings::default()
        };
        let masked = settings.redacted().api_key;
        assert!(masked.ends_with("efgh"));
        assert!(!masked.contains("abcd"));
    }
}
