use std::{collections::HashMap, fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::decryption::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub realtime_url: Option<String>,
    pub database_url: String,
    pub secondary_database_url: Option<String>,
    pub page_size: u32,
    pub typing_timeout_ms: u64,
    pub key_refresh_timeout_secs: u64,
    pub max_refresh_retries: u32,
    pub revalidate_after_failures: u32,
    pub key_cache_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            realtime_url: None,
            database_url: "sqlite://./data/client.db".into(),
            secondary_database_url: Some("sqlite://./data/client-keys.db".into()),
            page_size: 30,
            typing_timeout_ms: 3000,
            key_refresh_timeout_secs: 15,
            max_refresh_retries: 1,
            revalidate_after_failures: 3,
            key_cache_capacity: 10,
        }
    }
}

impl ClientSettings {
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn key_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.key_refresh_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_refresh_retries: self.max_refresh_retries,
            revalidate_after_failures: self.revalidate_after_failures,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"), |name| std::env::var(name).ok())
}

/// Defaults, then `path` (flat `key = "value"` toml), then `APP__*`
/// variables from `env`.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                let file_cfg: HashMap<String, String> = file_cfg
                    .into_iter()
                    .map(|(key, value)| match value {
                        toml::Value::String(text) => (key, text),
                        other => (key, other.to_string()),
                    })
                    .collect();
                apply_overrides(&mut settings, |key| file_cfg.get(key).cloned());
            }
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    apply_overrides(&mut settings, |key| env(&format!("APP__{}", key.to_uppercase())));
    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("realtime_url") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = lookup("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("secondary_database_url") {
        settings.secondary_database_url = (!v.trim().is_empty()).then_some(v);
    }
    override_parsed(&mut settings.page_size, "page_size", &lookup);
    override_parsed(&mut settings.typing_timeout_ms, "typing_timeout_ms", &lookup);
    override_parsed(
        &mut settings.key_refresh_timeout_secs,
        "key_refresh_timeout_secs",
        &lookup,
    );
    override_parsed(&mut settings.max_refresh_retries, "max_refresh_retries", &lookup);
    override_parsed(
        &mut settings.revalidate_after_failures,
        "revalidate_after_failures",
        &lookup,
    );
    override_parsed(&mut settings.key_cache_capacity, "key_cache_capacity", &lookup);
}

fn override_parsed<T: FromStr>(
    target: &mut T,
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparsable value"),
    }
}

/// Accepts bare file paths and `sqlite:` URLs and returns a `sqlite://` URL.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
