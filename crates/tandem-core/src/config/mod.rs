//! Client configuration.
//!
//! `ClientConfig` is shared by every Tandem front end. Values come from a JSON
//! file, from `TANDEM_*` environment variables, or both (env wins).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::EntityId;
use crate::util::{compact_text, normalize_http_url, normalize_text_option};
use crate::{Error, Result};

pub const ENV_API_URL: &str = "TANDEM_API_URL";
pub const ENV_REALTIME_URL: &str = "TANDEM_REALTIME_URL";
pub const ENV_CLIENT_ID: &str = "TANDEM_CLIENT_ID";
pub const ENV_SYNC_INTERVAL_SECS: &str = "TANDEM_SYNC_INTERVAL_SECS";

const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    /// REST base URL; `None` keeps the client fully offline
    pub api_base_url: Option<String>,
    /// Server-push endpoint, defaults to `{api_base_url}/events`
    pub realtime_url: Option<String>,
    /// Per-process instance identifier sent with every request
    pub client_id: Option<String>,
    pub request_timeout_ms: u64,
    /// Upper bound for a single tracked sync operation
    pub operation_timeout_ms: u64,
    pub sync_interval_secs: u64,
    pub realtime_max_reconnect_attempts: u32,
    pub realtime_backoff_base_ms: u64,
    pub network_debounce_ms: u64,
    pub document_flush_debounce_ms: u64,
    /// Number of logged document updates that triggers snapshot compaction
    pub document_compaction_threshold: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            realtime_url: None,
            client_id: None,
            request_timeout_ms: 15_000,
            operation_timeout_ms: 30_000,
            sync_interval_secs: 60,
            realtime_max_reconnect_attempts: 8,
            realtime_backoff_base_ms: 500,
            network_debounce_ms: 1_500,
            document_flush_debounce_ms: 750,
            document_compaction_threshold: 64,
        }
    }
}

impl ClientConfig {
    /// Read configuration from `TANDEM_*` environment variables on top of defaults.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Load a JSON config file. A missing file yields the defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            Error::InvalidInput(format!(
                "invalid config file {}: {}",
                path.display(),
                compact_text(&error.to_string())
            ))
        })?;
        config.validated()
    }

    /// Apply environment overrides using `lookup` (injectable for tests).
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if let Some(url) = normalize_text_option(lookup(ENV_API_URL)) {
            self.api_base_url = Some(url);
        }
        if let Some(url) = normalize_text_option(lookup(ENV_REALTIME_URL)) {
            self.realtime_url = Some(url);
        }
        if let Some(client_id) = normalize_text_option(lookup(ENV_CLIENT_ID)) {
            self.client_id = Some(client_id);
        }
        if let Some(raw) = normalize_text_option(lookup(ENV_SYNC_INTERVAL_SECS)) {
            self.sync_interval_secs = raw.parse().map_err(|_| {
                Error::InvalidInput(format!("{ENV_SYNC_INTERVAL_SECS} must be a number, got {raw}"))
            })?;
        }
        self.validated()
    }

    /// Normalize URLs and reject unusable values.
    pub fn validated(mut self) -> Result<Self> {
        self.api_base_url = normalize_text_option(self.api_base_url)
            .map(|url| normalize_http_url(url, "api_base_url"))
            .transpose()?;
        self.realtime_url = normalize_text_option(self.realtime_url)
            .map(|url| normalize_http_url(url, "realtime_url"))
            .transpose()?;
        self.client_id = normalize_text_option(self.client_id);
        if self.sync_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "sync_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }

    /// Whether a remote API is configured.
    pub const fn is_online_capable(&self) -> bool {
        self.api_base_url.is_some()
    }

    pub fn realtime_endpoint(&self) -> Option<String> {
        self.realtime_url.clone().or_else(|| {
            self.api_base_url
                .as_ref()
                .map(|base| format!("{base}/events"))
        })
    }

    /// Configured client id, or a fresh one for this process.
    pub fn resolved_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| EntityId::mint_local().as_str().replacen("local-", "client-", 1))
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub const fn network_debounce(&self) -> Duration {
        Duration::from_millis(self.network_debounce_ms)
    }

    pub const fn document_flush_debounce(&self) -> Duration {
        Duration::from_millis(self.document_flush_debounce_ms)
    }

    pub const fn realtime_backoff_base(&self) -> Duration {
        Duration::from_millis(self.realtime_backoff_base_ms)
    }

    pub const fn realtime_backoff_cap(&self) -> Duration {
        Duration::from_millis(MAX_BACKOFF_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_offline() {
        let config = ClientConfig::default();
        assert!(!config.is_online_capable());
        assert_eq!(config.realtime_endpoint(), None);
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_normalize_urls() {
        let config = ClientConfig::default()
            .with_env_overrides(lookup(&[
                (ENV_API_URL, " https://api.example.com/ "),
                (ENV_SYNC_INTERVAL_SECS, "15"),
            ]))
            .unwrap();
        assert_eq!(
            config.api_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(
            config.realtime_endpoint().as_deref(),
            Some("https://api.example.com/events")
        );
        assert_eq!(config.sync_interval_secs, 15);
    }

    #[test]
    fn env_rejects_bad_values() {
        assert!(ClientConfig::default()
            .with_env_overrides(lookup(&[(ENV_API_URL, "api.example.com")]))
            .is_err());
        assert!(ClientConfig::default()
            .with_env_overrides(lookup(&[(ENV_SYNC_INTERVAL_SECS, "soon")]))
            .is_err());
    }

    #[test]
    fn load_from_path_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_base_url":"http://localhost:8080","colour":"red"}"#)
            .unwrap();
        assert!(ClientConfig::load_from_path(&path).is_err());

        std::fs::write(
            &path,
            r#"{"api_base_url":"http://localhost:8080","sync_interval_secs":5}"#,
        )
        .unwrap();
        let config = ClientConfig::load_from_path(&path).unwrap();
        assert_eq!(config.sync_interval_secs, 5);
        assert_eq!(config.request_timeout_ms, 15_000);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from_path(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn resolved_client_id_prefers_configured_value() {
        let config = ClientConfig {
            client_id: Some("tab-1".to_string()),
            ..ClientConfig::default()
        };
        assert_eq!(config.resolved_client_id(), "tab-1");
        assert!(ClientConfig::default()
            .resolved_client_id()
            .starts_with("client-"));
    }
}
