//! Engine configuration.
//!
//! Defaults are usable as-is; every field can be overridden through a
//! `MODGATE_*` environment variable.

use std::time::Duration;

use serde::Deserialize;

use modgate_events::DEFAULT_HISTORY_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the backend (`/api/modules`, `/api/users/{id}/permissions`).
    pub api_base_url: String,
    /// Quiet period before a reconciliation pass runs.
    pub debounce_ms: u64,
    /// Events retained by the bus for diagnostics.
    pub history_capacity: usize,
    /// Retries after the first failed permission fetch.
    pub permission_max_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_base_delay_ms: u64,
    /// Longest a pass waits for an in-flight permission load.
    pub permission_settle_timeout_ms: u64,
    /// Optional JSON registry replacing the built-in catalog.
    pub registry_file: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            debounce_ms: 300,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            permission_max_retries: 3,
            retry_base_delay_ms: 500,
            permission_settle_timeout_ms: 5_000,
            registry_file: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `MODGATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("MODGATE_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = lookup("MODGATE_REGISTRY_FILE") {
            config.registry_file = Some(path);
        }

        override_parsed(&lookup, "MODGATE_DEBOUNCE_MS", &mut config.debounce_ms);
        override_parsed(&lookup, "MODGATE_HISTORY_CAPACITY", &mut config.history_capacity);
        override_parsed(&lookup, "MODGATE_PERMISSION_RETRIES", &mut config.permission_max_retries);
        override_parsed(&lookup, "MODGATE_RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms);
        override_parsed(
            &lookup,
            "MODGATE_PERMISSION_SETTLE_TIMEOUT_MS",
            &mut config.permission_settle_timeout_ms,
        );

        config
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn permission_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_settle_timeout_ms)
    }
}

fn override_parsed<T: core::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable configuration value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_usable() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(300));
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.permission_max_retries, 3);
    }

    #[test]
    fn environment_overrides_apply() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MODGATE_API_URL", "https://erp.example.com/"),
            ("MODGATE_DEBOUNCE_MS", "50"),
            ("MODGATE_PERMISSION_RETRIES", "1"),
            ("MODGATE_REGISTRY_FILE", "/etc/modgate/modules.json"),
        ]));
        assert_eq!(config.api_base_url, "https://erp.example.com");
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.permission_max_retries, 1);
        assert_eq!(config.registry_file.as_deref(), Some("/etc/modgate/modules.json"));
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[("MODGATE_DEBOUNCE_MS", "soon")]));
        assert_eq!(config.debounce_ms, 300);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: EngineConfig = serde_json::from_str(r#"{ "debounce_ms": 10 }"#).unwrap();
        assert_eq!(config.debounce_ms, 10);
        assert_eq!(config.history_capacity, 100);
    }
}
