//! Runtime settings for the store, the change feed and the transport.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Every Nth version stores a full snapshot instead of only a delta.
    pub history_delta_count: u64,
    /// Documents larger than this skip diffing and history.
    pub history_obj_max_kb: usize,
    pub skip_history_collections: Vec<String>,
    pub max_ace_count: usize,
    pub allow_merge_acl: bool,
    pub force_add_admins: bool,
    pub query_max_bytes: usize,
    pub package_size: usize,
    pub max_package_count: usize,
    /// Incomplete inbound messages buffered per connection.
    pub max_pending_messages: usize,
    pub outbound_queue: usize,
    pub heartbeat_interval_ms: u64,
    pub watch_backoff_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub text_index_name_fields: Vec<String>,
    pub protected_fields: Vec<String>,
    pub redacted_fields: Vec<String>,
    pub subject_collection: String,
    pub config_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_delta_count: 30,
            history_obj_max_kb: 2048,
            skip_history_collections: Vec::new(),
            max_ace_count: 128,
            allow_merge_acl: true,
            force_add_admins: true,
            query_max_bytes: 64 * 1024 * 1024,
            package_size: 4096,
            max_package_count: 25_000,
            max_pending_messages: 256,
            outbound_queue: 1024,
            heartbeat_interval_ms: 10_000,
            watch_backoff_ms: 5_000,
            housekeeping_interval_ms: 60_000,
            text_index_name_fields: vec!["name".to_string()],
            protected_fields: vec![
                "username".to_string(),
                "dbusage".to_string(),
                "dblocked".to_string(),
            ],
            redacted_fields: vec!["passwordhash".to_string()],
            subject_collection: "users".to_string(),
            config_collection: "config".to_string(),
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `DOCHUB_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("DOCHUB_HISTORY_DELTA_COUNT")? {
            config.history_delta_count = v;
        }
        if let Some(v) = env_parse("DOCHUB_HISTORY_OBJ_MAX_KB")? {
            config.history_obj_max_kb = v;
        }
        if let Ok(v) = std::env::var("DOCHUB_SKIP_HISTORY_COLLECTIONS") {
            config.skip_history_collections = split_list(&v);
        }
        if let Some(v) = env_parse("DOCHUB_MAX_ACE_COUNT")? {
            config.max_ace_count = v;
        }
        if let Some(v) = env_parse("DOCHUB_ALLOW_MERGE_ACL")? {
            config.allow_merge_acl = v;
        }
        if let Some(v) = env_parse("DOCHUB_FORCE_ADD_ADMINS")? {
            config.force_add_admins = v;
        }
        if let Some(v) = env_parse("DOCHUB_QUERY_MAX_BYTES")? {
            config.query_max_bytes = v;
        }
        if let Some(v) = env_parse("DOCHUB_PACKAGE_SIZE")? {
            config.package_size = v;
        }
        if let Some(v) = env_parse("DOCHUB_MAX_PACKAGE_COUNT")? {
            config.max_package_count = v;
        }
        if let Some(v) = env_parse("DOCHUB_MAX_PENDING_MESSAGES")? {
            config.max_pending_messages = v;
        }
        if let Some(v) = env_parse("DOCHUB_OUTBOUND_QUEUE")? {
            config.outbound_queue = v;
        }
        if let Some(v) = env_parse("DOCHUB_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse("DOCHUB_WATCH_BACKOFF_MS")? {
            config.watch_backoff_ms = v;
        }
        if let Some(v) = env_parse("DOCHUB_HOUSEKEEPING_INTERVAL_MS")? {
            config.housekeeping_interval_ms = v;
        }
        if let Ok(v) = std::env::var("DOCHUB_TEXT_INDEX_NAME_FIELDS") {
            config.text_index_name_fields = split_list(&v);
        }
        Ok(config)
    }

    pub fn skips_history(&self, collection: &str) -> bool {
        self.skip_history_collections.iter().any(|c| c == collection)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn watch_backoff(&self) -> Duration {
        Duration::from_millis(self.watch_backoff_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}: {e}")),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_list_is_trimmed() {
        assert_eq!(split_list(" audit, ,jobs "), vec!["audit", "jobs"]);
        let config = StoreConfig {
            skip_history_collections: split_list("audit"),
            ..Default::default()
        };
        assert!(config.skips_history("audit"));
        assert!(!config.skips_history("widgets"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"history_delta_count": 5}"#).unwrap();
        assert_eq!(config.history_delta_count, 5);
        assert_eq!(config.max_ace_count, 128);
    }
}
