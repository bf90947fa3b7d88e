//! Key/value user settings

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::now_ms;

/// Preference that decides whether settings leave the device at all.
pub const SYNC_SETTINGS_KEY: &str = "syncSettings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub key: String,
    pub value: Value,
    pub updated_at: i64,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at: now_ms(),
        }
    }

    /// Whether this setting must never be uploaded.
    pub fn is_local_only(&self) -> bool {
        self.key == SYNC_SETTINGS_KEY
    }

    /// Interpret the value as a boolean flag (`true`, `"true"`, `1`, `"on"`).
    pub fn as_flag(&self) -> bool {
        match &self.value {
            Value::Bool(value) => *value,
            Value::Number(value) => value.as_i64().is_some_and(|value| value != 0),
            Value::String(value) => matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_flag() {
        assert!(Setting::new(SYNC_SETTINGS_KEY, json!(true)).as_flag());
        assert!(Setting::new(SYNC_SETTINGS_KEY, json!("on")).as_flag());
        assert!(!Setting::new(SYNC_SETTINGS_KEY, json!(0)).as_flag());
        assert!(!Setting::new(SYNC_SETTINGS_KEY, json!(null)).as_flag());
    }

    #[test]
    fn test_sync_key_is_local_only() {
        assert!(Setting::new(SYNC_SETTINGS_KEY, json!(true)).is_local_only());
        assert!(!Setting::new("theme", json!("dark")).is_local_only());
    }
}
