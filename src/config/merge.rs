//! Configuration merge logic
//!
//! Implements the layered merge with:
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins)
//! - Scalars: override (last wins)

use serde_json::{Map, Value};

use super::effective::ConfigError;

/// Deep merge two JSON values.
///
/// Merge semantics:
/// - Objects: deep-merge by key (recursive)
/// - Arrays: REPLACE (second wins entirely)
/// - Scalars: override (second wins)
/// - Null: override (null can override any value)
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = if let Some(base_value) = base_map.remove(&key) {
                    deep_merge(base_value, overlay_value)
                } else {
                    overlay_value
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }

        (Value::Array(_), overlay @ Value::Array(_)) => overlay,

        (_, overlay) => overlay,
    }
}

/// Merge multiple config layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Turn `--set` style overrides (`resources.queue=bigjobs`) into one overlay object.
///
/// The value side is parsed as JSON when possible (`true`, `12`, `["a"]`),
/// otherwise it is kept as a plain string.
pub fn overrides_to_value<S: AsRef<str>>(overrides: &[S]) -> Result<Value, ConfigError> {
    let mut overlay = Value::Object(Map::new());

    for raw in overrides {
        let raw = raw.as_ref();
        let (path, value) = raw.split_once('=').ok_or_else(|| {
            ConfigError::ParseError(format!("override '{}' is not of the form key=value", raw))
        })?;

        let path = path.trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ConfigError::ParseError(format!(
                "override '{}' has an empty key segment",
                raw
            )));
        }

        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));

        let nested = path
            .rsplit('.')
            .fold(value, |inner, key| {
                let mut map = Map::new();
                map.insert(key.to_string(), inner);
                Value::Object(map)
            });
        overlay = deep_merge(overlay, nested);
    }

    Ok(overlay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_override() {
        let result = deep_merge(json!({"queue": "default"}), json!({"queue": "bigjobs"}));
        assert_eq!(result["queue"], "bigjobs");
    }

    #[test]
    fn test_object_deep_merge() {
        let base = json!({
            "resources": {
                "executor_memory": "2G",
                "driver_memory": "8G"
            }
        });
        let overlay = json!({
            "resources": {
                "executor_memory": "4G"
            }
        });
        let result = deep_merge(base, overlay);

        assert_eq!(result["resources"]["executor_memory"], "4G");
        assert_eq!(result["resources"]["driver_memory"], "8G");
    }

    #[test]
    fn test_array_replace() {
        let base = json!({"passthrough": ["AWS_REGION", "SWIFT_URL", "AWS_ACCESS_KEY_ID"]});
        let overlay = json!({"passthrough": ["AWS_REGION"]});
        let result = deep_merge(base, overlay);

        assert_eq!(result["passthrough"], json!(["AWS_REGION"]));
    }

    #[test]
    fn test_null_override() {
        let result = deep_merge(json!({"source_url": "https://x"}), json!({"source_url": null}));
        assert!(result["source_url"].is_null());
    }

    #[test]
    fn test_merge_layers_last_wins() {
        let builtin = json!({"timeouts": {"submit_seconds": 300}, "resources": {"queue": "default"}});
        let host = json!({"timeouts": {"submit_seconds": 120}});
        let cli = json!({"resources": {"queue": "urgent"}});

        let result = merge_layers(vec![builtin, host, cli]);

        assert_eq!(result["timeouts"]["submit_seconds"], 120);
        assert_eq!(result["resources"]["queue"], "urgent");
    }

    #[test]
    fn test_overrides_to_value() {
        let overlay = overrides_to_value(&[
            "resources.queue=urgent",
            "resources.max_workers_ceiling=40",
            "speculation.enabled=false",
        ])
        .unwrap();

        assert_eq!(overlay["resources"]["queue"], "urgent");
        assert_eq!(overlay["resources"]["max_workers_ceiling"], 40);
        assert_eq!(overlay["speculation"]["enabled"], false);
    }

    #[test]
    fn test_overrides_reject_malformed() {
        assert!(overrides_to_value(&["resources.queue"]).is_err());
        assert!(overrides_to_value(&["resources..queue=x"]).is_err());
    }
}
