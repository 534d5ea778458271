//! Effective configuration with full provenance
//!
//! The effective config captures the merged configuration plus
//! information about where each value came from. The typed settings are
//! taken from the merged value before redaction; the stored snapshot is
//! redacted and safe to log or write next to the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::settings::{RuntimeMode, SubmitterConfig};

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "geo-batch-submit/effective_config@1";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// Origin of this source
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Effective configuration with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// When this config was computed
    pub created_at: DateTime<Utc>,

    /// The merged configuration object, secrets redacted
    pub config: Value,

    /// SHA-256 of the canonical redacted config
    pub digest: String,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,

    /// Typed settings (not serialized)
    #[serde(skip)]
    settings: SubmitterConfig,
}

/// Keys that contain secrets and should be redacted
const SECRET_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "private_key",
    "api_key",
    "access_key",
];

impl EffectiveConfig {
    /// Build effective config from layers
    pub fn build(
        host_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        layers.push(BuiltinDefaults::default().to_value());
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        if let Some(path) = host_config_path {
            if path.exists() {
                let (value, digest) = Self::load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::Host,
                    path: Some(path.to_string_lossy().to_string()),
                    digest: Some(digest),
                });
            }
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let mut merged = merge_layers(layers);

        let settings: SubmitterConfig = serde_json::from_value(merged.clone())
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        Self::validate_settings(&settings)?;

        let redactions = Self::redact_secrets(&mut merged);
        let digest = Self::digest_value(&merged)?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config: merged,
            digest,
            sources,
            redactions,
            settings,
        })
    }

    /// Built-in defaults only
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::build(None, None)
    }

    /// Typed settings
    pub fn settings(&self) -> &SubmitterConfig {
        &self.settings
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;

        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    /// Convert TOML Value to JSON Value
    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Self::toml_to_json).collect())
            }
            toml::Value::Table(table) => {
                let map: serde_json::Map<String, Value> = table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect();
                Value::Object(map)
            }
        }
    }

    fn digest_value(value: &Value) -> Result<String, ConfigError> {
        let canonical = serde_json_canonicalizer::to_vec(value)
            .map_err(|e| ConfigError::ParseError(format!("canonicalization failed: {}", e)))?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Redact secrets in the config, returning list of redacted paths
    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        Self::redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let current_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };

                    let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));

                    if is_secret && !val.is_object() && !val.is_array() && !val.is_null() {
                        *val = Value::String("[REDACTED]".to_string());
                        redactions.push(current_path);
                    } else {
                        Self::redact_recursive(val, current_path, redactions);
                    }
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter_mut().enumerate() {
                    let current_path = format!("{}[{}]", path, i);
                    Self::redact_recursive(val, current_path, redactions);
                }
            }
            _ => {}
        }
    }

    /// Validate cross-field constraints the types cannot express
    fn validate_settings(settings: &SubmitterConfig) -> Result<(), ConfigError> {
        settings
            .timeouts
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let attempts = settings.artifacts.archive.fetch_attempts;
        if attempts == 0 || attempts > 10 {
            return Err(ConfigError::ValidationError(
                "artifacts.archive.fetch_attempts must be in [1, 10]".to_string(),
            ));
        }

        if settings.identity.directory_size_limit == 0 {
            return Err(ConfigError::ValidationError(
                "identity.directory_size_limit must be > 0".to_string(),
            ));
        }

        let speculation = &settings.speculation;
        if speculation.quantile.is_nan() || speculation.quantile <= 0.0 || speculation.quantile > 1.0 {
            return Err(ConfigError::ValidationError(
                "speculation.quantile must be in (0, 1]".to_string(),
            ));
        }
        if speculation.multiplier.is_nan() || speculation.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "speculation.multiplier must be >= 1".to_string(),
            ));
        }

        if settings.runtime.mode == RuntimeMode::Container
            && settings.runtime.container_image.is_none()
        {
            return Err(ConfigError::ValidationError(
                "runtime.container_image is required when runtime.mode = \"container\"".to_string(),
            ));
        }

        if let Some(pin) = &settings.artifacts.archive.sha256 {
            if pin.len() != 64 || !pin.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::ValidationError(
                    "artifacts.archive.sha256 must be 64 hex characters".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("JSON serialization failed: {}", e),
            )
        })?;
        fs::write(path, json)
    }

    /// Get a redacted config value by path (dot-separated)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Get a config value as u64
    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }

    /// Get a config value as string
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::builtin().unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.get_u64("timeouts.submit_seconds"), Some(300));
        assert_eq!(config.get_str("cluster.master"), Some("yarn"));
        assert_eq!(config.settings().resources.queue, "default");
    }

    #[test]
    fn test_build_with_cli_override() {
        let cli = serde_json::json!({"resources": {"queue": "urgent"}});
        let config = EffectiveConfig::build(None, Some(cli)).unwrap();

        assert_eq!(config.settings().resources.queue, "urgent");
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].origin, ConfigOrigin::Cli);
    }

    #[test]
    fn test_validation_timeout_bounds() {
        let cli = serde_json::json!({"timeouts": {"submit_seconds": 0}});
        let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("submit_seconds"));
    }

    #[test]
    fn test_validation_container_needs_image() {
        let cli = serde_json::json!({"runtime": {"mode": "container"}});
        let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("container_image"));
    }

    #[test]
    fn test_validation_bad_memory_string() {
        let cli = serde_json::json!({"resources": {"executor_memory": "lots"}});
        assert!(EffectiveConfig::build(None, Some(cli)).is_err());
    }

    #[test]
    fn test_secret_redaction_keeps_typed_value() {
        let cli = serde_json::json!({
            "environment": {"feature_flags": {"ETL_API_TOKEN": "abc", "FUSE_MOUNT": "true"}}
        });
        let config = EffectiveConfig::build(None, Some(cli)).unwrap();

        assert_eq!(
            config.get_str("environment.feature_flags.ETL_API_TOKEN"),
            Some("[REDACTED]")
        );
        assert_eq!(
            config.get_str("environment.feature_flags.FUSE_MOUNT"),
            Some("true")
        );
        assert_eq!(
            config.settings().environment.feature_flags.get("ETL_API_TOKEN").map(String::as_str),
            Some("abc")
        );
        assert!(config
            .redactions
            .contains(&"environment.feature_flags.ETL_API_TOKEN".to_string()));
    }

    #[test]
    fn test_load_toml_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[identity]").unwrap();
        writeln!(temp, "principal = \"openeo@VGT.VITO.BE\"").unwrap();
        writeln!(temp, "keytab = \"/etc/openeo.keytab\"").unwrap();
        writeln!(temp, "[resources]").unwrap();
        writeln!(temp, "max_workers_ceiling = 60").unwrap();

        let config = EffectiveConfig::build(Some(temp.path()), None).unwrap();

        assert_eq!(config.settings().resources.max_workers_ceiling, 60);
        assert_eq!(
            config.settings().identity.principal.as_deref(),
            Some("openeo@VGT.VITO.BE")
        );
        assert_eq!(config.sources[1].origin, ConfigOrigin::Host);
        assert_eq!(config.sources[1].digest.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn test_missing_host_file_is_skipped() {
        let config =
            EffectiveConfig::build(Some(Path::new("/nonexistent/geo-batch-submit.toml")), None)
                .unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_digest_is_stable() {
        let a = EffectiveConfig::builtin().unwrap();
        let b = EffectiveConfig::builtin().unwrap();
        assert_eq!(a.digest, b.digest);
    }
}
