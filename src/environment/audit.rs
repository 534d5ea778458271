//! Environment audit record
//!
//! Records which variable keys were propagated to the job, which of them
//! carry secrets and which host keys were left behind. Values are never
//! recorded.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version for env_audit.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for env_audit.json
pub const SCHEMA_ID: &str = "geo-batch-submit/env_audit@1";

/// Environment audit (keys only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvAudit {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub job_id: String,

    /// Keys set on the coordinator and every worker
    pub shared_keys: Vec<String>,

    /// Keys set on the coordinator only
    pub coordinator_keys: Vec<String>,

    /// Propagated keys whose values are secret
    pub secret_keys: Vec<String>,

    /// Host keys not propagated
    pub dropped_keys: Vec<String>,
}

impl EnvAudit {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            job_id: job_id.into(),
            shared_keys: Vec::new(),
            coordinator_keys: Vec::new(),
            secret_keys: Vec::new(),
            dropped_keys: Vec::new(),
        }
    }

    pub fn with_shared_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.shared_keys = sorted(keys);
        self
    }

    pub fn with_coordinator_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.coordinator_keys = sorted(keys);
        self
    }

    pub fn with_secret_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.secret_keys = sorted(keys);
        self
    }

    pub fn with_dropped_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dropped_keys = sorted(keys);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        fs::write(path, json)
    }
}

fn sorted(keys: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Split a host environment into allowed entries and dropped keys
pub fn filter_host_env<'a>(
    host: &'a BTreeMap<String, String>,
    allowed: &[String],
) -> (Vec<(&'a str, &'a str)>, Vec<&'a str>) {
    let mut passed = Vec::new();
    let mut dropped = Vec::new();

    for (key, value) in host {
        if allowed.iter().any(|a| a == key) {
            passed.push((key.as_str(), value.as_str()));
        } else {
            dropped.push(key.as_str());
        }
    }

    (passed, dropped)
}
