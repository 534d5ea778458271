//! Environment propagation
//!
//! Builds the variables every process of the job sees (`shared`), the ones
//! only the coordinating process sees (`coordinator_only`) and the
//! coordinator's JVM options. The result is built once per job and moved
//! into the submission envelope.
//!
//! Values whose key looks secret are held as [`SecretString`]: they print
//! as `<redacted>` and are only exposed when the launch command is built.

mod audit;

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, Serializer};
use tracing::debug;

use crate::artifact::{ArtifactSet, RuntimeEnvironment};
use crate::config::{EnvironmentSettings, RuntimeSettings};
use crate::job::JobRequest;
use crate::resources::ResourceProfile;

pub use audit::{filter_host_env, EnvAudit, SCHEMA_ID, SCHEMA_VERSION};

/// Shown in place of secret values
pub const REDACTED: &str = "<redacted>";

const SECRET_MARKERS: &[&str] = &[
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "PASSWD",
    "ACCESS_KEY",
    "PRIVATE_KEY",
    "API_KEY",
    "CREDENTIAL",
];

/// Whether a variable name suggests a secret value
pub fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Snapshot of the submitting host's environment
pub fn host_env_snapshot() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// One variable value
pub enum EnvValue {
    Plain(String),
    Secret(SecretString),
}

impl EnvValue {
    /// Classify by key
    pub fn for_key(key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if is_secret_key(key) {
            EnvValue::Secret(SecretString::from(value))
        } else {
            EnvValue::Plain(value)
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, EnvValue::Secret(_))
    }

    /// Actual value, for the launch command only
    pub fn expose(&self) -> &str {
        match self {
            EnvValue::Plain(v) => v,
            EnvValue::Secret(s) => s.expose_secret(),
        }
    }

    /// Value safe to print
    pub fn display_value(&self) -> &str {
        match self {
            EnvValue::Plain(v) => v,
            EnvValue::Secret(_) => REDACTED,
        }
    }
}

impl Clone for EnvValue {
    fn clone(&self) -> Self {
        match self {
            EnvValue::Plain(v) => EnvValue::Plain(v.clone()),
            EnvValue::Secret(s) => EnvValue::Secret(SecretString::from(s.expose_secret().to_string())),
        }
    }
}

impl PartialEq for EnvValue {
    fn eq(&self, other: &Self) -> bool {
        self.is_secret() == other.is_secret() && self.expose() == other.expose()
    }
}

impl fmt::Debug for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::Plain(v) => write!(f, "{:?}", v),
            EnvValue::Secret(_) => f.write_str(REDACTED),
        }
    }
}

impl Serialize for EnvValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.display_value())
    }
}

/// Variables and JVM options for one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagatedEnvironment {
    pub shared: BTreeMap<String, EnvValue>,
    pub coordinator_only: BTreeMap<String, EnvValue>,
    pub coordinator_jvm_options: Vec<String>,
    #[serde(skip)]
    pub audit: EnvAudit,
}

impl PropagatedEnvironment {
    /// Keys with secret values, across both maps
    pub fn secret_keys(&self) -> Vec<&str> {
        self.shared
            .iter()
            .chain(self.coordinator_only.iter())
            .filter(|(_, v)| v.is_secret())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Builds [`PropagatedEnvironment`] values
pub struct EnvironmentPropagator {
    settings: EnvironmentSettings,
    runtime: RuntimeSettings,
    host_env: BTreeMap<String, String>,
}

impl EnvironmentPropagator {
    pub fn new(
        settings: EnvironmentSettings,
        runtime: RuntimeSettings,
        host_env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            settings,
            runtime,
            host_env,
        }
    }

    pub fn propagate(
        &self,
        job: &JobRequest,
        profile: &ResourceProfile,
        artifacts: &ArtifactSet,
    ) -> PropagatedEnvironment {
        let mut shared = BTreeMap::new();
        let put = |map: &mut BTreeMap<String, EnvValue>, key: &str, value: String| {
            map.insert(key.to_string(), EnvValue::for_key(key, value));
        };

        let (python, library_path, python_path) = match &artifacts.runtime {
            RuntimeEnvironment::Container { .. } => (
                Some(&self.runtime.container_python),
                self.runtime.container_library_path.as_ref(),
                self.runtime.container_python_path.as_ref(),
            ),
            RuntimeEnvironment::Archive { .. } => (
                Some(&self.runtime.python),
                Some(&self.runtime.library_path),
                Some(&self.runtime.python_path),
            ),
        };
        for (key, value) in [
            ("LD_LIBRARY_PATH", library_path),
            ("PYSPARK_PYTHON", python),
            ("PYTHONPATH", python_path),
        ] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                put(&mut shared, key, value.clone());
            }
        }
        put(&mut shared, "OPENEO_USER_ID", job.user_id.clone());
        put(&mut shared, "OPENEO_BATCH_JOB_ID", job.job_id.clone());
        if let Some(batch_id) = &job.batch_id {
            put(&mut shared, "OPENEO_BATCH_ID", batch_id.clone());
        }
        if let Some(threshold) = &profile.logging_threshold {
            put(&mut shared, "OPENEO_LOGGING_THRESHOLD", threshold.clone());
        }

        let (passed, dropped) = filter_host_env(&self.host_env, &self.settings.passthrough);
        for (key, value) in passed {
            put(&mut shared, key, value.to_string());
        }

        for (key, value) in &self.settings.feature_flags {
            put(&mut shared, key, value.clone());
        }

        if let RuntimeEnvironment::Container { image, mounts } = &artifacts.runtime {
            put(&mut shared, "YARN_CONTAINER_RUNTIME_TYPE", "docker".to_string());
            put(&mut shared, "YARN_CONTAINER_RUNTIME_DOCKER_IMAGE", image.clone());
            if !mounts.is_empty() {
                put(&mut shared, "YARN_CONTAINER_RUNTIME_DOCKER_MOUNTS", mounts.join(","));
            }
        }

        let mut coordinator_only = BTreeMap::new();
        put(&mut coordinator_only, "PYTHON_EGG_CACHE", "./".to_string());
        if let Some(config) = &self.settings.python_logging_config {
            put(&mut coordinator_only, "OPENEO_LOGGING_CONFIG", config.clone());
        }
        if let Some(config) = &self.settings.log4j_config {
            put(&mut coordinator_only, "LOG4J_CONFIGURATION_FILE", config.clone());
        }

        let coordinator_jvm_options = self.jvm_options(job);

        let audit = EnvAudit::new(job.job_id.clone())
            .with_shared_keys(shared.keys().cloned())
            .with_coordinator_keys(coordinator_only.keys().cloned())
            .with_secret_keys(
                shared
                    .iter()
                    .chain(coordinator_only.iter())
                    .filter(|(_, v)| v.is_secret())
                    .map(|(k, _)| k.clone()),
            )
            .with_dropped_keys(dropped);

        debug!(
            job_id = %job.job_id,
            shared = shared.len(),
            coordinator_only = coordinator_only.len(),
            secrets = audit.secret_keys.len(),
            "environment propagated"
        );

        PropagatedEnvironment {
            shared,
            coordinator_only,
            coordinator_jvm_options,
            audit,
        }
    }

    fn jvm_options(&self, job: &JobRequest) -> Vec<String> {
        let mut options = Vec::new();
        if let Some(config) = &self.settings.log4j_config {
            options.push(format!("-Dlog4j.configuration=file:{}", config));
        }
        options.push("-XX:+HeapDumpOnOutOfMemoryError".to_string());
        options.push(format!(
            "-XX:HeapDumpPath={}/{}.hprof",
            self.settings.heap_dump_dir.trim_end_matches('/'),
            job.job_id
        ));
        options.push(format!(
            "-Dscala.concurrent.context.numThreads={}",
            self.settings.coordinator_threads
        ));
        options.push(format!(
            "-Dscala.concurrent.context.maxThreads={}",
            self.settings.coordinator_threads
        ));
        options
    }
}
