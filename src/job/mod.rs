//! Job request model
//!
//! A [`JobRequest`] describes one batch job to submit: who owns it, which
//! process graph it evaluates, where results go and which resource hints the
//! caller supplied. It is loaded once (JSON or TOML) and never mutated while
//! the pipeline runs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::ResourceHints;

/// Default result file name inside the output directory
pub const DEFAULT_OUTPUT_FILE: &str = "out";

/// Default user log file name inside the output directory
pub const DEFAULT_LOG_FILE: &str = "log";

/// Default metadata file name inside the output directory
pub const DEFAULT_METADATA_FILE: &str = "job_metadata.json";

/// Default API version passed to the job
pub const DEFAULT_API_VERSION: &str = "1.0.0";

/// Job request errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to read job request {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse job request: {0}")]
    Parse(String),

    #[error("invalid job request field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// An upstream job or result this job needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    /// Reference by id, e.g. `"job-17"`
    Reference(String),
    /// Structured descriptor, passed through to the job verbatim
    Descriptor(serde_json::Map<String, serde_json::Value>),
}

/// One batch job to submit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Process graph file shipped with the job
    pub process_graph_file: PathBuf,

    /// Directory the job writes its results to
    pub output_dir: PathBuf,

    #[serde(default = "default_output_file")]
    pub output_file_name: String,

    #[serde(default = "default_log_file")]
    pub log_file_name: String,

    #[serde(default = "default_metadata_file")]
    pub metadata_file_name: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Optional descriptor file shipped alongside the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_descriptor: Option<PathBuf>,

    /// User to run the job as, if the identity directory knows them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_user: Option<String>,

    #[serde(default, alias = "job_options")]
    pub resources: ResourceHints,
}

fn default_output_file() -> String {
    DEFAULT_OUTPUT_FILE.to_string()
}

fn default_log_file() -> String {
    DEFAULT_LOG_FILE.to_string()
}

fn default_metadata_file() -> String {
    DEFAULT_METADATA_FILE.to_string()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

/// Generate a fresh job id
pub fn generate_job_id() -> String {
    format!("j-{}", uuid::Uuid::new_v4().simple())
}

impl JobRequest {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, JobError> {
        let job: Self = serde_json::from_str(json).map_err(|e| JobError::Parse(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    /// Parse from TOML
    pub fn from_toml(text: &str) -> Result<Self, JobError> {
        let job: Self = toml::from_str(text).map_err(|e| JobError::Parse(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    /// Load from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> Result<Self, JobError> {
        let text = fs::read_to_string(path).map_err(|source| JobError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Check identifiers and file names
    pub fn validate(&self) -> Result<(), JobError> {
        check_identifier("job_id", &self.job_id)?;
        check_identifier("user_id", &self.user_id)?;
        if let Some(batch_id) = &self.batch_id {
            check_identifier("batch_id", batch_id)?;
        }
        if let Some(proxy_user) = &self.proxy_user {
            check_identifier("proxy_user", proxy_user)?;
        }

        if self.process_graph_file.file_name().is_none() {
            return Err(JobError::Invalid {
                field: "process_graph_file",
                reason: "must name a file".to_string(),
            });
        }

        for (field, name) in [
            ("output_file_name", &self.output_file_name),
            ("log_file_name", &self.log_file_name),
            ("metadata_file_name", &self.metadata_file_name),
        ] {
            if name.is_empty() || name.contains('/') {
                return Err(JobError::Invalid {
                    field,
                    reason: format!("'{}' must be a plain file name", name),
                });
            }
        }

        Ok(())
    }

    /// File name of the process graph as seen by the launched job
    pub fn process_graph_file_name(&self) -> String {
        self.process_graph_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Dependency list rendered as the JSON argument the job expects
    pub fn dependencies_arg(&self) -> String {
        serde_json::to_string(&self.dependencies).unwrap_or_else(|_| "[]".to_string())
    }
}

fn check_identifier(field: &'static str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        return Err(JobError::Invalid {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(JobError::Invalid {
            field,
            reason: format!("'{}' contains whitespace or control characters", value),
        });
    }
    Ok(())
}

/// Builder for job requests
pub struct JobRequestBuilder {
    job: JobRequest,
}

impl JobRequestBuilder {
    pub fn new(
        user_id: impl Into<String>,
        process_graph_file: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job: JobRequest {
                job_id: generate_job_id(),
                user_id: user_id.into(),
                batch_id: None,
                title: None,
                process_graph_file: process_graph_file.into(),
                output_dir: output_dir.into(),
                output_file_name: default_output_file(),
                log_file_name: default_log_file(),
                metadata_file_name: default_metadata_file(),
                api_version: default_api_version(),
                dependencies: Vec::new(),
                dependency_descriptor: None,
                proxy_user: None,
                resources: ResourceHints::default(),
            },
        }
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job.job_id = job_id.into();
        self
    }

    pub fn batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.job.batch_id = Some(batch_id.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.job.title = Some(title.into());
        self
    }

    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.job.api_version = version.into();
        self
    }

    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.job.dependencies.push(dependency);
        self
    }

    pub fn dependency_descriptor(mut self, path: impl Into<PathBuf>) -> Self {
        self.job.dependency_descriptor = Some(path.into());
        self
    }

    pub fn proxy_user(mut self, user: impl Into<String>) -> Self {
        self.job.proxy_user = Some(user.into());
        self
    }

    pub fn resources(mut self, hints: ResourceHints) -> Self {
        self.job.resources = hints;
        self
    }

    pub fn build(self) -> Result<JobRequest, JobError> {
        self.job.validate()?;
        Ok(self.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::MemoryHint;

    #[test]
    fn test_from_json_with_defaults() {
        let job = JobRequest::from_json(
            r#"{
                "job_id": "j-123",
                "user_id": "alice",
                "process_graph_file": "/tmp/jobs/j-123/process_graph.json",
                "output_dir": "/data/projects/OpenEO/j-123",
                "dependencies": ["job-17"],
                "job_options": {"executor-memory": "8G"}
            }"#,
        )
        .unwrap();

        assert_eq!(job.output_file_name, "out");
        assert_eq!(job.metadata_file_name, "job_metadata.json");
        assert_eq!(job.api_version, "1.0.0");
        assert_eq!(job.dependencies, vec![Dependency::Reference("job-17".to_string())]);
        assert_eq!(
            job.resources.executor_memory,
            Some(MemoryHint::Text("8G".to_string()))
        );
        assert_eq!(job.process_graph_file_name(), "process_graph.json");
    }

    #[test]
    fn test_from_toml() {
        let job = JobRequest::from_toml(
            r#"
            job_id = "j-9"
            user_id = "bob"
            proxy_user = "bob"
            process_graph_file = "pg.json"
            output_dir = "/out"

            [resources]
            max-executors = 20
            "#,
        )
        .unwrap();

        assert_eq!(job.proxy_user.as_deref(), Some("bob"));
        assert_eq!(job.resources.max_workers, Some(20));
    }

    #[test]
    fn test_dependencies_arg() {
        let job = JobRequestBuilder::new("alice", "pg.json", "/out")
            .dependency(Dependency::Reference("job-17".to_string()))
            .build()
            .unwrap();
        assert_eq!(job.dependencies_arg(), r#"["job-17"]"#);

        let empty = JobRequestBuilder::new("alice", "pg.json", "/out").build().unwrap();
        assert_eq!(empty.dependencies_arg(), "[]");
    }

    #[test]
    fn test_descriptor_dependency_passes_through() {
        let job = JobRequest::from_json(
            r#"{
                "job_id": "j-1", "user_id": "u", "process_graph_file": "pg.json", "output_dir": "/o",
                "dependencies": [{"collection_id": "SENTINEL1_GRD", "card4l": true}]
            }"#,
        )
        .unwrap();
        assert_eq!(
            job.dependencies_arg(),
            r#"[{"card4l":true,"collection_id":"SENTINEL1_GRD"}]"#
        );
    }

    #[test]
    fn test_rejects_blank_user() {
        let err = JobRequestBuilder::new(" ", "pg.json", "/out").build().unwrap_err();
        assert!(matches!(err, JobError::Invalid { field: "user_id", .. }));
    }

    #[test]
    fn test_rejects_path_in_file_name() {
        let mut job = JobRequestBuilder::new("alice", "pg.json", "/out").build().unwrap();
        job.log_file_name = "../log".to_string();
        assert!(matches!(
            job.validate(),
            Err(JobError::Invalid { field: "log_file_name", .. })
        ));
    }

    #[test]
    fn test_generated_job_ids_are_unique() {
        assert_ne!(generate_job_id(), generate_job_id());
        assert!(generate_job_id().starts_with("j-"));
    }
}
