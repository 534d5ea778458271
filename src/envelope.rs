//! Submission envelope
//!
//! The immutable result of the preparation stages: identity mode, resource
//! profile, artifacts, environment and the entry point invocation. Its
//! `envelope_key` is the SHA-256 of the RFC 8785 canonical JSON of the
//! envelope content with secrets redacted, so the same job prepared under
//! the same configuration always yields the same key.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::artifact::ArtifactSet;
use crate::auth::IdentityMode;
use crate::environment::PropagatedEnvironment;
use crate::job::JobRequest;
use crate::resources::ResourceProfile;

/// Schema version for envelope output
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for envelope output
pub const SCHEMA_ID: &str = "geo-batch-submit/envelope@1";

/// Envelope errors
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Canonicalization(String),
}

/// Content covered by the envelope key
#[derive(Debug, Serialize)]
struct KeyedContent<'a> {
    job_id: &'a str,
    identity: &'a IdentityMode,
    profile: &'a ResourceProfile,
    artifacts: &'a ArtifactSet,
    environment: &'a PropagatedEnvironment,
    entry_point: &'a str,
    arguments: &'a [String],
    config_digest: &'a str,
}

/// Everything needed to launch one job
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionEnvelope {
    pub schema_version: u32,
    pub schema_id: String,
    pub envelope_key: String,
    pub config_digest: String,
    pub job_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub identity: IdentityMode,
    pub profile: ResourceProfile,
    pub artifacts: ArtifactSet,
    pub environment: PropagatedEnvironment,
    pub entry_point: String,
    pub arguments: Vec<String>,
}

/// Positional arguments of the job entry point, in order
pub fn entry_point_arguments(job: &JobRequest, profile: &ResourceProfile) -> Vec<String> {
    vec![
        job.process_graph_file_name(),
        job.output_dir.display().to_string(),
        job.output_file_name.clone(),
        job.log_file_name.clone(),
        job.metadata_file_name.clone(),
        job.api_version.clone(),
        job.dependencies_arg(),
        job.user_id.clone(),
        profile.max_soft_errors_ratio.to_string(),
    ]
}

impl SubmissionEnvelope {
    pub fn new(
        job: &JobRequest,
        identity: IdentityMode,
        profile: ResourceProfile,
        artifacts: ArtifactSet,
        environment: PropagatedEnvironment,
        entry_point: impl Into<String>,
        config_digest: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let entry_point = entry_point.into();
        let config_digest = config_digest.into();
        let arguments = entry_point_arguments(job, &profile);

        let envelope_key = compute_key(&KeyedContent {
            job_id: &job.job_id,
            identity: &identity,
            profile: &profile,
            artifacts: &artifacts,
            environment: &environment,
            entry_point: &entry_point,
            arguments: &arguments,
            config_digest: &config_digest,
        })?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            envelope_key,
            config_digest,
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            title: job.title.clone(),
            identity,
            profile,
            artifacts,
            environment,
            entry_point,
            arguments,
        })
    }

    /// Pretty JSON with secrets redacted
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn compute_key(content: &KeyedContent<'_>) -> Result<String, EnvelopeError> {
    let bytes = serde_json_canonicalizer::to_vec(content)
        .map_err(|e| EnvelopeError::Canonicalization(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactRef, FileManifest, RuntimeEnvironment};
    use crate::auth::PrincipalCredential;
    use crate::config::{EnvironmentSettings, ResourceDefaults, RuntimeSettings};
    use crate::environment::EnvironmentPropagator;
    use crate::job::{Dependency, JobRequestBuilder};
    use crate::resources::{ResourceConfigBuilder, ResourceHints};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn parts(secret: &str) -> (JobRequest, IdentityMode, ResourceProfile, ArtifactSet, PropagatedEnvironment) {
        let job = JobRequestBuilder::new("alice", "/jobs/j-1/process_graph.json", "/data/out/j-1")
            .job_id("j-1")
            .dependency(Dependency::Reference("job-17".to_string()))
            .build()
            .unwrap();
        let identity = IdentityMode::DirectPrincipal(PrincipalCredential {
            principal: "openeo@REALM".to_string(),
            keytab: PathBuf::from("/opt/openeo.keytab"),
        });
        let profile = ResourceConfigBuilder::new(ResourceDefaults::default())
            .build(&ResourceHints::default())
            .unwrap();
        let artifacts = ArtifactSet {
            extensions: ArtifactRef::Remote("https://example.org/ext.jar".to_string()),
            backend_assembly: ArtifactRef::Remote("https://example.org/assembly.jar".to_string()),
            logging: None,
            runtime: RuntimeEnvironment::Archive {
                path: PathBuf::from("venv_static.zip"),
                alias: "venv".to_string(),
            },
            manifest: FileManifest::default(),
        };
        let host: BTreeMap<String, String> =
            [("AWS_SECRET_ACCESS_KEY".to_string(), secret.to_string())].into_iter().collect();
        let environment = EnvironmentPropagator::new(
            EnvironmentSettings::default(),
            RuntimeSettings::default(),
            host,
        )
        .propagate(&job, &profile, &artifacts);
        (job, identity, profile, artifacts, environment)
    }

    fn envelope(secret: &str, digest: &str) -> SubmissionEnvelope {
        let (job, identity, profile, artifacts, environment) = parts(secret);
        SubmissionEnvelope::new(&job, identity, profile, artifacts, environment, "batch_job.py", digest)
            .unwrap()
    }

    #[test]
    fn test_arguments_order() {
        let env = envelope("s", "d");
        assert_eq!(
            env.arguments,
            vec![
                "process_graph.json",
                "/data/out/j-1",
                "out",
                "log",
                "job_metadata.json",
                "1.0.0",
                r#"["job-17"]"#,
                "alice",
                "0",
            ]
        );
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = envelope("s", "d");
        let b = envelope("s", "d");
        assert_eq!(a.envelope_key, b.envelope_key);
        assert_eq!(a.envelope_key.len(), 64);
    }

    #[test]
    fn test_key_ignores_secret_values() {
        assert_eq!(envelope("one", "d").envelope_key, envelope("two", "d").envelope_key);
    }

    #[test]
    fn test_key_tracks_config_digest() {
        assert_ne!(envelope("s", "d1").envelope_key, envelope("s", "d2").envelope_key);
    }

    #[test]
    fn test_json_redacts_secrets() {
        let json = envelope("hunter2", "d").to_json().unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains(r#""schema_id": "geo-batch-submit/envelope@1""#));
    }
}
