//! Runtime artifact resolution
//!
//! Resolves, for one job:
//! - the native extension package (required)
//! - the backend assembly package (required)
//! - the logging package (optional)
//! - the runtime environment: a packed archive fetched into the work
//!   directory when missing, or a container image
//! - the manifest of auxiliary files shipped with the job
//!
//! Packages are found by file name pattern in the work directory and fall
//! back to their published location. The resulting [`ArtifactSet`] is
//! immutable.

mod fetch;
mod locate;
mod manifest;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ArtifactSettings, RuntimeMode, RuntimeSettings};
use crate::error::ConfigurationError;
use crate::job::JobRequest;

pub use fetch::{
    ensure_archive, sha256_file, ArchiveFetcher, ArchiveRequest, ArchiveStatus, FetchError,
    HttpFetcher,
};
pub use locate::{find_matches, locate_package};
pub use manifest::{FileManifest, FileManifestBuilder, FileRole, ManifestEntry};

/// Artifact errors
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact '{artifact}' unavailable: {reason}")]
    Unavailable { artifact: String, reason: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("failed to list {dir}: {message}")]
    Walk { dir: PathBuf, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where a package comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum ArtifactRef {
    Local(PathBuf),
    Remote(String),
}

impl ArtifactRef {
    /// Form passed to the launcher
    pub fn location(&self) -> String {
        match self {
            ArtifactRef::Local(path) => path.display().to_string(),
            ArtifactRef::Remote(url) => url.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ArtifactRef::Local(_))
    }
}

/// Interpreter and native libraries for the job's processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RuntimeEnvironment {
    /// Packed archive unpacked under `alias` in every container
    Archive { path: PathBuf, alias: String },
    /// Prebuilt container image
    Container { image: String, mounts: Vec<String> },
}

/// Everything the job needs shipped or referenced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    pub extensions: ArtifactRef,
    pub backend_assembly: ArtifactRef,
    pub logging: Option<ArtifactRef>,
    pub runtime: RuntimeEnvironment,
    pub manifest: FileManifest,
}

impl ArtifactSet {
    /// Packages in launch order
    pub fn packages(&self) -> Vec<&ArtifactRef> {
        let mut packages = vec![&self.extensions, &self.backend_assembly];
        if let Some(logging) = &self.logging {
            packages.push(logging);
        }
        packages
    }
}

/// Resolves artifacts against one work directory
pub struct ArtifactResolver {
    settings: ArtifactSettings,
    runtime: RuntimeSettings,
    fetcher: Arc<dyn ArchiveFetcher>,
}

impl ArtifactResolver {
    pub fn new(
        settings: ArtifactSettings,
        runtime: RuntimeSettings,
        fetcher: Arc<dyn ArchiveFetcher>,
    ) -> Self {
        Self {
            settings,
            runtime,
            fetcher,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.settings.work_dir
    }

    /// Resolve the artifact set for `job`
    ///
    /// `keytab` is the service keytab, refused if it would be shipped.
    pub fn resolve(&self, job: &JobRequest, keytab: Option<&Path>) -> Result<ArtifactSet, ArtifactError> {
        self.resolve_with(job, keytab, true)
    }

    /// Like [`resolve`](Self::resolve) but never downloads the archive
    pub fn plan(&self, job: &JobRequest, keytab: Option<&Path>) -> Result<ArtifactSet, ArtifactError> {
        self.resolve_with(job, keytab, false)
    }

    fn resolve_with(
        &self,
        job: &JobRequest,
        keytab: Option<&Path>,
        fetch: bool,
    ) -> Result<ArtifactSet, ArtifactError> {
        let dir = self.work_dir();
        if !dir.is_dir() {
            return Err(ConfigurationError::new(
                "artifacts.work_dir",
                format!("{} is not a directory", dir.display()),
            )
            .into());
        }

        let extensions = locate_package(dir, "extensions", &self.settings.extensions, true)?
            .ok_or_else(|| unavailable("extensions"))?;
        let backend_assembly =
            locate_package(dir, "backend_assembly", &self.settings.backend_assembly, true)?
                .ok_or_else(|| unavailable("backend_assembly"))?;
        let logging = match &self.settings.logging {
            Some(spec) => locate_package(dir, "logging", spec, false)?,
            None => None,
        };

        let runtime = self.resolve_runtime(fetch)?;
        let manifest = self.build_manifest(job, keytab)?;

        let set = ArtifactSet {
            extensions,
            backend_assembly,
            logging,
            runtime,
            manifest,
        };
        debug!(job_id = %job.job_id, files = set.manifest.len(), "artifacts resolved");
        Ok(set)
    }

    fn resolve_runtime(&self, fetch: bool) -> Result<RuntimeEnvironment, ArtifactError> {
        match self.runtime.mode {
            RuntimeMode::Container => {
                let image = self.runtime.container_image.clone().ok_or_else(|| {
                    ConfigurationError::new("runtime.container_image", "required in container mode")
                })?;
                Ok(RuntimeEnvironment::Container {
                    image,
                    mounts: self.runtime.container_mounts.clone(),
                })
            }
            RuntimeMode::Archive => {
                let archive = &self.settings.archive;
                let target = self.work_dir().join(&archive.file_name);
                if !fetch {
                    if !target.is_file() {
                        warn!(path = %target.display(), "runtime archive missing, would be fetched");
                    }
                    return Ok(RuntimeEnvironment::Archive {
                        path: target,
                        alias: archive.alias.clone(),
                    });
                }
                let status = ensure_archive(
                    self.fetcher.as_ref(),
                    &ArchiveRequest {
                        name: "archive",
                        url: archive.source_url.as_deref(),
                        target: &target,
                        sha256: archive.sha256.as_deref(),
                        attempts: archive.fetch_attempts,
                    },
                )?;
                info!(path = %target.display(), status = ?status, "runtime archive ready");
                Ok(RuntimeEnvironment::Archive {
                    path: target,
                    alias: archive.alias.clone(),
                })
            }
        }
    }

    fn build_manifest(&self, job: &JobRequest, keytab: Option<&Path>) -> Result<FileManifest, ArtifactError> {
        let dir = self.work_dir();
        let mut builder = FileManifestBuilder::new(keytab);

        builder
            .require(dir.join(&self.settings.catalog_file), FileRole::Catalog)?
            .require(job.process_graph_file.clone(), FileRole::ProcessGraph)?
            .optional(dir.join(&self.settings.client_config_file), FileRole::ClientConfig)?
            .optional(dir.join(&self.settings.credentials_file), FileRole::Credentials)?;

        if let Some(descriptor) = &job.dependency_descriptor {
            builder.require(descriptor.clone(), FileRole::DependencyDescriptor)?;
        }

        for extra in &self.settings.extra_files {
            builder.optional(dir.join(extra), FileRole::Extra)?;
        }

        Ok(builder.build())
    }
}

fn unavailable(name: &str) -> ArtifactError {
    ArtifactError::Unavailable {
        artifact: name.to_string(),
        reason: "no local match and no default location".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequestBuilder;
    use crate::mock::MockFetcher;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, JobRequest) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("layercatalog.json"), b"[]").unwrap();
        fs::write(dir.path().join("process_graph.json"), b"{}").unwrap();
        fs::write(dir.path().join("geotrellis-extensions-2.4.0.jar"), b"").unwrap();
        let job = JobRequestBuilder::new("alice", dir.path().join("process_graph.json"), "/out")
            .build()
            .unwrap();
        (dir, job)
    }

    fn resolver(dir: &Path, fetcher: Arc<MockFetcher>) -> ArtifactResolver {
        let settings = ArtifactSettings {
            work_dir: dir.to_path_buf(),
            ..ArtifactSettings::default()
        };
        ArtifactResolver::new(settings, RuntimeSettings::default(), fetcher)
    }

    #[test]
    fn test_resolve_archive_mode() {
        let (dir, job) = workspace();
        let fetcher = Arc::new(MockFetcher::new(b"zip"));
        let set = resolver(dir.path(), fetcher.clone()).resolve(&job, None).unwrap();

        assert!(set.extensions.is_local());
        assert_eq!(
            set.backend_assembly,
            ArtifactRef::Remote(crate::config::BACKEND_ASSEMBLY_URL.to_string())
        );
        assert_eq!(set.logging, None);
        assert_eq!(
            set.runtime,
            RuntimeEnvironment::Archive {
                path: dir.path().join("venv_static.zip"),
                alias: "venv".to_string()
            }
        );
        assert_eq!(set.manifest.len(), 2);
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[test]
    fn test_second_resolve_fetches_nothing() {
        let (dir, job) = workspace();
        let fetcher = Arc::new(MockFetcher::new(b"zip"));
        let resolver = resolver(dir.path(), fetcher.clone());

        let first = resolver.resolve(&job, None).unwrap();
        let second = resolver.resolve(&job, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[test]
    fn test_plan_never_fetches() {
        let (dir, job) = workspace();
        let fetcher = Arc::new(MockFetcher::new(b"zip"));
        let set = resolver(dir.path(), fetcher.clone()).plan(&job, None).unwrap();

        assert!(matches!(set.runtime, RuntimeEnvironment::Archive { .. }));
        assert_eq!(fetcher.fetch_count(), 0);
        assert!(!dir.path().join("venv_static.zip").exists());
    }

    #[test]
    fn test_container_mode_skips_archive() {
        let (dir, job) = workspace();
        let fetcher = Arc::new(MockFetcher::new(b"zip"));
        let settings = ArtifactSettings {
            work_dir: dir.path().to_path_buf(),
            ..ArtifactSettings::default()
        };
        let runtime = RuntimeSettings {
            mode: RuntimeMode::Container,
            container_image: Some("registry.example.org/openeo:latest".to_string()),
            ..RuntimeSettings::default()
        };

        let set = ArtifactResolver::new(settings, runtime, fetcher.clone())
            .resolve(&job, None)
            .unwrap();
        assert!(matches!(set.runtime, RuntimeEnvironment::Container { .. }));
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[test]
    fn test_optional_files_shipped_when_present() {
        let (dir, job) = workspace();
        fs::write(dir.path().join("client.conf"), b"").unwrap();
        fs::write(dir.path().join("http_credentials.json"), b"{}").unwrap();

        let set = resolver(dir.path(), Arc::new(MockFetcher::new(b"zip")))
            .resolve(&job, None)
            .unwrap();
        let roles: Vec<FileRole> = set.manifest.entries().iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![
                FileRole::Catalog,
                FileRole::ProcessGraph,
                FileRole::ClientConfig,
                FileRole::Credentials
            ]
        );
    }

    #[test]
    fn test_missing_catalog_is_unavailable() {
        let (dir, job) = workspace();
        fs::remove_file(dir.path().join("layercatalog.json")).unwrap();
        let err = resolver(dir.path(), Arc::new(MockFetcher::new(b"zip")))
            .resolve(&job, None)
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Unavailable { .. }));
    }

    #[test]
    fn test_keytab_as_extra_file_rejected() {
        let (dir, job) = workspace();
        let keytab = dir.path().join("openeo.keytab");
        fs::write(&keytab, b"k").unwrap();
        let settings = ArtifactSettings {
            work_dir: dir.path().to_path_buf(),
            extra_files: vec!["openeo.keytab".to_string()],
            ..ArtifactSettings::default()
        };

        let err = ArtifactResolver::new(
            settings,
            RuntimeSettings::default(),
            Arc::new(MockFetcher::new(b"zip")),
        )
        .resolve(&job, Some(&keytab))
        .unwrap_err();
        assert!(matches!(err, ArtifactError::Configuration(_)));
    }

    #[test]
    fn test_artifact_set_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ArtifactSet>();
    }
}
