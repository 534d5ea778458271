//! Auxiliary files shipped with the job
//!
//! Every path appears once. The service keytab never enters the manifest.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ConfigurationError;

use super::ArtifactError;

/// Why a file is shipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Catalog,
    ProcessGraph,
    ClientConfig,
    Credentials,
    DependencyDescriptor,
    Extra,
}

impl FileRole {
    pub fn label(&self) -> &'static str {
        match self {
            FileRole::Catalog => "catalog",
            FileRole::ProcessGraph => "process_graph",
            FileRole::ClientConfig => "client_config",
            FileRole::Credentials => "credentials",
            FileRole::DependencyDescriptor => "dependency_descriptor",
            FileRole::Extra => "extra",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub role: FileRole,
}

/// Ordered, duplicate-free list of files to ship
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileManifest {
    entries: Vec<ManifestEntry>,
}

impl FileManifest {
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// How many entries point at `path`
    pub fn count_of(&self, path: &Path) -> usize {
        self.entries.iter().filter(|e| e.path == path).count()
    }
}

/// Builds a [`FileManifest`], refusing the keytab
#[derive(Debug)]
pub struct FileManifestBuilder {
    entries: Vec<ManifestEntry>,
    identities: Vec<PathBuf>,
    keytab: Option<PathBuf>,
}

/// Canonical form used for duplicate and keytab detection
fn identity(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl FileManifestBuilder {
    pub fn new(keytab: Option<&Path>) -> Self {
        Self {
            entries: Vec::new(),
            identities: Vec::new(),
            keytab: keytab.map(identity),
        }
    }

    fn push(&mut self, path: PathBuf, role: FileRole) -> Result<(), ArtifactError> {
        let id = identity(&path);
        if self.keytab.as_ref() == Some(&id) {
            return Err(ConfigurationError::new(
                "artifacts",
                format!("{} is the service keytab and must not be shipped", path.display()),
            )
            .into());
        }
        if !self.identities.contains(&id) {
            self.identities.push(id);
            self.entries.push(ManifestEntry { path, role });
        }
        Ok(())
    }

    /// Add a file that must exist
    pub fn require(&mut self, path: PathBuf, role: FileRole) -> Result<&mut Self, ArtifactError> {
        if !path.is_file() {
            return Err(ArtifactError::Unavailable {
                artifact: role.label().to_string(),
                reason: format!("{} does not exist", path.display()),
            });
        }
        self.push(path, role)?;
        Ok(self)
    }

    /// Add a file only when it exists
    pub fn optional(&mut self, path: PathBuf, role: FileRole) -> Result<&mut Self, ArtifactError> {
        if path.is_file() {
            self.push(path, role)?;
        }
        Ok(self)
    }

    pub fn build(self) -> FileManifest {
        FileManifest {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_duplicates_collapse() {
        let dir = TempDir::new().unwrap();
        let catalog = dir.path().join("layercatalog.json");
        fs::write(&catalog, b"[]").unwrap();

        let mut builder = FileManifestBuilder::new(None);
        builder.require(catalog.clone(), FileRole::Catalog).unwrap();
        builder.optional(catalog.clone(), FileRole::Extra).unwrap();
        builder
            .optional(dir.path().join(".").join("layercatalog.json"), FileRole::Extra)
            .unwrap();
        let manifest = builder.build();

        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries()[0].role, FileRole::Catalog);
    }

    #[test]
    fn test_optional_missing_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut builder = FileManifestBuilder::new(None);
        builder
            .optional(dir.path().join("client.conf"), FileRole::ClientConfig)
            .unwrap();
        assert!(builder.build().is_empty());
    }

    #[test]
    fn test_required_missing_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut builder = FileManifestBuilder::new(None);
        let err = builder
            .require(dir.path().join("layercatalog.json"), FileRole::Catalog)
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Unavailable { ref artifact, .. } if artifact == "catalog"));
    }

    #[test]
    fn test_keytab_rejected() {
        let dir = TempDir::new().unwrap();
        let keytab = dir.path().join("openeo.keytab");
        fs::write(&keytab, b"secret").unwrap();

        let mut builder = FileManifestBuilder::new(Some(&keytab));
        let err = builder.optional(keytab.clone(), FileRole::Extra).unwrap_err();
        assert!(matches!(err, ArtifactError::Configuration(_)));
    }
}
