//! Environment archive fetch
//!
//! Downloads land in a uniquely named `.part` file next to the target and
//! are renamed into place once complete (and verified, when pinned).
//! Concurrent resolvers may both download; the last rename wins and readers
//! never see a partial archive.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::ArtifactError;

/// Something that can download a URL into a local file
pub trait ArchiveFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Fetch errors, one per failed attempt
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out")]
    Timeout,

    #[error("HTTP {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// HTTP(S) fetcher
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let mut file = File::create(dest)?;
        let written = response.copy_to(&mut file).map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;
        file.sync_all()?;
        Ok(written)
    }
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// How the archive ended up in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// Already present (and matching the pin, if any)
    Cached,
    /// Downloaded on the given attempt
    Fetched { attempt: u32 },
}

/// Archive fetch plan for one target file
pub struct ArchiveRequest<'a> {
    pub name: &'a str,
    pub url: Option<&'a str>,
    pub target: &'a Path,
    pub sha256: Option<&'a str>,
    pub attempts: u32,
}

fn part_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()))
}

fn matches_pin(path: &Path, pin: Option<&str>) -> io::Result<bool> {
    match pin {
        None => Ok(true),
        Some(expected) => Ok(sha256_file(path)?.eq_ignore_ascii_case(expected)),
    }
}

/// Make sure the archive exists at `request.target`
pub fn ensure_archive(
    fetcher: &dyn ArchiveFetcher,
    request: &ArchiveRequest<'_>,
) -> Result<ArchiveStatus, ArtifactError> {
    let io_err = |source: io::Error| ArtifactError::Io {
        path: request.target.to_path_buf(),
        source,
    };

    if request.target.is_file() {
        if matches_pin(request.target, request.sha256).map_err(io_err)? {
            return Ok(ArchiveStatus::Cached);
        }
        warn!(
            archive = request.name,
            path = %request.target.display(),
            "cached archive does not match pinned digest, fetching again"
        );
    }

    let url = request.url.ok_or_else(|| ArtifactError::Unavailable {
        artifact: request.name.to_string(),
        reason: format!(
            "{} not present and no source URL configured",
            request.target.display()
        ),
    })?;

    let mut last_error = String::from("no attempts made");
    for attempt in 1..=request.attempts {
        let part = part_path(request.target);
        let outcome = fetcher.fetch(url, &part);

        let result = match outcome {
            Ok(bytes) => match matches_pin(&part, request.sha256) {
                Ok(true) => fs::rename(&part, request.target)
                    .map(|_| bytes)
                    .map_err(|e| e.to_string()),
                Ok(false) => Err("digest mismatch".to_string()),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(bytes) => {
                info!(archive = request.name, url, attempt, bytes, "archive fetched");
                return Ok(ArchiveStatus::Fetched { attempt });
            }
            Err(error) => {
                let _ = fs::remove_file(&part);
                warn!(archive = request.name, url, attempt, error = %error, "archive fetch failed");
                last_error = error;
            }
        }
    }

    Err(ArtifactError::Unavailable {
        artifact: request.name.to_string(),
        reason: format!(
            "fetch from {} failed after {} attempts: {}",
            url, request.attempts, last_error
        ),
    })
}
