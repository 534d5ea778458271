//! In-process mocks of the external collaborators
//!
//! - [`MockDirectory`]: identity directory with a fixed user set
//! - [`MockFetcher`]: archive source serving fixed bytes
//! - [`MockResourceManager`]: resource manager recording launch requests
//!
//! All three count their calls and accept injected failures.

mod failure;

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::artifact::{ArchiveFetcher, FetchError};
use crate::auth::{DirectoryLookupError, IdentityDirectory};
use crate::submit::{ApplicationHandle, LaunchError, LaunchRequest, ResourceManager};

pub use failure::{FailureConfig, FailureInjector, Operation};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identity directory knowing a fixed set of users
#[derive(Default)]
pub struct MockDirectory {
    users: HashSet<String>,
    lookups: AtomicU32,
    failures: Mutex<FailureInjector>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.insert(user.into());
        self
    }

    /// Every lookup fails with a transport error
    pub fn failing(self) -> Self {
        self.with_failure(FailureConfig::error("TRANSPORT", "connection reset"))
    }

    pub fn with_failure(self, config: FailureConfig) -> Self {
        lock(&self.failures).inject(Operation::Lookup, config);
        self
    }

    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl IdentityDirectory for MockDirectory {
    fn count_users(&self, username: &str) -> Result<u64, DirectoryLookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = lock(&self.failures).check(Operation::Lookup) {
            return Err(match failure.code() {
                "TIMEOUT" => DirectoryLookupError::Timeout(Duration::from_secs(10)),
                "MALFORMED" => DirectoryLookupError::MalformedResponse(failure.message()),
                _ => DirectoryLookupError::Transport(failure.message()),
            });
        }

        Ok(u64::from(self.users.contains(username)))
    }
}

/// Archive source serving fixed content
pub struct MockFetcher {
    content: Vec<u8>,
    fetches: AtomicU32,
    failures: Mutex<FailureInjector>,
}

impl MockFetcher {
    pub fn new(content: &[u8]) -> Self {
        Self {
            content: content.to_vec(),
            fetches: AtomicU32::new(0),
            failures: Mutex::new(FailureInjector::new()),
        }
    }

    /// First `times` fetches fail with HTTP 503
    pub fn failing_times(self, times: u32) -> Self {
        self.with_failure(FailureConfig::error("HTTP_503", "service unavailable").with_fail_count(times))
    }

    pub fn with_failure(self, config: FailureConfig) -> Self {
        lock(&self.failures).inject(Operation::Fetch, config);
        self
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ArchiveFetcher for MockFetcher {
    fn fetch(&self, _url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = lock(&self.failures).check(Operation::Fetch) {
            return Err(match failure.code() {
                "TIMEOUT" => FetchError::Timeout,
                "HTTP_503" => FetchError::Status(503),
                _ => FetchError::Transport(failure.message()),
            });
        }

        fs::write(dest, &self.content)?;
        Ok(self.content.len() as u64)
    }
}

/// Resource manager accepting every launch and recording the requests
pub struct MockResourceManager {
    requests: Mutex<Vec<LaunchRequest>>,
    sequence: AtomicU32,
    cluster_timestamp: u64,
    failures: Mutex<FailureInjector>,
}

impl Default for MockResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            sequence: AtomicU32::new(0),
            cluster_timestamp: 1_700_000_000_000,
            failures: Mutex::new(FailureInjector::new()),
        }
    }

    /// Launches fail with the given code:
    /// `REJECTED`, `AUTH`, `UNREACHABLE` or `TIMEOUT`
    pub fn with_failure(self, config: FailureConfig) -> Self {
        lock(&self.failures).inject(Operation::Launch, config);
        self
    }

    pub fn launch_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<LaunchRequest> {
        lock(&self.requests).clone()
    }
}

impl ResourceManager for MockResourceManager {
    fn launch(&self, request: &LaunchRequest) -> Result<ApplicationHandle, LaunchError> {
        lock(&self.requests).push(request.clone());

        if let Some(failure) = lock(&self.failures).check(Operation::Launch) {
            return Err(match failure.code() {
                "AUTH" => LaunchError::Authentication(failure.message()),
                "UNREACHABLE" => LaunchError::Unreachable(failure.message()),
                "TIMEOUT" => LaunchError::Timeout(Duration::from_secs(300)),
                _ => LaunchError::Rejected(failure.message()),
            });
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ApplicationHandle {
            application_id: format!("application_{}_{:04}", self.cluster_timestamp, seq),
        })
    }
}
