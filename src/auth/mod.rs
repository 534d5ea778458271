//! Identity mode resolution
//!
//! Decides whether a job runs as its owner (impersonation through the service
//! principal) or as the service principal itself. The decision table:
//!
//! | candidate | directory        | mode             |
//! |-----------|------------------|------------------|
//! | none      | not queried      | direct principal |
//! | some      | count > 0        | impersonation    |
//! | some      | count == 0       | direct principal |
//! | some      | lookup failed    | direct principal |
//!
//! Direct principal mode without a configured credential is a configuration
//! error. Directory failures are logged and absorbed.

pub mod directory;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IdentitySettings;
use crate::error::ConfigurationError;
use crate::timeout::TimeoutConfig;

pub use directory::{DirectoryLookupError, IdentityDirectory, IpaDirectory, UnconfiguredDirectory};

/// Service principal and its keytab
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrincipalCredential {
    pub principal: String,
    pub keytab: PathBuf,
}

impl PrincipalCredential {
    /// Credential from `[identity]`; both fields or neither
    pub fn from_settings(settings: &IdentitySettings) -> Result<Option<Self>, ConfigurationError> {
        match (&settings.principal, &settings.keytab) {
            (Some(principal), Some(keytab)) => {
                if principal.trim().is_empty() {
                    return Err(ConfigurationError::new(
                        "identity.principal",
                        "must not be empty",
                    ));
                }
                if keytab.as_os_str().is_empty() {
                    return Err(ConfigurationError::new("identity.keytab", "must not be empty"));
                }
                Ok(Some(Self {
                    principal: principal.clone(),
                    keytab: keytab.clone(),
                }))
            }
            (Some(_), None) => Err(ConfigurationError::new(
                "identity.keytab",
                "required when identity.principal is set",
            )),
            (None, Some(_)) => Err(ConfigurationError::new(
                "identity.principal",
                "required when identity.keytab is set",
            )),
            (None, None) => Ok(None),
        }
    }
}

/// User the job runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImpersonationTarget {
    pub user: String,
}

/// How the job authenticates to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IdentityMode {
    DirectPrincipal(PrincipalCredential),
    Impersonation(ImpersonationTarget),
}

impl IdentityMode {
    /// Short label for logs and errors
    pub fn label(&self) -> &'static str {
        match self {
            IdentityMode::DirectPrincipal(_) => "direct-principal",
            IdentityMode::Impersonation(_) => "impersonation",
        }
    }
}

impl fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityMode::DirectPrincipal(c) => write!(f, "direct-principal ({})", c.principal),
            IdentityMode::Impersonation(t) => write!(f, "impersonation ({})", t.user),
        }
    }
}

/// What the directory said about the candidate user
#[derive(Debug)]
pub enum DirectoryLookup {
    /// No candidate user, directory not queried
    NotRequested,
    /// Number of matching user records
    Count { user: String, count: u64 },
    /// Lookup failed
    Failed { user: String, error: DirectoryLookupError },
}

/// Pure decision over a lookup outcome
pub fn decide(
    lookup: &DirectoryLookup,
    credential: Option<&PrincipalCredential>,
) -> Result<IdentityMode, ConfigurationError> {
    if let DirectoryLookup::Count { user, count } = lookup {
        if *count > 0 {
            return Ok(IdentityMode::Impersonation(ImpersonationTarget { user: user.clone() }));
        }
    }

    let reason = match lookup {
        DirectoryLookup::NotRequested => "no impersonation candidate".to_string(),
        DirectoryLookup::Count { user, .. } => format!("user '{}' unknown to the directory", user),
        DirectoryLookup::Failed { user, .. } => format!("directory lookup for '{}' failed", user),
    };

    credential
        .cloned()
        .map(IdentityMode::DirectPrincipal)
        .ok_or_else(|| {
            ConfigurationError::new(
                "identity.principal",
                format!("direct principal required ({}) but none configured", reason),
            )
        })
}

/// Resolves the identity mode for a job
pub struct AuthResolver {
    directory: Arc<dyn IdentityDirectory>,
    credential: Option<PrincipalCredential>,
}

impl AuthResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>, credential: Option<PrincipalCredential>) -> Self {
        Self {
            directory,
            credential,
        }
    }

    /// Resolver backed by the configured directory, or one that always
    /// falls back when no directory URL is set
    pub fn from_settings(
        settings: &IdentitySettings,
        timeouts: &TimeoutConfig,
    ) -> Result<Self, ConfigurationError> {
        let credential = PrincipalCredential::from_settings(settings)?;
        let directory: Arc<dyn IdentityDirectory> = match &settings.directory_url {
            Some(url) => Arc::new(
                IpaDirectory::new(
                    url.clone(),
                    settings.directory_size_limit,
                    timeouts.directory_lookup(),
                    settings.directory_insecure,
                )
                .map_err(|e| ConfigurationError::new("identity.directory_url", e.to_string()))?,
            ),
            None => Arc::new(UnconfiguredDirectory),
        };
        Ok(Self::new(directory, credential))
    }

    pub fn credential(&self) -> Option<&PrincipalCredential> {
        self.credential.as_ref()
    }

    /// Query the directory once for `candidate`
    pub fn lookup(&self, candidate: Option<&str>) -> DirectoryLookup {
        let Some(user) = candidate else {
            return DirectoryLookup::NotRequested;
        };

        match self.directory.count_users(user) {
            Ok(count) => {
                debug!(user = %user, count, "directory lookup");
                DirectoryLookup::Count {
                    user: user.to_string(),
                    count,
                }
            }
            Err(error) => {
                warn!(user = %user, error = %error, "directory lookup failed, falling back to direct principal");
                DirectoryLookup::Failed {
                    user: user.to_string(),
                    error,
                }
            }
        }
    }

    /// Lookup then decide
    pub fn resolve(&self, candidate: Option<&str>) -> Result<IdentityMode, ConfigurationError> {
        let lookup = self.lookup(candidate);
        let mode = decide(&lookup, self.credential.as_ref())?;
        info!(mode = mode.label(), "identity resolved");
        Ok(mode)
    }
}
