//! Identity directory lookup
//!
//! The directory answers one question: how many user records match an exact
//! username. The production implementation talks FreeIPA JSON-RPC
//! (`user_find`) over HTTPS; tests use `mock::MockDirectory`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

/// Connect timeout for the directory, capped by the overall request timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity directory interface
pub trait IdentityDirectory: Send + Sync {
    /// Count user records matching `username` exactly
    fn count_users(&self, username: &str) -> Result<u64, DirectoryLookupError>;
}

/// Directory lookup errors
///
/// Never fatal on their own: the resolver logs them and falls back to the
/// direct principal.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryLookupError {
    #[error("directory request failed: {0}")]
    Transport(String),

    #[error("directory request timed out after {0:?}")]
    Timeout(Duration),

    #[error("directory returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed directory response: {0}")]
    MalformedResponse(String),

    #[error("directory not configured")]
    NotConfigured,
}

/// FreeIPA JSON-RPC client
pub struct IpaDirectory {
    client: reqwest::blocking::Client,
    url: String,
    size_limit: u32,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<UserFindResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct UserFindResult {
    count: u64,
    #[serde(default)]
    result: Option<Vec<UserEntry>>,
}

/// One matched user; FreeIPA returns attributes as lists
#[derive(Debug, Deserialize)]
struct UserEntry {
    #[serde(default)]
    uid: Vec<String>,
}

impl IpaDirectory {
    pub fn new(
        url: impl Into<String>,
        size_limit: u32,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, DirectoryLookupError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| DirectoryLookupError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            size_limit,
            timeout,
        })
    }

    /// JSON-RPC body for an exact, member-less username search
    pub fn request_body(username: &str, size_limit: u32) -> serde_json::Value {
        json!({
            "id": 0,
            "method": "user_find",
            "params": [
                [username],
                {
                    "all": false,
                    "no_members": true,
                    "sizelimit": size_limit,
                    "whoami": false,
                    "uid": username,
                }
            ]
        })
    }

    /// Count the returned entries whose `uid` equals `username` exactly
    ///
    /// LDAP matches `uid` case-insensitively, so `result.count` alone would
    /// also count `Alice` for `alice`.
    pub fn parse_count(body: &str, username: &str) -> Result<u64, DirectoryLookupError> {
        let envelope: RpcEnvelope = serde_json::from_str(body)
            .map_err(|e| DirectoryLookupError::MalformedResponse(e.to_string()))?;

        if let Some(error) = envelope.error.filter(|e| !e.is_null()) {
            return Err(DirectoryLookupError::MalformedResponse(format!(
                "rpc error: {}",
                error
            )));
        }

        let result = envelope
            .result
            .ok_or_else(|| DirectoryLookupError::MalformedResponse("missing result".to_string()))?;
        if result.count == 0 {
            return Ok(0);
        }
        let entries = result.result.ok_or_else(|| {
            DirectoryLookupError::MalformedResponse(format!(
                "count {} without user entries",
                result.count
            ))
        })?;

        Ok(entries
            .iter()
            .filter(|entry| entry.uid.iter().any(|uid| uid == username))
            .count() as u64)
    }
}

impl IdentityDirectory for IpaDirectory {
    fn count_users(&self, username: &str) -> Result<u64, DirectoryLookupError> {
        let response = self
            .client
            .post(&self.url)
            .header("Referer", &self.url)
            .header("Accept", "application/json")
            .json(&Self::request_body(username, self.size_limit))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    DirectoryLookupError::Timeout(self.timeout)
                } else {
                    DirectoryLookupError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| DirectoryLookupError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(DirectoryLookupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Self::parse_count(&body, username)
    }
}

/// Placeholder when no directory URL is configured: every lookup fails
pub struct UnconfiguredDirectory;

impl IdentityDirectory for UnconfiguredDirectory {
    fn count_users(&self, _username: &str) -> Result<u64, DirectoryLookupError> {
        Err(DirectoryLookupError::NotConfigured)
    }
}
