//! Non-blocking job launch
//!
//! [`SubmissionInvoker`] turns a [`SubmissionEnvelope`] into a
//! [`LaunchRequest`] and hands it to a [`ResourceManager`]. The launch
//! returns as soon as the resource manager accepts the application; it never
//! waits for the job to finish. Failures are reported once, with the
//! resource manager's diagnostic, and never retried.

mod spark;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::artifact::RuntimeEnvironment;
use crate::auth::IdentityMode;
use crate::config::{ClusterSettings, SpeculationSettings};
use crate::envelope::SubmissionEnvelope;
use crate::environment::PropagatedEnvironment;
use crate::resources::ResourceProfile;

pub use spark::{parse_application_id, SecretArgs, SparkSubmitLauncher};

/// How the launch authenticates; exactly one per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum IdentityDirective {
    /// Submit and run as the service principal
    PrincipalKeytab { principal: String, keytab: PathBuf },
    /// Submit as the service principal, run as `user`
    ProxyUser { user: String },
}

impl From<&IdentityMode> for IdentityDirective {
    fn from(mode: &IdentityMode) -> Self {
        match mode {
            IdentityMode::DirectPrincipal(c) => IdentityDirective::PrincipalKeytab {
                principal: c.principal.clone(),
                keytab: c.keytab.clone(),
            },
            IdentityMode::Impersonation(t) => IdentityDirective::ProxyUser {
                user: t.user.clone(),
            },
        }
    }
}

/// Everything the resource manager needs to start the application
#[derive(Debug, Clone, Serialize)]
pub struct LaunchRequest {
    pub job_id: String,
    pub app_name: String,
    pub identity: IdentityDirective,
    pub queue: String,
    pub resources: ResourceProfile,
    pub files: Vec<PathBuf>,
    pub runtime: RuntimeEnvironment,
    pub packages: Vec<String>,
    pub conf: BTreeMap<String, String>,
    pub environment: PropagatedEnvironment,
    pub entry_point: String,
    pub arguments: Vec<String>,
}

/// Opaque handle of a launched application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationHandle {
    pub application_id: String,
}

/// Launch failures as reported by the resource manager
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("resource manager unreachable: {0}")]
    Unreachable(String),

    #[error("no acceptance within {0:?}")]
    Timeout(Duration),

    #[error("failed to start launcher: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A launch that did not produce an application
#[derive(Debug, thiserror::Error)]
#[error("submission of job {job_id} ({identity_mode}) failed: {source}")]
pub struct SubmissionError {
    pub job_id: String,
    pub identity_mode: String,
    #[source]
    pub source: LaunchError,
}

impl SubmissionError {
    /// Resource manager diagnostic text
    pub fn diagnostic(&self) -> String {
        self.source.to_string()
    }
}

/// Something that can start an application on the cluster
pub trait ResourceManager: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<ApplicationHandle, LaunchError>;
}

/// Composes and submits launch requests
pub struct SubmissionInvoker {
    cluster: ClusterSettings,
    speculation: SpeculationSettings,
    manager: Arc<dyn ResourceManager>,
}

impl SubmissionInvoker {
    pub fn new(
        cluster: ClusterSettings,
        speculation: SpeculationSettings,
        manager: Arc<dyn ResourceManager>,
    ) -> Self {
        Self {
            cluster,
            speculation,
            manager,
        }
    }

    /// Application name shown by the resource manager
    pub fn app_name(&self, envelope: &SubmissionEnvelope) -> String {
        let title = envelope
            .title
            .as_deref()
            .map(|t| format!("{}_", t.split_whitespace().collect::<Vec<_>>().join("_")))
            .unwrap_or_default();
        format!(
            "{}_{}{}_user {}",
            self.cluster.app_name_prefix, title, envelope.job_id, envelope.user_id
        )
    }

    /// Cluster configuration entries for one launch
    pub fn conf(&self, profile: &ResourceProfile) -> BTreeMap<String, String> {
        let mut conf = BTreeMap::new();
        let mut set = |k: &str, v: String| {
            conf.insert(k.to_string(), v);
        };

        set("spark.yarn.submit.waitAppCompletion", "false".to_string());
        set("spark.yarn.maxAppAttempts", self.cluster.max_app_attempts.to_string());
        set("spark.task.cpus", profile.task_cores.to_string());

        set("spark.dynamicAllocation.enabled", "true".to_string());
        set("spark.shuffle.service.enabled", "true".to_string());
        set("spark.dynamicAllocation.minExecutors", profile.min_workers.to_string());
        set("spark.dynamicAllocation.maxExecutors", profile.max_workers.to_string());

        set("spark.speculation", self.speculation.enabled.to_string());
        if self.speculation.enabled {
            set("spark.speculation.quantile", self.speculation.quantile.to_string());
            set("spark.speculation.multiplier", self.speculation.multiplier.to_string());
        }

        if profile.profile {
            set("spark.python.profile", "true".to_string());
        }

        for (key, value) in &self.cluster.extra_conf {
            set(key.as_str(), value.clone());
        }
        conf
    }

    /// Build the launch request for `envelope`
    pub fn compose(&self, envelope: &SubmissionEnvelope) -> LaunchRequest {
        LaunchRequest {
            job_id: envelope.job_id.clone(),
            app_name: self.app_name(envelope),
            identity: IdentityDirective::from(&envelope.identity),
            queue: envelope.profile.queue.clone(),
            resources: envelope.profile.clone(),
            files: envelope
                .artifacts
                .manifest
                .paths()
                .map(|p| p.to_path_buf())
                .collect(),
            runtime: envelope.artifacts.runtime.clone(),
            packages: envelope
                .artifacts
                .packages()
                .into_iter()
                .map(|p| p.location())
                .collect(),
            conf: self.conf(&envelope.profile),
            environment: envelope.environment.clone(),
            entry_point: envelope.entry_point.clone(),
            arguments: envelope.arguments.clone(),
        }
    }

    /// Launch `envelope`, returning as soon as the application is accepted
    pub fn submit(&self, envelope: &SubmissionEnvelope) -> Result<ApplicationHandle, SubmissionError> {
        let request = self.compose(envelope);
        let mode = envelope.identity.label();

        match self.manager.launch(&request) {
            Ok(handle) => {
                info!(
                    job_id = %envelope.job_id,
                    identity_mode = mode,
                    application_id = %handle.application_id,
                    envelope_key = %envelope.envelope_key,
                    "job submitted"
                );
                Ok(handle)
            }
            Err(source) => {
                error!(
                    job_id = %envelope.job_id,
                    identity_mode = mode,
                    error = %source,
                    "job submission failed"
                );
                Err(SubmissionError {
                    job_id: envelope.job_id.clone(),
                    identity_mode: mode.to_string(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ImpersonationTarget, PrincipalCredential};
    use crate::config::ResourceDefaults;
    use crate::resources::{ResourceConfigBuilder, ResourceHints};

    fn profile(hints: serde_json::Value) -> ResourceProfile {
        ResourceConfigBuilder::new(ResourceDefaults::default())
            .build(&serde_json::from_value::<ResourceHints>(hints).unwrap())
            .unwrap()
    }

    fn invoker() -> SubmissionInvoker {
        SubmissionInvoker::new(
            ClusterSettings::default(),
            SpeculationSettings::default(),
            Arc::new(crate::mock::MockResourceManager::new()),
        )
    }

    #[test]
    fn test_directive_from_mode() {
        let direct = IdentityMode::DirectPrincipal(PrincipalCredential {
            principal: "openeo@REALM".to_string(),
            keytab: PathBuf::from("/opt/openeo.keytab"),
        });
        assert!(matches!(
            IdentityDirective::from(&direct),
            IdentityDirective::PrincipalKeytab { .. }
        ));

        let proxied = IdentityMode::Impersonation(ImpersonationTarget {
            user: "bob".to_string(),
        });
        assert_eq!(
            IdentityDirective::from(&proxied),
            IdentityDirective::ProxyUser {
                user: "bob".to_string()
            }
        );
    }

    #[test]
    fn test_conf_is_non_blocking_with_dynamic_allocation() {
        let conf = invoker().conf(&profile(serde_json::json!({"max-executors": 20})));
        assert_eq!(conf["spark.yarn.submit.waitAppCompletion"], "false");
        assert_eq!(conf["spark.dynamicAllocation.enabled"], "true");
        assert_eq!(conf["spark.dynamicAllocation.minExecutors"], "5");
        assert_eq!(conf["spark.dynamicAllocation.maxExecutors"], "20");
        assert_eq!(conf["spark.speculation"], "true");
        assert_eq!(conf["spark.speculation.quantile"], "0.9");
        assert_eq!(conf["spark.speculation.multiplier"], "8");
        assert!(!conf.contains_key("spark.python.profile"));
    }

    #[test]
    fn test_profile_flag_enables_python_profiling() {
        let conf = invoker().conf(&profile(serde_json::json!({"profile": true})));
        assert_eq!(conf["spark.python.profile"], "true");
    }

    #[test]
    fn test_extra_conf_appended() {
        let mut cluster = ClusterSettings::default();
        cluster
            .extra_conf
            .insert("spark.executor.heartbeatInterval".to_string(), "60s".to_string());
        let invoker = SubmissionInvoker::new(
            cluster,
            SpeculationSettings::default(),
            Arc::new(crate::mock::MockResourceManager::new()),
        );
        let conf = invoker.conf(&profile(serde_json::json!({})));
        assert_eq!(conf["spark.executor.heartbeatInterval"], "60s");
    }
}
