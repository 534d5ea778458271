//! Submission pipeline
//!
//! Runs the stages for one job, in order:
//! 1. Resolve the identity mode
//! 2. Build the resource profile
//! 3. Resolve artifacts
//! 4. Propagate the environment
//! 5. Launch
//!
//! Stages 1-4 only prepare an immutable [`SubmissionEnvelope`]; any error
//! there aborts before the cluster is contacted. Only the directory lookup
//! failure in stage 1 is absorbed (and logged).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span};

use crate::artifact::{ArchiveFetcher, ArtifactError, ArtifactResolver, ArtifactSet, HttpFetcher};
use crate::auth::{AuthResolver, IdentityDirectory, PrincipalCredential};
use crate::config::{ConfigError, EffectiveConfig};
use crate::envelope::{EnvelopeError, SubmissionEnvelope};
use crate::environment::EnvironmentPropagator;
use crate::error::ConfigurationError;
use crate::job::{JobError, JobRequest};
use crate::resources::ResourceConfigBuilder;
use crate::submit::{
    ApplicationHandle, LaunchRequest, ResourceManager, SparkSubmitLauncher, SubmissionError,
    SubmissionInvoker,
};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    ArtifactUnavailable(ArtifactError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ArtifactError> for SubmitError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::Configuration(e) => SubmitError::Configuration(e),
            other => SubmitError::ArtifactUnavailable(other),
        }
    }
}

impl SubmitError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SubmitError::Configuration(_) | SubmitError::Config(_) | SubmitError::Job(_) => 2,
            SubmitError::ArtifactUnavailable(_) => 3,
            SubmitError::Submission(_) => 4,
            SubmitError::Envelope(_) | SubmitError::Io(_) => 1,
        }
    }
}

pub type SubmitResult<T> = Result<T, SubmitError>;

/// External collaborators of the pipeline
pub struct Collaborators {
    pub directory: Arc<dyn IdentityDirectory>,
    pub fetcher: Arc<dyn ArchiveFetcher>,
    pub manager: Arc<dyn ResourceManager>,
}

/// A submitted job
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub envelope: SubmissionEnvelope,
    pub handle: ApplicationHandle,
}

/// Prepared but not launched
#[derive(Debug, Clone, Serialize)]
pub struct LaunchPlan {
    pub envelope: SubmissionEnvelope,
    pub request: LaunchRequest,
}

/// Pipeline for one configuration; reusable across jobs
pub struct SubmissionPipeline {
    auth: AuthResolver,
    resources: ResourceConfigBuilder,
    artifacts: ArtifactResolver,
    environment: EnvironmentPropagator,
    invoker: SubmissionInvoker,
    entry_point: String,
    config_digest: String,
}

impl SubmissionPipeline {
    /// Pipeline with explicit collaborators
    pub fn with_collaborators(
        config: &EffectiveConfig,
        collaborators: Collaborators,
        host_env: BTreeMap<String, String>,
    ) -> SubmitResult<Self> {
        let credential = PrincipalCredential::from_settings(&config.settings().identity)?;
        let auth = AuthResolver::new(collaborators.directory, credential);
        Ok(Self::assemble(
            config,
            auth,
            collaborators.fetcher,
            collaborators.manager,
            host_env,
        ))
    }

    /// Production pipeline: FreeIPA directory, HTTP fetcher, `spark-submit`
    pub fn from_config(config: &EffectiveConfig, host_env: BTreeMap<String, String>) -> SubmitResult<Self> {
        let settings = config.settings();
        let auth = AuthResolver::from_settings(&settings.identity, &settings.timeouts)?;
        let fetcher = HttpFetcher::new(settings.timeouts.fetch())
            .map_err(|e| ConfigurationError::new("artifacts.archive.source_url", e.to_string()))?;
        let launcher = SparkSubmitLauncher::new(
            settings.cluster.clone(),
            auth.credential().cloned(),
            settings.timeouts.submit(),
        );
        Ok(Self::assemble(
            config,
            auth,
            Arc::new(fetcher),
            Arc::new(launcher),
            host_env,
        ))
    }

    fn assemble(
        config: &EffectiveConfig,
        auth: AuthResolver,
        fetcher: Arc<dyn ArchiveFetcher>,
        manager: Arc<dyn ResourceManager>,
        host_env: BTreeMap<String, String>,
    ) -> Self {
        let settings = config.settings();
        Self {
            auth,
            resources: ResourceConfigBuilder::new(settings.resources.clone()),
            artifacts: ArtifactResolver::new(settings.artifacts.clone(), settings.runtime.clone(), fetcher),
            environment: EnvironmentPropagator::new(
                settings.environment.clone(),
                settings.runtime.clone(),
                host_env,
            ),
            invoker: SubmissionInvoker::new(settings.cluster.clone(), settings.speculation.clone(), manager),
            entry_point: settings.cluster.entry_point.clone(),
            config_digest: config.digest.clone(),
        }
    }

    pub fn auth(&self) -> &AuthResolver {
        &self.auth
    }

    /// Stages 1-4 with archive download
    pub fn prepare(&self, job: &JobRequest) -> SubmitResult<SubmissionEnvelope> {
        self.prepare_with(job, |resolver, job, keytab| resolver.resolve(job, keytab))
    }

    fn prepare_with<F>(&self, job: &JobRequest, resolve: F) -> SubmitResult<SubmissionEnvelope>
    where
        F: Fn(&ArtifactResolver, &JobRequest, Option<&std::path::Path>) -> Result<ArtifactSet, ArtifactError>,
    {
        let _span = info_span!("prepare", job_id = %job.job_id).entered();

        let identity = self.auth.resolve(job.proxy_user.as_deref())?;
        let profile = self.resources.build(&job.resources)?;
        let keytab = self.auth.credential().map(|c| c.keytab.as_path());
        let artifacts = resolve(&self.artifacts, job, keytab)?;
        let environment = self.environment.propagate(job, &profile, &artifacts);

        let envelope = SubmissionEnvelope::new(
            job,
            identity,
            profile,
            artifacts,
            environment,
            self.entry_point.clone(),
            self.config_digest.clone(),
        )?;
        info!(
            identity_mode = envelope.identity.label(),
            envelope_key = %envelope.envelope_key,
            "envelope prepared"
        );
        Ok(envelope)
    }

    /// Stage 5
    pub fn submit(&self, envelope: &SubmissionEnvelope) -> SubmitResult<ApplicationHandle> {
        Ok(self.invoker.submit(envelope)?)
    }

    /// All stages
    pub fn run(&self, job: &JobRequest) -> SubmitResult<SubmissionOutcome> {
        let envelope = self.prepare(job)?;
        let handle = self.submit(&envelope)?;
        Ok(SubmissionOutcome { envelope, handle })
    }

    /// Dry run: prepare without downloading and compose the launch request
    pub fn plan(&self, job: &JobRequest) -> SubmitResult<LaunchPlan> {
        let envelope = self.prepare_with(job, |resolver, job, keytab| resolver.plan(job, keytab))?;
        let request = self.invoker.compose(&envelope);
        Ok(LaunchPlan { envelope, request })
    }
}
