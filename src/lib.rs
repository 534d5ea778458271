//! Geo Batch Submit - batch job submission for a geospatial processing backend
//!
//! Turns a job request into a cluster application: resolves whether the job
//! runs as its owner or as the service principal, sizes the driver and
//! executors, gathers the native packages and runtime environment, builds the
//! container environment, and launches through the resource manager.

pub mod artifact;
pub mod auth;
pub mod config;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod job;
pub mod mock;
pub mod pipeline;
pub mod resources;
pub mod submit;
pub mod timeout;

pub use artifact::{ArtifactError, ArtifactResolver, ArtifactSet};
pub use auth::{AuthResolver, IdentityMode};
pub use config::{ConfigError, EffectiveConfig};
pub use envelope::SubmissionEnvelope;
pub use environment::{EnvironmentPropagator, PropagatedEnvironment};
pub use error::ConfigurationError;
pub use job::{JobRequest, JobRequestBuilder};
pub use pipeline::{Collaborators, LaunchPlan, SubmissionOutcome, SubmissionPipeline, SubmitError};
pub use resources::{ResourceConfigBuilder, ResourceHints, ResourceProfile};
pub use submit::{ApplicationHandle, LaunchRequest, SubmissionError, SubmissionInvoker};
