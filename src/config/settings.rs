//! Typed view of the merged configuration
//!
//! The merged JSON value is deserialized into [`SubmitterConfig`] once per
//! process. Every section has a complete `Default`, which is also what the
//! built-in layer serializes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::resources::MemorySize;
use crate::timeout::TimeoutConfig;

use super::defaults;

/// Complete submitter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    pub cluster: ClusterSettings,
    pub identity: IdentitySettings,
    pub resources: ResourceDefaults,
    pub artifacts: ArtifactSettings,
    pub runtime: RuntimeSettings,
    pub environment: EnvironmentSettings,
    pub speculation: SpeculationSettings,
    pub timeouts: TimeoutConfig,
}

/// How the cluster resource manager is reached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Spark master (default: "yarn")
    pub master: String,

    /// Spark deploy mode (default: "cluster")
    pub deploy_mode: String,

    /// Submission executable
    pub submit_command: String,

    /// Kerberos ticket refresh executable; `None` skips the refresh
    pub kinit_command: Option<String>,

    /// Cluster `spark-defaults.conf`, copied into the secret properties file
    pub defaults_file: Option<PathBuf>,

    /// Prefix for the application name shown by the resource manager
    pub app_name_prefix: String,

    /// Entry point executed by the coordinating process
    pub entry_point: String,

    /// Maximum application attempts (default: 1, a failed job is not relaunched)
    pub max_app_attempts: u32,

    /// Extra `--conf` entries appended verbatim
    pub extra_conf: BTreeMap<String, String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            master: "yarn".to_string(),
            deploy_mode: "cluster".to_string(),
            submit_command: "spark-submit".to_string(),
            kinit_command: Some("kinit".to_string()),
            defaults_file: Some(PathBuf::from("/etc/spark/conf/spark-defaults.conf")),
            app_name_prefix: "openEO batch".to_string(),
            entry_point: defaults::ENTRY_POINT.to_string(),
            max_app_attempts: 1,
            extra_conf: BTreeMap::new(),
        }
    }
}

/// Service identity and identity directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Kerberos principal of the submitting service
    pub principal: Option<String>,

    /// Keytab file for the principal
    pub keytab: Option<PathBuf>,

    /// Identity directory JSON-RPC endpoint; `None` disables impersonation
    pub directory_url: Option<String>,

    /// Upper bound on directory result size
    pub directory_size_limit: u32,

    /// Skip TLS certificate verification for the directory endpoint
    pub directory_insecure: bool,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            principal: None,
            keytab: None,
            directory_url: None,
            directory_size_limit: 40_000,
            directory_insecure: false,
        }
    }
}

/// Default resource profile, overridden per job by resource hints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub driver_memory: MemorySize,
    pub driver_memory_overhead: MemorySize,
    pub executor_memory: MemorySize,
    pub executor_memory_overhead: MemorySize,
    pub driver_cores: u32,
    pub executor_cores: u32,
    pub task_cores: u32,

    /// Floor of the dynamic allocation window
    pub min_workers: u32,

    /// Ceiling of the dynamic allocation window
    pub max_workers_ceiling: u32,

    pub queue: String,
    pub max_soft_errors_ratio: f64,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            driver_memory: MemorySize::from_mib(8 * 1024),
            driver_memory_overhead: MemorySize::from_mib(2 * 1024),
            executor_memory: MemorySize::from_mib(2 * 1024),
            executor_memory_overhead: MemorySize::from_mib(3 * 1024),
            driver_cores: 5,
            executor_cores: 2,
            task_cores: 1,
            min_workers: 5,
            max_workers_ceiling: 100,
            queue: "default".to_string(),
            max_soft_errors_ratio: 0.0,
        }
    }
}

/// A versioned native package searched for in the work directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Glob matched against file names in the work directory
    pub pattern: String,

    /// Published fallback location used when nothing matches locally
    #[serde(default)]
    pub default_url: Option<String>,
}

/// Runtime environment archive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// File name of the archive inside the work directory
    pub file_name: String,

    /// Alias under which the archive is unpacked in every container
    pub alias: String,

    /// Where to fetch the archive from when it is missing locally
    pub source_url: Option<String>,

    /// Optional SHA-256 pin (hex) for the archive
    pub sha256: Option<String>,

    /// Maximum fetch attempts before giving up
    pub fetch_attempts: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            file_name: "venv_static.zip".to_string(),
            alias: "venv".to_string(),
            source_url: Some(defaults::ARCHIVE_URL.to_string()),
            sha256: None,
            fetch_attempts: 3,
        }
    }
}

/// Artifact search and manifest settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    /// Local directory searched for packages and auxiliary files
    pub work_dir: PathBuf,

    pub extensions: PackageSpec,
    pub backend_assembly: PackageSpec,

    /// Optional logging package; omitted when not found
    pub logging: Option<PackageSpec>,

    pub archive: ArchiveSettings,

    /// Layer catalog shipped with every job (required)
    pub catalog_file: String,

    /// Client configuration shipped when present
    pub client_config_file: String,

    /// Extra HTTP credentials file shipped when present
    pub credentials_file: String,

    /// Further files shipped when present
    pub extra_files: Vec<String>,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            extensions: PackageSpec {
                pattern: "geotrellis-extensions-*.jar".to_string(),
                default_url: Some(defaults::EXTENSIONS_URL.to_string()),
            },
            backend_assembly: PackageSpec {
                pattern: "geotrellis-backend-assembly-*.jar".to_string(),
                default_url: Some(defaults::BACKEND_ASSEMBLY_URL.to_string()),
            },
            logging: Some(PackageSpec {
                pattern: "openeo-logging-*.jar".to_string(),
                default_url: None,
            }),
            archive: ArchiveSettings::default(),
            catalog_file: "layercatalog.json".to_string(),
            client_config_file: "client.conf".to_string(),
            credentials_file: "http_credentials.json".to_string(),
            extra_files: Vec::new(),
        }
    }
}

/// How the job's interpreter and libraries reach the containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Ship a packed environment archive with the job
    #[default]
    Archive,
    /// Run the containers from a prebuilt image
    Container,
}

/// Runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub mode: RuntimeMode,

    /// Image used in container mode
    pub container_image: Option<String>,

    /// Bind mounts for container mode
    pub container_mounts: Vec<String>,

    /// Interpreter path relative to the container working directory
    pub python: String,

    /// Native library search path
    pub library_path: String,

    /// Interpreter module search path
    pub python_path: String,

    /// Interpreter inside the image; replaces `python` in container mode
    pub container_python: String,

    /// Library search path inside the image; unset leaves the image's own
    pub container_library_path: Option<String>,

    /// Module search path inside the image; unset leaves the image's own
    pub container_python_path: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Archive,
            container_image: None,
            container_mounts: vec![
                "/var/lib/sss/pipes:/var/lib/sss/pipes:rw".to_string(),
                "/etc/krb5.conf:/etc/krb5.conf:ro".to_string(),
                "/etc/hadoop/conf/:/etc/hadoop/conf/:ro".to_string(),
            ],
            python: "venv/bin/python".to_string(),
            library_path: "venv/lib64".to_string(),
            python_path: "venv/lib64/python3.8/site-packages:venv/lib/python3.8/site-packages"
                .to_string(),
            container_python: "python3".to_string(),
            container_library_path: None,
            container_python_path: None,
        }
    }
}

/// Environment propagation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// Host variables copied to every process when set
    pub passthrough: Vec<String>,

    /// Feature flags exported to every process
    pub feature_flags: BTreeMap<String, String>,

    /// log4j configuration for the coordinating JVM
    pub log4j_config: Option<String>,

    /// Python logging configuration for the coordinating process
    pub python_logging_config: Option<String>,

    /// Directory receiving heap dumps of the coordinating JVM
    pub heap_dump_dir: String,

    /// Thread pool size of the coordinating JVM
    pub coordinator_threads: u32,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            passthrough: vec![
                "AWS_REGION".to_string(),
                "AWS_ACCESS_KEY_ID".to_string(),
                "AWS_SECRET_ACCESS_KEY".to_string(),
                "SWIFT_URL".to_string(),
            ],
            feature_flags: BTreeMap::new(),
            log4j_config: Some("venv/openeo-logging-static/log4j.properties".to_string()),
            python_logging_config: None,
            heap_dump_dir: "/data/projects/OpenEO".to_string(),
            coordinator_threads: 6,
        }
    }
}

/// Speculative re-execution of slow tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationSettings {
    pub enabled: bool,

    /// Fraction of tasks that must finish before speculation starts
    pub quantile: f64,

    /// How many times slower than the median a task must be
    pub multiplier: f64,
}

impl Default for SpeculationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            quantile: 0.9,
            multiplier: 8.0,
        }
    }
}
