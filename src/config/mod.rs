//! Configuration merge system
//!
//! Implements the 3-layer configuration merge:
//! 1. Built-in defaults
//! 2. Host config (/etc/geo-batch-submit/config.toml or --config)
//! 3. CLI overrides (--set key=value)

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::{BuiltinDefaults, ARCHIVE_URL, BACKEND_ASSEMBLY_URL, ENTRY_POINT, EXTENSIONS_URL};
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers, overrides_to_value};
pub use settings::{
    ArchiveSettings, ArtifactSettings, ClusterSettings, EnvironmentSettings, IdentitySettings,
    PackageSpec, ResourceDefaults, RuntimeMode, RuntimeSettings, SpeculationSettings,
    SubmitterConfig,
};

/// Default host config location
pub const DEFAULT_HOST_CONFIG: &str = "/etc/geo-batch-submit/config.toml";
