//! Built-in defaults (layer 1)
//!
//! Published fallback locations and the serialized default configuration.

use serde::{Deserialize, Serialize};

use super::settings::SubmitterConfig;

/// Entry point run by the coordinating process
pub const ENTRY_POINT: &str =
    "venv/lib/python3.8/site-packages/openeogeotrellis/deploy/batch_job.py";

/// Published extensions package, used when none is cached locally
pub const EXTENSIONS_URL: &str = "https://artifactory.vgt.vito.be/libs-snapshot-public/org/openeo/geotrellis-extensions/2.3.0_2.12-SNAPSHOT/geotrellis-extensions-2.3.0_2.12-SNAPSHOT.jar";

/// Published backend assembly, used when none is cached locally
pub const BACKEND_ASSEMBLY_URL: &str =
    "https://artifactory.vgt.vito.be/auxdata-public/openeo/geotrellis-backend-assembly-0.4.6-openeo.jar";

/// Published runtime environment archive
pub const ARCHIVE_URL: &str =
    "https://artifactory.vgt.vito.be/auxdata-public/openeo/venv_static.zip";

/// Built-in default configuration values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    config: SubmitterConfig,
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        // Plain data only; serialization is infallible.
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}
