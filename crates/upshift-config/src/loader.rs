use std::path::Path;

use tracing::{debug, info};
use upshift_common::{Error, Result};

use crate::model::UpgradeConfig;

/// Reads [`UpgradeConfig`] from YAML or TOML files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the config at `path`. A missing file yields the defaults; the
    /// format is chosen by extension.
    pub fn load(path: &Path) -> Result<UpgradeConfig> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(UpgradeConfig::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(path, &contents)?;
        info!("config loaded from {}", path.display());
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<UpgradeConfig> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => {
                toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
            }
            other => Err(Error::Config(format!("unsupported config extension: {other}"))),
        }
    }
}
