use std::path::{Path, PathBuf};

use harmonia_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// Reads `AppConfig` from YAML or TOML and layers environment overrides on top.
pub struct ConfigLoader;

impl ConfigLoader {
    /// `~/.harmonia/config.yml`, or `.harmonia/config.yml` when there is no home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".harmonia"))
            .unwrap_or_else(|| PathBuf::from(".harmonia"))
            .join("config.yml")
    }

    /// Load the default config file if it exists, else start from defaults.
    pub fn load_default() -> Result<AppConfig> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            debug!("no config file at {}, using defaults", path.display());
            Self::finish(AppConfig::default())
        }
    }

    pub fn load(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::parse(path, &raw)?;
        info!("loaded config from {}", path.display());
        Self::finish(config)
    }

    fn parse(path: &Path, raw: &str) -> Result<AppConfig> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
            Some("yml") | Some("yaml") => serde_yaml::from_str(raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "unsupported config format {:?} for {} (use .yml, .yaml or .toml)",
                other.unwrap_or(""),
                path.display()
            ))),
        }
    }

    fn finish(mut config: AppConfig) -> Result<AppConfig> {
        // A missing .env file is the normal case.
        let _ = dotenvy::dotenv();
        Self::apply_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `HARMONIA_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = get("HARMONIA_BACKEND") {
            config.endpoint.backend = backend.trim().to_ascii_lowercase();
        }
        if let Some(url) = get("HARMONIA_BASE_URL") {
            config.endpoint.base_url = Some(url);
        }
        if let Some(model) = get("HARMONIA_MODEL") {
            config.endpoint.model = model;
        }
        if let Some(key) = get("HARMONIA_API_KEY") {
            config.endpoint.api_key = Some(key);
        }
    }
}
