use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hometrack_adapters::IntakeError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Records are only accepted from registered, enabled sources.
    pub fn admit(&self, source_id: &str) -> Result<&SourceConfig, IntakeError> {
        match self.source(source_id) {
            Some(source) if source.enabled => Ok(source),
            Some(_) => Err(IntakeError::validation(source_id, "source_id", "is disabled")),
            None => Err(IntakeError::validation(source_id, "source_id", "is not registered")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub dead_letter_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub workers: usize,
    pub commit_retries: usize,
    pub queue_depth: usize,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://hometrack.db".to_string()),
            dead_letter_dir: lookup("DEAD_LETTER_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./dead_letters")),
            reports_dir: lookup("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            workers: number("HOMETRACK_WORKERS", 4),
            commit_retries: lookup("HOMETRACK_COMMIT_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5),
            queue_depth: number("HOMETRACK_QUEUE_DEPTH", 64),
            web_port: lookup("HOMETRACK_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8080),
            workspace_root: lookup("HOMETRACK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn load_sources(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(self.sources_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset_or_invalid() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "memory"),
            ("HOMETRACK_WORKERS", "0"),
            ("HOMETRACK_COMMIT_RETRIES", "2"),
            ("HOMETRACK_WEB_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.database_url, "memory");
        assert_eq!(config.workers, 4);
        assert_eq!(config.commit_retries, 2);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.web_port, 8080);
        assert_eq!(config.reports_dir, PathBuf::from("./reports"));
    }

    #[test]
    fn registry_admits_only_enabled_sources() {
        let registry = SourceRegistry::parse(
            "sources:\n  - source_id: redfin\n    display_name: Redfin\n    enabled: true\n    base_url: https://www.redfin.com\n  - source_id: trulia\n    display_name: Trulia\n    enabled: false\n",
        )
        .unwrap();
        assert_eq!(registry.enabled().count(), 1);
        assert!(registry.admit("redfin").is_ok());
        assert!(matches!(
            registry.admit("trulia"),
            Err(IntakeError::Validation { field: "source_id", .. })
        ));
        assert!(registry.admit("craigslist").is_err());
    }

    #[test]
    fn workspace_sources_file_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::load(root.join("sources.yaml")).unwrap();
        assert!(registry.admit("redfin").is_ok());
        assert!(registry.admit("zillow").is_ok());
    }
}
