//! Worker configuration.
//!
//! The cache name, bootstrap list, and offline document are carried in an
//! immutable [`WorkerConfig`] that is handed to the worker at construction.
//! Two configurations (say `v1` and `v2`) can live side by side in one
//! process.

use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;
use workflowhub_common::{load_json_config, parse_json_config, ConfigError};

/// Version tag shipped with the current build.
pub const DEFAULT_VERSION: &str = "v2";
/// Cache name prefix; the full name is `{prefix}-{version}`.
pub const DEFAULT_CACHE_PREFIX: &str = "workflowhub";
/// Offline fallback document.
pub const DEFAULT_OFFLINE_URL: &str = "/offline.html";
/// Application manifest.
pub const DEFAULT_MANIFEST_URL: &str = "/manifest.json";
/// Well-known worker script path.
pub const DEFAULT_SCRIPT_URL: &str = "/service-worker.js";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_cache_prefix() -> String {
    DEFAULT_CACHE_PREFIX.to_string()
}

fn default_offline_url() -> String {
    DEFAULT_OFFLINE_URL.to_string()
}

fn default_manifest_url() -> String {
    DEFAULT_MANIFEST_URL.to_string()
}

fn default_bootstrap() -> Vec<String> {
    vec![default_offline_url(), default_manifest_url()]
}

fn default_true() -> bool {
    true
}

/// Offline cache worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The application's own origin. Everything else is pass-through.
    pub origin: Url,

    /// Version tag embedded in the cache name.
    #[serde(default = "default_version")]
    pub version: String,

    /// Cache name prefix.
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Offline fallback document served to failed navigations.
    #[serde(default = "default_offline_url")]
    pub offline_url: String,

    /// Application manifest.
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,

    /// Same-origin paths fetched and stored at install time.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: Vec<String>,

    /// Request skip-waiting as soon as install succeeds.
    #[serde(default = "default_true")]
    pub skip_waiting_on_install: bool,
}

impl WorkerConfig {
    /// Create a config for `origin` at `version` with the default bootstrap set.
    pub fn new(origin: Url, version: impl Into<String>) -> Self {
        Self {
            origin,
            version: version.into(),
            cache_prefix: default_cache_prefix(),
            offline_url: default_offline_url(),
            manifest_url: default_manifest_url(),
            bootstrap: default_bootstrap(),
            skip_waiting_on_install: true,
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_json_config(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Set whether install requests skip-waiting.
    pub fn with_skip_waiting(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    /// Add a path to the bootstrap set.
    pub fn with_bootstrap(mut self, path: impl Into<String>) -> Self {
        self.bootstrap.push(path.into());
        self
    }

    /// The current cache name. Bumping `version` invalidates every older cache.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Resolve a path against the application origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.origin
            .join(path)
            .map_err(|e| ConfigError::invalid(format!("bad path {path}: {e}")))
    }

    /// Whether `url` belongs to the application's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::invalid("version must not be empty"));
        }
        if !self.origin.origin().is_tuple() {
            return Err(ConfigError::invalid(format!(
                "origin {} is opaque",
                self.origin
            )));
        }
        for required in [&self.offline_url, &self.manifest_url] {
            if !self.bootstrap.contains(required) {
                return Err(ConfigError::invalid(format!(
                    "bootstrap list must include {required}"
                )));
            }
        }
        for path in &self.bootstrap {
            let url = self.resolve(path)?;
            if !self.is_same_origin(&url) {
                return Err(ConfigError::invalid(format!(
                    "bootstrap entry {path} is not same-origin"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn origin() -> Url {
        Url::parse("https://app.workflowhub.test").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::new(origin(), DEFAULT_VERSION);
        assert_eq!(config.cache_name(), "workflowhub-v2");
        assert_eq!(config.bootstrap, vec!["/offline.html", "/manifest.json"]);
        assert!(config.skip_waiting_on_install);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configs_coexist() {
        let v1 = WorkerConfig::new(origin(), "v1");
        let v2 = WorkerConfig::new(origin(), "v2");
        assert_eq!(v1.cache_name(), "workflowhub-v1");
        assert_eq!(v2.cache_name(), "workflowhub-v2");
    }

    #[test]
    fn test_same_origin() {
        let config = WorkerConfig::new(origin(), "v1");
        assert!(config.is_same_origin(&Url::parse("https://app.workflowhub.test/a.js").unwrap()));
        assert!(!config.is_same_origin(&Url::parse("http://app.workflowhub.test/a.js").unwrap()));
        assert!(!config.is_same_origin(&Url::parse("https://cdn.example.com/a.js").unwrap()));
    }

    #[test]
    fn test_validate_requires_offline_document() {
        let mut config = WorkerConfig::new(origin(), "v1");
        config.bootstrap = vec!["/manifest.json".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_cross_origin_bootstrap() {
        let config = WorkerConfig::new(origin(), "v1").with_bootstrap("https://cdn.example.com/x.js");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let config = WorkerConfig::new(origin(), " ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json_str(
            r#"{"origin": "https://app.workflowhub.test", "version": "v7"}"#,
        )
        .unwrap();
        assert_eq!(config.cache_name(), "workflowhub-v7");
        assert_eq!(config.offline_url, DEFAULT_OFFLINE_URL);
        assert!(config.skip_waiting_on_install);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"origin": "https://app.workflowhub.test", "skip_waiting_on_install": false}}"#
        )
        .unwrap();

        let config = WorkerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.version, DEFAULT_VERSION);
        assert!(!config.skip_waiting_on_install);
    }

    #[test]
    fn test_from_json_requires_origin() {
        assert!(WorkerConfig::from_json_str(r#"{"version": "v1"}"#).is_err());
    }
}
