//! Configuration loader using figment.
//!
//! # Feature Flags
//!
//! - `toml-config`: enables `kiln.toml`
//! - `yaml-config`: enables `kiln.yaml`, `kiln.yml` and `bot.yaml`
//!
//! # Configuration Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic merges ([`ConfigLoader::merge`])
//! 3. Profile-specific config file (`kiln.{profile}.yaml`)
//! 4. Main config file (`kiln.yaml`), or the file given to [`ConfigLoader::file`]
//! 5. Environment variables (`KILN_*`)
//!
//! # Environment Variable Mapping
//!
//! Variables use the `KILN_` prefix with `__` as the nesting separator:
//!
//! - `KILN_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `KILN_PLUGIN_DIR=/srv/bot/plugins` → `plugin_dir = "/srv/bot/plugins"`
//! - `KILN_PLUGINS__WEATHER__CITY=Hefei` → `plugins.weather.city = "Hefei"`
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .file("./bot/kiln.yaml")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::KilnConfig;

/// Environment variable holding the profile name.
pub const PROFILE_ENV: &str = "KILN_PROFILE";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "KILN_";

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Parses a profile name; `dev` and `prod` are accepted as short forms.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads `KILN_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_ENV)
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration loader with figment-based multi-source support.
///
/// A loader can be cloned and loaded again, which is how config file
/// changes are re-read with the same sources the process started with.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    figment: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    /// Overrides the search when set.
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Profile::parse(&profile.into());
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            self.search_path(cwd)
        } else {
            self
        }
    }

    /// Loads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges configuration programmatically, below files and environment.
    pub fn merge(mut self, config: KilnConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// The file [`load`](Self::load) would read: the explicit file if one
    /// was set, otherwise the first base config file found while searching.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_file {
            return Some(path.clone());
        }
        self.resolve_search_paths()
            .iter()
            .flat_map(|dir| BASE_NAMES.iter().map(move |name| dir.join(name)))
            .find(|path| path.exists())
    }

    /// Loads and returns the configuration.
    pub fn load(self) -> ConfigResult<KilnConfig> {
        let profile = self.profile.clone();
        let figment = self.build_figment()?;

        let config: KilnConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!("Failed to extract configuration: {e}"))
        })?;

        debug!(
            profile = %profile,
            logging_level = %config.logging.level,
            plugin_dir = %config.plugin_dir.display(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(KilnConfig::default()));
        figment = figment.merge(std::mem::take(&mut self.figment));

        if let Some(path) = &self.config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            info!(path = %path.display(), "Loading configuration file");
            figment = merge_config_file(figment, path)?;
        } else {
            figment = self.load_config_files(figment)?;
        }

        if self.load_env {
            trace!("Loading environment variables with {ENV_PREFIX} prefix");
            figment = figment.merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["PROFILE", "BOT_ID", "CONFIG"])
                    .split("__")
                    .map(|key| key.as_str().replace("__", ".").into()),
            );
        }

        Ok(figment)
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("kiln"));
        }
        paths
    }

    /// Walks `search_paths × base_names`. A profile-specific variant is
    /// merged when present; the first base file found ends the search.
    fn load_config_files(&self, mut figment: Figment) -> ConfigResult<Figment> {
        for search_path in self.resolve_search_paths() {
            for base_name in BASE_NAMES {
                let Some((stem, ext)) = base_name.rsplit_once('.') else {
                    continue;
                };

                let profile_path =
                    search_path.join(format!("{stem}.{}.{ext}", self.profile.as_str()));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge_config_file(figment, &profile_path)?;
                }

                let base_path = search_path.join(base_name);
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    return merge_config_file(figment, &base_path);
                }
            }
        }

        warn!("No configuration file found, using defaults");
        Ok(figment)
    }
}

/// Config file names searched for, in order, limited to enabled formats.
#[cfg(all(feature = "yaml-config", feature = "toml-config"))]
const BASE_NAMES: &[&str] = &["kiln.yaml", "kiln.yml", "kiln.toml", "bot.yaml"];
#[cfg(all(feature = "yaml-config", not(feature = "toml-config")))]
const BASE_NAMES: &[&str] = &["kiln.yaml", "kiln.yml", "bot.yaml"];
#[cfg(all(feature = "toml-config", not(feature = "yaml-config")))]
const BASE_NAMES: &[&str] = &["kiln.toml"];
#[cfg(not(any(feature = "toml-config", feature = "yaml-config")))]
const BASE_NAMES: &[&str] = &[];

/// Merges a single config file, dispatching on its extension.
fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::ParseError(format!(
            "Unsupported or disabled configuration file format: .{ext}"
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.logging.level.as_str(), "info");
        assert_eq!(config.plugin_dir, PathBuf::from("plugins"));
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(Profile::parse("prod"), Profile::Production);
        assert_eq!(Profile::parse("DEV"), Profile::Development);
        assert_eq!(Profile::parse("staging"), Profile::Custom("staging".into()));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = ConfigLoader::new()
            .file("/definitely/not/here/kiln.yaml")
            .without_env()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[cfg(feature = "yaml-config")]
    #[test]
    fn test_yaml_file_and_profile_variant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kiln.yaml"),
            "plugin_dir: bot/plugins\nplugins:\n  weather:\n    city: Hefei\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("kiln.production.yaml"),
            "help: false\nplugin_dir: ignored\n",
        )
        .unwrap();

        let loader = ConfigLoader::new()
            .profile("production")
            .search_path(dir.path())
            .without_env();
        assert_eq!(loader.locate(), Some(dir.path().join("kiln.yaml")));

        let config = loader.load().unwrap();
        // The base file is merged after the profile variant and wins.
        assert_eq!(config.plugin_dir, PathBuf::from("bot/plugins"));
        assert!(!config.help);
        assert_eq!(config.plugins["weather"]["city"], "Hefei");
    }

    #[cfg(feature = "yaml-config")]
    #[test]
    fn test_legacy_bot_yaml_is_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bot.yaml"), "auto_restart: true\n").unwrap();

        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();
        assert!(config.auto_restart);
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            "disabled_plugins = [\"noisy\"]\n[watch]\ndebounce_ms = 50\n",
        )
        .unwrap();

        let config = ConfigLoader::new().file(&path).without_env().load().unwrap();
        assert_eq!(config.disabled_plugins, vec!["noisy".to_string()]);
        assert_eq!(config.watch.debounce_ms, 50);
        assert!(config.watch.enabled);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.ini");
        std::fs::write(&path, "").unwrap();

        let err = ConfigLoader::new().file(&path).without_env().load().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_profile_from_env() {
        // SAFETY: no other test reads or writes KILN_PROFILE.
        unsafe {
            std::env::set_var(PROFILE_ENV, "production");
        }
        let profile = Profile::from_env();
        assert!(matches!(profile, Profile::Production));
        unsafe {
            std::env::remove_var(PROFILE_ENV);
        }
    }
}
