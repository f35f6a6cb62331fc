//! Provider configuration and the INI configuration file.
//!
//! [`ProviderConfig`] is what [`VfsFileProvider`](crate::provider::VfsFileProvider)
//! is built from. [`ConfigFile`] is the on-disk form, which also carries
//! known AES keys so they can be submitted at startup.
//!
//! # File Format
//!
//! ```ini
//! [provider]
//! case_insensitive = true
//! max_concurrent_mounts = 16
//! global_container = global.utoc
//!
//! [keys]
//! 0x00000000000000000000000000000000 = 0x0123...
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ini::Ini;

use crate::error::{VfsError, VfsResult};
use crate::global_data::DEFAULT_GLOBAL_CONTAINER;
use crate::index::CaseSensitivity;
use crate::keys::{AesKey, KeyId};

/// Upper bound for the default mount concurrency.
pub const MAX_DEFAULT_CONCURRENT_MOUNTS: usize = 64;

const PROVIDER_SECTION: &str = "provider";
const KEYS_SECTION: &str = "keys";

/// Default mount concurrency: `min(num_cpus * 4, 64)`.
///
/// Mounting mixes index I/O with decryption, so a few tasks per core keeps
/// both busy without flooding the blocking pool.
pub fn default_max_concurrent_mounts() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 4).min(MAX_DEFAULT_CONCURRENT_MOUNTS)
}

/// Settings for a [`VfsFileProvider`](crate::provider::VfsFileProvider).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Path matching mode of the file index.
    pub case_sensitivity: CaseSensitivity,

    /// Maximum number of containers parsed at the same time.
    pub max_concurrent_mounts: usize,

    /// Name of the container that feeds the global data cache.
    pub global_container_name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            case_sensitivity: CaseSensitivity::Sensitive,
            max_concurrent_mounts: default_max_concurrent_mounts(),
            global_container_name: DEFAULT_GLOBAL_CONTAINER.to_string(),
        }
    }
}

impl ProviderConfig {
    /// Set the path matching mode.
    pub fn with_case_sensitivity(mut self, case: CaseSensitivity) -> Self {
        self.case_sensitivity = case;
        self
    }

    /// Set the mount concurrency (at least 1).
    pub fn with_max_concurrent_mounts(mut self, max: usize) -> Self {
        self.max_concurrent_mounts = max.max(1);
        self
    }

    /// Set the global container name.
    pub fn with_global_container_name(mut self, name: impl Into<String>) -> Self {
        self.global_container_name = name.into();
        self
    }
}

/// On-disk configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFile {
    pub case_insensitive: bool,
    /// `None` uses [`default_max_concurrent_mounts`].
    pub max_concurrent_mounts: Option<usize>,
    pub global_container: String,
    /// Known keys, submitted at startup.
    pub keys: BTreeMap<KeyId, AesKey>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            case_insensitive: false,
            max_concurrent_mounts: None,
            global_container: DEFAULT_GLOBAL_CONTAINER.to_string(),
            keys: BTreeMap::new(),
        }
    }
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> VfsResult<Self> {
        let path = config_file_path()
            .ok_or_else(|| VfsError::Config("Cannot determine home directory".to_string()))?;
        Self::load_from(&path)
    }

    /// Load from `path`.
    pub fn load_from(path: &Path) -> VfsResult<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| VfsError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(text: &str) -> VfsResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| VfsError::Config(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> VfsResult<Self> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some(PROVIDER_SECTION)) {
            for (key, value) in section.iter() {
                let value = value.trim();
                match key {
                    "case_insensitive" => {
                        config.case_insensitive = parse_bool(key, value)?;
                    }
                    "max_concurrent_mounts" => {
                        let max: usize = value.parse().map_err(|_| {
                            VfsError::Config(format!(
                                "provider.max_concurrent_mounts: '{}' is not a number",
                                value
                            ))
                        })?;
                        if max == 0 {
                            return Err(VfsError::Config(
                                "provider.max_concurrent_mounts must be at least 1".to_string(),
                            ));
                        }
                        config.max_concurrent_mounts = Some(max);
                    }
                    "global_container" => {
                        if value.is_empty() {
                            return Err(VfsError::Config(
                                "provider.global_container must not be empty".to_string(),
                            ));
                        }
                        config.global_container = value.to_string();
                    }
                    other => {
                        return Err(VfsError::Config(format!(
                            "Unknown setting 'provider.{}'",
                            other
                        )));
                    }
                }
            }
        }

        if let Some(section) = ini.section(Some(KEYS_SECTION)) {
            for (id, key) in section.iter() {
                let id: KeyId = id
                    .parse()
                    .map_err(|e| VfsError::Config(format!("keys: {}", e)))?;
                let key: AesKey = key
                    .parse()
                    .map_err(|e| VfsError::Config(format!("keys.{}: {}", id, e)))?;
                config.keys.insert(id, key);
            }
        }

        Ok(config)
    }

    /// Save to the default location.
    pub fn save(&self) -> VfsResult<()> {
        let path = config_file_path()
            .ok_or_else(|| VfsError::Config("Cannot determine home directory".to_string()))?;
        self.save_to(&path)
    }

    /// Save to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> VfsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut ini = Ini::new();
        ini.set_to(
            Some(PROVIDER_SECTION),
            "case_insensitive".to_string(),
            self.case_insensitive.to_string(),
        );
        ini.set_to(
            Some(PROVIDER_SECTION),
            "global_container".to_string(),
            self.global_container.clone(),
        );
        if let Some(max) = self.max_concurrent_mounts {
            ini.set_to(
                Some(PROVIDER_SECTION),
                "max_concurrent_mounts".to_string(),
                max.to_string(),
            );
        }
        for (id, key) in &self.keys {
            ini.set_to(Some(KEYS_SECTION), format!("0x{}", id), key.to_hex());
        }

        ini.write_to_file(path)?;
        Ok(())
    }

    /// Provider settings described by this file.
    pub fn provider_config(&self) -> ProviderConfig {
        let config = ProviderConfig::default()
            .with_case_sensitivity(CaseSensitivity::from_insensitive(self.case_insensitive))
            .with_global_container_name(self.global_container.clone());

        match self.max_concurrent_mounts {
            Some(max) => config.with_max_concurrent_mounts(max),
            None => config,
        }
    }
}

/// Default configuration file path: `~/.uevfs/config.ini`.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".uevfs").join("config.ini"))
}

fn parse_bool(key: &str, value: &str) -> VfsResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(VfsError::Config(format!(
            "provider.{}: '{}' is not a boolean",
            key, value
        ))),
    }
}
