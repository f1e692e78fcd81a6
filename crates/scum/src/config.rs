//! scum configuration
//!
//! Read from ~/.config/scum/config.yml unless another file is given. Every
//! field is optional; missing fields fall back to the standard paths.

use anyhow::{Context, Result};
use scum_core::Paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// age recipient used to encrypt entries
    pub public_key: PathBuf,

    /// Passphrase-protected age identity used to decrypt entries
    pub private_key: PathBuf,

    /// Directory holding the encrypted entries
    pub bag_path: PathBuf,

    /// Where `mount` exposes decrypted files
    pub mountpoint: PathBuf,

    /// Seconds before a mount is torn down
    pub mount_timeout: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        let paths = Paths::new();
        let (public_key, private_key) = paths.keys();

        Self {
            public_key,
            private_key,
            bag_path: paths.bag(),
            mountpoint: paths.mountpoint(),
            mount_timeout: DEFAULT_MOUNT_TIMEOUT_SECS,
            debug: false,
        }
    }
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        Paths::new().config_file()
    }

    /// Load from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, or the defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?
        } else {
            Self::default()
        };

        config.expanded()
    }

    /// Resolve `~` and `$VAR` in every path
    fn expanded(self) -> Result<Self> {
        Ok(Self {
            public_key: expand_path(&self.public_key)?,
            private_key: expand_path(&self.private_key)?,
            bag_path: expand_path(&self.bag_path)?,
            mountpoint: expand_path(&self.mountpoint)?,
            ..self
        })
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render config")
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path {:?}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
