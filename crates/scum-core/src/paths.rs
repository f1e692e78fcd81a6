//! Standard paths used by scum

use std::path::PathBuf;

/// Standard scum paths
pub struct Paths {
    /// Data directory (~/.local/share/scum)
    pub data: PathBuf,
    /// Config directory (~/.config/scum)
    pub config: PathBuf,
    /// Runtime directory ($XDG_RUNTIME_DIR/scum or the data directory)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("scum");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("scum");

        // Prefer the per-user tmpfs runtime dir, fall back to data dir
        let runtime = dirs::runtime_dir()
            .map(|dir| dir.join("scum"))
            .unwrap_or_else(|| data.clone());

        Self {
            data,
            config,
            runtime,
        }
    }

    /// Default configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yml")
    }

    /// Default bag directory
    pub fn bag(&self) -> PathBuf {
        self.data.join("bag")
    }

    /// Default key file locations (public, private)
    pub fn keys(&self) -> (PathBuf, PathBuf) {
        let keys = self.data.join("keys");
        (keys.join("scum.pub"), keys.join("scum.key"))
    }

    /// Default mountpoint for ephemeral credential mounts
    pub fn mountpoint(&self) -> PathBuf {
        self.runtime.join("mnt")
    }
}
