//! Bag - persistent store of encrypted credential entries
//!
//! Each entry is a separate JSON document `<name>.entry` in the bag directory,
//! holding the profile type and the base64 ciphertext. Writes go through a
//! temp file in the same directory followed by an atomic rename, so a reader
//! sees either the previous entry or the new one, never a torn file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Marker file identifying a directory as a bag
const MARKER: &str = ".scum-bag";

/// Extension of entry files
const ENTRY_EXT: &str = "entry";

/// Longest accepted credential name
const MAX_NAME_LEN: usize = 128;

/// On-disk representation of one credential entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ciphertext: String,
}

/// The credential bag
#[derive(Debug)]
pub struct Bag {
    root: PathBuf,
    /// Fail every write halfway through
    #[cfg(test)]
    pub(crate) fail_writes: bool,
}

impl Bag {
    /// Open a bag, creating it on first use
    pub fn open(path: &Path) -> Result<Self> {
        match fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::Storage(format!(
                    "{} exists but is not a directory",
                    path.display()
                )));
            }
            Ok(_) => {
                let mut entries = fs::read_dir(path).map_err(|e| storage_err(path, e))?;
                if !path.join(MARKER).exists() {
                    if entries.next().is_some() {
                        return Err(Error::Storage(format!(
                            "{} is not a scum bag (no {} marker)",
                            path.display(),
                            MARKER
                        )));
                    }
                    write_marker(path)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(path).map_err(|e| storage_err(path, e))?;
                fs::set_permissions(path, Permissions::from_mode(0o700))
                    .map_err(|e| storage_err(path, e))?;
                write_marker(path)?;
                debug!(path = %path.display(), "created bag");
            }
            Err(e) => return Err(storage_err(path, e)),
        }

        Ok(Self {
            root: path.to_path_buf(),
            #[cfg(test)]
            fail_writes: false,
        })
    }

    /// Root directory of the bag
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// List entries whose name matches any of the glob patterns
    ///
    /// An empty pattern list matches every entry. The result is ordered by name.
    /// Unreadable entries are logged and left out; see [`Bag::scan`].
    pub fn list(&self, patterns: &[String]) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        for (name, kind) in self.scan(patterns)? {
            match kind {
                Ok(kind) => {
                    found.insert(name, kind);
                }
                Err(e) => warn!(name = %name, error = %e, "unreadable entry, skipping"),
            }
        }
        Ok(found)
    }

    /// Like [`Bag::list`], but unreadable entries are returned with their error
    pub fn scan(&self, patterns: &[String]) -> Result<BTreeMap<String, Result<String>>> {
        let compiled = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| Error::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut found = BTreeMap::new();
        for entry in fs::read_dir(&self.root).map_err(|e| storage_err(&self.root, e))? {
            let entry = entry.map_err(|e| storage_err(&self.root, e))?;
            let path = entry.path();

            let Some(name) = entry_name(&path) else {
                continue;
            };

            if !compiled.is_empty() && !compiled.iter().any(|p| p.matches(&name)) {
                continue;
            }

            let kind = match read_stored(&path) {
                Ok(stored) if stored.name == name => Ok(stored.kind),
                Ok(stored) => Err(Error::Storage(format!(
                    "{} holds entry {}",
                    path.display(),
                    stored.name
                ))),
                Err(e) => Err(e),
            };
            found.insert(name, kind);
        }

        Ok(found)
    }

    /// Read the ciphertext of an entry
    pub fn read(&self, name: &str, kind: &str) -> Result<Vec<u8>> {
        validate_name(name)?;

        let path = self.entry_path(name);
        let stored = match read_stored(&path) {
            Ok(stored) => stored,
            Err(Error::NotFound(_)) => return Err(Error::NotFound(name.to_string())),
            Err(e) => return Err(e),
        };

        if stored.kind != kind {
            return Err(Error::NotFound(format!("{} (type {})", name, kind)));
        }

        STANDARD
            .decode(stored.ciphertext.as_bytes())
            .map_err(|e| Error::Storage(format!("corrupt entry {}: {}", name, e)))
    }

    /// Create or atomically replace an entry
    pub fn write(&self, name: &str, kind: &str, ciphertext: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self.fail_writes {
            return self.write_via(name, kind, ciphertext, |file, bytes| {
                file.write_all(&bytes[..bytes.len() / 2])?;
                Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
            });
        }
        self.write_via(name, kind, ciphertext, |file, bytes| file.write_all(bytes))
    }

    /// Write an entry, delegating the byte transfer to `write`
    fn write_via<F>(&self, name: &str, kind: &str, ciphertext: &[u8], write: F) -> Result<()>
    where
        F: FnOnce(&mut NamedTempFile, &[u8]) -> io::Result<()>,
    {
        validate_name(name)?;

        let path = self.entry_path(name);
        let now = Utc::now();
        let created_at = match read_stored(&path) {
            Ok(previous) => previous.created_at,
            Err(_) => now,
        };

        let stored = StoredEntry {
            name: name.to_string(),
            kind: kind.to_string(),
            created_at,
            updated_at: now,
            ciphertext: STANDARD.encode(ciphertext),
        };
        let document = serde_json::to_vec_pretty(&stored)
            .map_err(|e| Error::Storage(format!("failed to encode entry {}: {}", name, e)))?;

        // The temp file is removed on drop if anything below fails
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(|e| storage_err(&self.root, e))?;
        write(&mut tmp, &document).map_err(|e| storage_err(&path, e))?;
        tmp.as_file().sync_all().map_err(|e| storage_err(&path, e))?;
        tmp.persist(&path).map_err(|e| storage_err(&path, e.error))?;

        if let Err(e) = File::open(&self.root).and_then(|dir| dir.sync_all()) {
            warn!(error = %e, "failed to sync bag directory");
        }

        debug!(name, kind, "wrote entry");
        Ok(())
    }

    /// Delete an entry
    pub fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;

        let path = self.entry_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(name.to_string())),
            Err(e) => Err(storage_err(&path, e)),
        }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, ENTRY_EXT))
    }
}

/// Validate a credential name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("name cannot be empty".to_string()));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "name longer than {} characters",
            MAX_NAME_LEN
        )));
    }

    if name.starts_with('.') {
        return Err(Error::InvalidName(format!("{} starts with '.'", name)));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
            return Err(Error::InvalidName(format!(
                "invalid character '{}' in {}",
                c, name
            )));
        }
    }

    Ok(())
}

/// Extract the entry name from an entry file path, ignoring anything else
fn entry_name(path: &Path) -> Option<String> {
    if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    validate_name(stem).ok()?;
    Some(stem.to_string())
}

fn read_stored(path: &Path) -> Result<StoredEntry> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(storage_err(path, e)),
    };

    serde_json::from_slice(&content)
        .map_err(|e| Error::Storage(format!("corrupt entry {}: {}", path.display(), e)))
}

fn write_marker(root: &Path) -> Result<()> {
    let marker = root.join(MARKER);
    fs::write(&marker, b"scum bag v1\n").map_err(|e| storage_err(&marker, e))
}

fn storage_err(path: &Path, e: io::Error) -> Error {
    Error::Storage(format!("{}: {}", path.display(), e))
}
