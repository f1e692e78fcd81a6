//! Ephemeral mount of decrypted credential files
//!
//! The files exist only in memory, are served read-only to the mounting
//! user, and are unmounted once the timeout expires or the mount is
//! cancelled, whichever comes first.

pub mod fs;
pub mod fuse;

pub use fs::SecretFs;
pub use fuse::FuseBackend;

use std::collections::BTreeMap;
use std::fs::DirBuilder;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Relative path -> file content
pub type MountFiles = BTreeMap<String, Zeroizing<Vec<u8>>>;

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub mountpoint: PathBuf,
    pub timeout: Duration,
    /// Log every filesystem request
    pub debug: bool,
}

/// Why a mount ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountEnd {
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOutcome {
    pub reason: MountEnd,
    /// Number of files that were served
    pub files: usize,
}

/// Something that can expose a [`SecretFs`] at a directory
pub trait MountBackend {
    fn mount(&mut self, mountpoint: &Path, fs: SecretFs) -> Result<()>;

    /// Release the mount. Called exactly once per [`run_with`], also after a
    /// failed or partial `mount`.
    fn unmount(&mut self) -> Result<()>;
}

/// Cancellation flag shared with signal handlers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until cancelled or `timeout` elapses. Returns whether it was
    /// cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Cancel on SIGINT and SIGTERM. Can be installed once per process.
    pub fn cancel_on_signals(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || token.cancel())
            .map_err(|e| Error::Mount(format!("failed to install signal handler: {}", e)))
    }
}

/// Mount `files` through FUSE and block until the mount ends
pub fn run(options: &MountOptions, files: MountFiles, cancel: &CancelToken) -> Result<MountOutcome> {
    run_with(&mut FuseBackend::new(), options, files, cancel)
}

pub fn run_with<B: MountBackend>(
    backend: &mut B,
    options: &MountOptions,
    files: MountFiles,
    cancel: &CancelToken,
) -> Result<MountOutcome> {
    // SAFETY: getuid and getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let fs = SecretFs::new(files, uid, gid, options.debug)?;
    let count = fs.file_count();

    prepare_mountpoint(&options.mountpoint)?;

    let mut guard = MountGuard {
        backend,
        mountpoint: &options.mountpoint,
        released: false,
    };
    guard.backend.mount(&options.mountpoint, fs)?;

    info!(
        mountpoint = %options.mountpoint.display(),
        files = count,
        timeout_secs = options.timeout.as_secs(),
        "credentials mounted"
    );

    let reason = if cancel.wait(options.timeout) {
        MountEnd::Cancelled
    } else {
        MountEnd::Expired
    };

    guard.release()?;
    info!(mountpoint = %options.mountpoint.display(), ?reason, "credentials unmounted");

    Ok(MountOutcome {
        reason,
        files: count,
    })
}

/// Unmounts on drop unless released explicitly
struct MountGuard<'a, B: MountBackend> {
    backend: &'a mut B,
    mountpoint: &'a Path,
    released: bool,
}

impl<B: MountBackend> MountGuard<'_, B> {
    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.backend.unmount()
    }
}

impl<B: MountBackend> Drop for MountGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(mountpoint = %self.mountpoint.display(), "failed to unmount: {}", e);
        }
    }
}

/// Make sure `path` is an empty directory that nothing is mounted on,
/// creating it (mode 0700) when absent.
pub fn prepare_mountpoint(path: &Path) -> Result<()> {
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(|e| Error::Mount(format!("failed to create {}: {}", path.display(), e)))?;
    }

    let meta = path
        .metadata()
        .map_err(|e| Error::Mount(format!("failed to inspect {}: {}", path.display(), e)))?;
    if !meta.is_dir() {
        return Err(Error::Mount(format!("{} is not a directory", path.display())));
    }

    // A mount changes the device relative to the parent
    let parent_dev = path
        .canonicalize()
        .ok()
        .and_then(|p| p.parent().and_then(|parent| parent.metadata().ok()))
        .map(|parent| parent.dev());
    match parent_dev {
        Some(dev) if dev == meta.dev() => {}
        _ => {
            return Err(Error::Mount(format!(
                "{} is already a mountpoint",
                path.display()
            )))
        }
    }

    let occupied = path
        .read_dir()
        .map_err(|e| Error::Mount(format!("failed to read {}: {}", path.display(), e)))?
        .next()
        .is_some();
    if occupied {
        return Err(Error::Mount(format!("{} is not empty", path.display())));
    }

    Ok(())
}
