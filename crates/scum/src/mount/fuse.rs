//! FUSE backend: serves a [`SecretFs`] through /dev/fuse

use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::{FuseChannel, FuseSession, Writer};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::{MountBackend, SecretFs};
use crate::error::{Error, Result};

const FSNAME: &str = "scum";
const DEFAULT_THREADS: usize = 2;

pub struct FuseBackend {
    threads: usize,
    session: Option<FuseSession>,
    workers: Vec<JoinHandle<()>>,
}

impl FuseBackend {
    pub fn new() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            session: None,
            workers: Vec::new(),
        }
    }
}

impl Default for FuseBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MountBackend for FuseBackend {
    fn mount(&mut self, mountpoint: &Path, fs: SecretFs) -> Result<()> {
        let server = Arc::new(Server::new(fs));

        let mut session = FuseSession::new(mountpoint, FSNAME, "", true)
            .map_err(|e| Error::Mount(format!("failed to create FUSE session: {}", e)))?;
        session
            .mount()
            .map_err(|e| Error::Mount(format!("failed to mount {}: {}", mountpoint.display(), e)))?;

        // From here on unmount() has something to release
        let session = self.session.insert(session);

        for i in 0..self.threads {
            let channel = session
                .new_channel()
                .map_err(|e| Error::Mount(format!("failed to create FUSE channel: {}", e)))?;
            let server = Arc::clone(&server);

            let handle = thread::Builder::new()
                .name(format!("scum-fuse-{}", i))
                .spawn(move || {
                    debug!(thread = i, "FUSE worker started");
                    service_loop(&server, channel);
                    debug!(thread = i, "FUSE worker stopped");
                })
                .map_err(|e| Error::Mount(format!("failed to spawn FUSE worker: {}", e)))?;
            self.workers.push(handle);
        }

        info!(mountpoint = %mountpoint.display(), threads = self.workers.len(), "filesystem mounted");
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let result = session
            .umount()
            .map_err(|e| Error::Mount(format!("failed to unmount: {}", e)));

        // Workers exit once the kernel closes the session
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("FUSE worker panicked");
            }
        }

        result
    }
}

fn service_loop(server: &Server<SecretFs>, mut channel: FuseChannel) {
    loop {
        match channel.get_request() {
            Ok(Some((reader, writer))) => {
                if let Err(e) = server.handle_message(reader, Writer::FuseDev(writer), None, None) {
                    if let fuse_backend_rs::Error::EncodeMessage(ref io_err) = e {
                        if io_err.raw_os_error() == Some(libc::EBADF) {
                            debug!("FUSE session closed by kernel");
                            break;
                        }
                    }
                    warn!(error = ?e, "error handling FUSE message");
                }
            }
            Ok(None) => break,
            Err(e) => {
                let closed = matches!(
                    &e,
                    fuse_backend_rs::transport::Error::SessionFailure(msg)
                        if msg.contains("closed") || msg.contains("shutdown")
                );
                if closed {
                    break;
                }
                warn!(error = ?e, "error getting FUSE request");
            }
        }
    }
}
