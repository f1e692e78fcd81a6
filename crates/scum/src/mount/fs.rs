//! Read-only in-memory filesystem holding decrypted credential files

use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyWriter,
};
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use zeroize::Zeroizing;

use super::MountFiles;
use crate::error::{Error, Result};

pub const ROOT_INODE: u64 = 1;

const DIR_MODE: u32 = libc::S_IFDIR | 0o500;
const FILE_MODE: u32 = libc::S_IFREG | 0o400;

/// The tree never changes while mounted
const TTL: Duration = Duration::from_secs(60);

enum Node {
    Dir {
        parent: u64,
        children: BTreeMap<String, u64>,
    },
    File {
        content: Zeroizing<Vec<u8>>,
    },
}

/// Immutable file tree, readable only by its owner (and root)
pub struct SecretFs {
    /// Indexed by inode - 1
    nodes: Vec<Node>,
    uid: u32,
    gid: u32,
    debug: bool,
    created: Duration,
}

impl SecretFs {
    /// Build the tree from relative paths.
    ///
    /// Absolute paths, empty components, `.` and `..` are rejected, as is a
    /// path that is both a file and a directory.
    pub fn new(files: MountFiles, uid: u32, gid: u32, debug: bool) -> Result<Self> {
        let mut fs = Self {
            nodes: vec![Node::Dir {
                parent: ROOT_INODE,
                children: BTreeMap::new(),
            }],
            uid,
            gid,
            debug,
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO),
        };

        for (path, content) in files {
            fs.insert(&path, content)?;
        }

        Ok(fs)
    }

    fn insert(&mut self, path: &str, content: Zeroizing<Vec<u8>>) -> Result<()> {
        let invalid = |reason: &str| Error::Mount(format!("invalid mount path '{}': {}", path, reason));

        if path.starts_with('/') {
            return Err(invalid("must be relative"));
        }
        let components: Vec<&str> = path.split('/').collect();
        if components
            .iter()
            .any(|c| c.is_empty() || *c == "." || *c == "..")
        {
            return Err(invalid("contains an empty, '.' or '..' component"));
        }

        let (file_name, dirs) = components
            .split_last()
            .ok_or_else(|| invalid("empty path"))?;

        let mut parent = ROOT_INODE;
        for dir in dirs {
            parent = match self.child(parent, dir) {
                Some(ino) if matches!(self.nodes[index(ino)], Node::Dir { .. }) => ino,
                Some(_) => return Err(invalid("a parent is a file")),
                None => self.push(
                    parent,
                    dir,
                    Node::Dir {
                        parent,
                        children: BTreeMap::new(),
                    },
                ),
            };
        }

        if self.child(parent, file_name).is_some() {
            return Err(invalid("already exists"));
        }
        self.push(parent, file_name, Node::File { content });
        Ok(())
    }

    fn push(&mut self, parent: u64, name: &str, node: Node) -> u64 {
        self.nodes.push(node);
        let ino = self.nodes.len() as u64;
        if let Node::Dir { children, .. } = &mut self.nodes[index(parent)] {
            children.insert(name.to_string(), ino);
        }
        ino
    }

    fn child(&self, parent: u64, name: &str) -> Option<u64> {
        match self.nodes.get(index(parent))? {
            Node::Dir { children, .. } => children.get(name).copied(),
            Node::File { .. } => None,
        }
    }

    fn node(&self, ino: u64) -> io::Result<&Node> {
        if ino == 0 {
            return Err(errno(libc::ENOENT));
        }
        self.nodes.get(index(ino)).ok_or_else(|| errno(libc::ENOENT))
    }

    /// Number of regular files in the tree
    pub fn file_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::File { .. }))
            .count()
    }

    /// Every file as (relative path, content), sorted by path
    pub fn files(&self) -> Vec<(String, &[u8])> {
        let mut out = Vec::new();
        self.collect_files(ROOT_INODE, "", &mut out);
        out
    }

    fn collect_files<'a>(&'a self, ino: u64, prefix: &str, out: &mut Vec<(String, &'a [u8])>) {
        let Ok(node) = self.node(ino) else { return };
        match node {
            Node::File { content } => out.push((prefix.to_string(), content.as_slice())),
            Node::Dir { children, .. } => {
                for (name, child) in children {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", prefix, name)
                    };
                    self.collect_files(*child, &path, out);
                }
            }
        }
    }

    /// Resolve `name` inside directory `parent`
    pub fn lookup_name(&self, parent: u64, name: &str) -> io::Result<u64> {
        match self.node(parent)? {
            Node::Dir { children, .. } => children.get(name).copied().ok_or_else(|| errno(libc::ENOENT)),
            Node::File { .. } => Err(errno(libc::ENOTDIR)),
        }
    }

    /// Bytes of file `ino` in `[offset, offset + size)`
    pub fn read_at(&self, ino: u64, offset: u64, size: u32) -> io::Result<&[u8]> {
        match self.node(ino)? {
            Node::File { content } => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                if start >= content.len() {
                    return Ok(&[]);
                }
                let end = content.len().min(start.saturating_add(size as usize));
                Ok(&content[start..end])
            }
            Node::Dir { .. } => Err(errno(libc::EISDIR)),
        }
    }

    /// Directory listing including `.` and `..`, as (inode, name, dtype)
    pub fn entries(&self, ino: u64) -> io::Result<Vec<(u64, &str, u32)>> {
        let Node::Dir { parent, children } = self.node(ino)? else {
            return Err(errno(libc::ENOTDIR));
        };

        let mut entries = vec![
            (ino, ".", libc::DT_DIR as u32),
            (*parent, "..", libc::DT_DIR as u32),
        ];
        for (name, child) in children {
            let dtype = match self.nodes[index(*child)] {
                Node::Dir { .. } => libc::DT_DIR,
                Node::File { .. } => libc::DT_REG,
            };
            entries.push((*child, name.as_str(), dtype as u32));
        }
        Ok(entries)
    }

    /// Only the mounting user and root get through
    pub fn permits(&self, uid: u32) -> bool {
        uid == 0 || uid == self.uid
    }

    fn check(&self, ctx: &Context) -> io::Result<()> {
        if self.permits(ctx.uid) {
            Ok(())
        } else {
            Err(errno(libc::EACCES))
        }
    }

    pub fn attr(&self, ino: u64) -> io::Result<stat64> {
        let (mode, nlink, size) = match self.node(ino)? {
            Node::Dir { children, .. } => (DIR_MODE, 2, children.len() as i64),
            Node::File { content } => (FILE_MODE, 1, content.len() as i64),
        };

        // SAFETY: stat64 is a plain C struct; all-zero is a valid value.
        let mut attr: stat64 = unsafe { std::mem::zeroed() };
        attr.st_ino = ino;
        attr.st_mode = mode;
        attr.st_nlink = nlink;
        attr.st_uid = self.uid;
        attr.st_gid = self.gid;
        attr.st_size = size;
        attr.st_atime = self.created.as_secs() as i64;
        attr.st_mtime = self.created.as_secs() as i64;
        attr.st_ctime = self.created.as_secs() as i64;
        Ok(attr)
    }

    fn entry(&self, ino: u64) -> io::Result<Entry> {
        Ok(Entry {
            inode: ino,
            generation: 0,
            attr: self.attr(ino)?,
            attr_flags: 0,
            attr_timeout: TTL,
            entry_timeout: TTL,
        })
    }

    fn log(&self, op: &str, ino: u64, uid: u32) {
        if self.debug {
            debug!(op, ino, uid, "fuse request");
        }
    }
}

fn index(ino: u64) -> usize {
    (ino as usize).saturating_sub(1)
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl FileSystem for SecretFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    fn lookup(&self, ctx: &Context, parent: u64, name: &CStr) -> io::Result<Entry> {
        self.log("lookup", parent, ctx.uid);
        self.check(ctx)?;
        let name = name.to_str().map_err(|_| errno(libc::ENOENT))?;
        self.entry(self.lookup_name(parent, name)?)
    }

    fn getattr(
        &self,
        ctx: &Context,
        inode: u64,
        _handle: Option<u64>,
    ) -> io::Result<(stat64, Duration)> {
        self.log("getattr", inode, ctx.uid);
        Ok((self.attr(inode)?, TTL))
    }

    fn opendir(&self, ctx: &Context, inode: u64, _flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        self.log("opendir", inode, ctx.uid);
        self.check(ctx)?;
        match self.node(inode)? {
            Node::Dir { .. } => Ok((None, OpenOptions::empty())),
            Node::File { .. } => Err(errno(libc::ENOTDIR)),
        }
    }

    fn readdir(
        &self,
        ctx: &Context,
        inode: u64,
        _handle: u64,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        self.log("readdir", inode, ctx.uid);
        self.check(ctx)?;

        let mut written = 0usize;
        for (i, (ino, name, type_)) in self.entries(inode)?.into_iter().enumerate() {
            let next = i as u64 + 1;
            if next <= offset {
                continue;
            }
            if written >= size as usize {
                break;
            }
            let added = add_entry(DirEntry {
                ino,
                offset: next,
                type_,
                name: name.as_bytes(),
            })?;
            // Buffer full
            if added == 0 {
                break;
            }
            written += added;
        }
        Ok(())
    }

    fn open(
        &self,
        ctx: &Context,
        inode: u64,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<u64>, OpenOptions, Option<u32>)> {
        self.log("open", inode, ctx.uid);
        if (flags as i32) & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(errno(libc::EROFS));
        }
        self.check(ctx)?;
        match self.node(inode)? {
            Node::File { .. } => Ok((None, OpenOptions::KEEP_CACHE, None)),
            Node::Dir { .. } => Err(errno(libc::EISDIR)),
        }
    }

    fn read(
        &self,
        ctx: &Context,
        inode: u64,
        _handle: u64,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        self.log("read", inode, ctx.uid);
        self.check(ctx)?;
        let data = self.read_at(inode, offset, size)?;
        w.write_all(data)?;
        Ok(data.len())
    }

    fn release(
        &self,
        ctx: &Context,
        inode: u64,
        _flags: u32,
        _handle: u64,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.log("release", inode, ctx.uid);
        Ok(())
    }

    fn releasedir(&self, ctx: &Context, inode: u64, _flags: u32, _handle: u64) -> io::Result<()> {
        self.log("releasedir", inode, ctx.uid);
        Ok(())
    }

    fn access(&self, ctx: &Context, inode: u64, mask: u32) -> io::Result<()> {
        self.log("access", inode, ctx.uid);
        self.node(inode)?;
        if mask as i32 & libc::W_OK != 0 {
            return Err(errno(libc::EROFS));
        }
        self.check(ctx)
    }
}
