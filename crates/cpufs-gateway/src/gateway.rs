// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode and handle caches between the kernel and a served tree
//!
//! Kernel inode numbers are QID paths. Looking the same object up twice
//! replaces the earlier entry (last lookup wins); nodes are not reference
//! counted and a kernel `forget` does not evict anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cpufs_core::{FsError, FsResult, ProtocolNode};
use cpufs_proto::{Attr, AttrMask, Dirent, FsStat, OpenFlags, Qid};
use tracing::{debug, trace, Span};

/// The kernel's fixed inode number for the mount root.
pub const ROOT_INODE: u64 = 1;

/// Set on QID paths that would collide with the kernel's reserved inodes.
const RESERVED_REMAP: u64 = 1 << 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long the kernel may trust a lookup result.
    pub lookup_ttl: Duration,
    /// How long the kernel may trust fetched attributes.
    pub attr_ttl: Duration,
    /// Ask the kernel to keep cached pages across opens.
    pub keep_page_cache: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            lookup_ttl: Duration::from_secs(5),
            attr_ttl: Duration::from_secs(5),
            keep_page_cache: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LookupEntry {
    pub inode: u64,
    pub qid: Qid,
    pub attr: Attr,
    pub expiry: Instant,
}

#[derive(Clone, Debug)]
pub struct CachedAttr {
    pub attr: Attr,
    pub expiry: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenedFile {
    pub handle: u64,
    pub keep_page_cache: bool,
}

#[derive(Clone)]
struct InodeEntry {
    node: Arc<dyn ProtocolNode>,
    is_root: bool,
    qid: Qid,
}

struct OpenHandle {
    node: Arc<dyn ProtocolNode>,
    io_unit: u32,
}

struct GatewayState {
    inodes: HashMap<u64, InodeEntry>,
    handles: HashMap<u64, OpenHandle>,
    root_mtime: (u64, u64),
    keep_page_cache: bool,
}

pub struct Gateway {
    config: GatewayConfig,
    state: Mutex<GatewayState>,
    next_handle: AtomicU64,
    span: Span,
}

impl Gateway {
    /// Wrap `root` as the mount root. Fetches its attributes once.
    pub fn new(root: Box<dyn ProtocolNode>, config: GatewayConfig) -> FsResult<Self> {
        let (qid, _, attr) = root.get_attr(AttrMask::BASIC)?;
        if !qid.is_dir() {
            return Err(FsError::from_errno(libc::ENOTDIR));
        }
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INODE,
            InodeEntry { node: Arc::from(root), is_root: true, qid },
        );
        Ok(Self {
            config,
            state: Mutex::new(GatewayState {
                inodes,
                handles: HashMap::new(),
                root_mtime: (attr.mtime_sec, attr.mtime_nsec),
                keep_page_cache: config.keep_page_cache,
            }),
            next_handle: AtomicU64::new(1),
            span: Span::none(),
        })
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Kernel inode number for a QID.
    pub fn inode_for(qid: &Qid) -> u64 {
        match qid.path {
            0 | ROOT_INODE => qid.path | RESERVED_REMAP,
            path => path,
        }
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inode(&self, inode: u64) -> FsResult<InodeEntry> {
        self.state().inodes.get(&inode).cloned().ok_or(FsError::NotExist)
    }

    fn handle(&self, handle: u64) -> FsResult<Arc<dyn ProtocolNode>> {
        let state = self.state();
        state.handles.get(&handle).map(|h| h.node.clone()).ok_or(FsError::BadHandle)
    }

    fn record_handle(&self, node: Box<dyn ProtocolNode>, io_unit: u32) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.state().handles.insert(handle, OpenHandle { node: Arc::from(node), io_unit });
        handle
    }

    /// Resolve `name` in the directory `parent` and cache the result.
    pub fn look_up_inode(&self, parent: u64, name: &str) -> FsResult<LookupEntry> {
        let dir = self.inode(parent)?;
        let found = dir.node.walk_getattr(&[name.to_string()], AttrMask::BASIC)?;
        let inode = Self::inode_for(&found.qid);
        trace!(parent: &self.span, parent_inode = parent, name, inode, "lookup");
        let replaced = self.state().inodes.insert(
            inode,
            InodeEntry { node: Arc::from(found.node), is_root: false, qid: found.qid },
        );
        // Releasing a remote node talks to the server; never under the lock.
        drop(replaced);
        Ok(LookupEntry {
            inode,
            qid: found.qid,
            attr: found.attr,
            expiry: Instant::now() + self.config.lookup_ttl,
        })
    }

    /// Fetch fresh attributes for a cached inode.
    pub fn get_inode_attributes(&self, inode: u64) -> FsResult<CachedAttr> {
        let entry = self.inode(inode)?;
        let (_, valid, mut attr) = entry.node.get_attr(AttrMask::BASIC)?;
        if entry.is_root {
            let mut state = self.state();
            if valid.contains(AttrMask::MTIME) {
                state.root_mtime = (attr.mtime_sec, attr.mtime_nsec);
            } else {
                (attr.mtime_sec, attr.mtime_nsec) = state.root_mtime;
            }
        }
        Ok(CachedAttr { attr, expiry: Instant::now() + self.config.attr_ttl })
    }

    /// Open a read-only clone of the directory and return its handle.
    pub fn open_dir(&self, inode: u64) -> FsResult<u64> {
        let entry = self.inode(inode)?;
        if !entry.qid.is_dir() {
            return Err(FsError::from_errno(libc::ENOTDIR));
        }
        let (_, clone) = entry.node.walk(&[])?;
        let (_, io_unit) = clone.open(OpenFlags::READ_ONLY)?;
        let handle = self.record_handle(clone, io_unit);
        debug!(parent: &self.span, inode, handle, "opened directory");
        Ok(handle)
    }

    /// Backend entries after `offset`, limited to `count` encoded bytes.
    pub fn read_dir_entries(&self, handle: u64, offset: u64, count: u32) -> FsResult<Vec<Dirent>> {
        self.handle(handle)?.readdir(offset, count)
    }

    /// Open a read-only clone of the file for [`Gateway::read_file`].
    pub fn open_file(&self, inode: u64, flags: OpenFlags) -> FsResult<OpenedFile> {
        if !flags.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        let entry = self.inode(inode)?;
        let (_, clone) = entry.node.walk(&[])?;
        let (_, io_unit) = clone.open(OpenFlags::READ_ONLY)?;
        let handle = self.record_handle(clone, io_unit);
        let keep_page_cache = self.state().keep_page_cache;
        debug!(parent: &self.span, inode, handle, "opened file");
        Ok(OpenedFile { handle, keep_page_cache })
    }

    /// Read up to `size` bytes at `offset`, short only at end of file.
    pub fn read_file(&self, handle: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let node = self.handle(handle)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = node.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Forget a directory or file handle.
    pub fn release_handle(&self, handle: u64) {
        let removed = self.state().handles.remove(&handle);
        match removed {
            Some(open) => drop(open),
            None => debug!(parent: &self.span, handle, "release of unknown handle"),
        }
    }

    /// Preferred I/O size recorded when `handle` was opened.
    pub fn io_unit(&self, handle: u64) -> FsResult<u32> {
        self.state().handles.get(&handle).map(|h| h.io_unit).ok_or(FsError::BadHandle)
    }

    /// Filesystem statistics of the root, zeroes if the backend has none.
    pub fn stat_fs(&self) -> FsResult<FsStat> {
        match self.inode(ROOT_INODE)?.node.statfs() {
            Err(FsError::NotSupported) => Ok(FsStat::default()),
            other => other,
        }
    }

    pub fn inode_count(&self) -> usize {
        self.state().inodes.len()
    }

    pub fn handle_count(&self) -> usize {
        self.state().handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpufs_core::testing::{sample_archive, SAMPLE_MTIME};
    use cpufs_core::{ArchiveFs, Attacher, Walked};
    use cpufs_proto::QidType;
    use std::any::Any;

    fn archive_gateway() -> Gateway {
        let root = ArchiveFs::from_bytes(sample_archive()).unwrap().attach().unwrap();
        Gateway::new(root, GatewayConfig::default()).unwrap()
    }

    #[test]
    fn unknown_inodes_are_not_fatal() {
        let gw = archive_gateway();
        assert!(matches!(gw.look_up_inode(999, "b"), Err(FsError::NotExist)));
        assert!(matches!(gw.get_inode_attributes(999), Err(FsError::NotExist)));
        assert!(matches!(gw.open_dir(999), Err(FsError::NotExist)));
        assert!(matches!(gw.read_file(7, 0, 10), Err(FsError::BadHandle)));
        let b = gw.look_up_inode(ROOT_INODE, "b").unwrap();
        let c = gw.look_up_inode(b.inode, "c").unwrap();
        let hi = gw.look_up_inode(c.inode, "hi").unwrap();
        assert_eq!(gw.open_dir(hi.inode).unwrap_err().errno(), libc::ENOTDIR);
    }

    #[test]
    fn lookup_caches_by_qid_path() {
        let gw = archive_gateway();
        let b = gw.look_up_inode(ROOT_INODE, "b").unwrap();
        assert_eq!(b.inode, b.qid.path);
        assert!(b.attr.is_dir());
        assert!(b.expiry > Instant::now());
        assert_eq!(gw.inode_count(), 2);

        // Last lookup wins: the same object does not add a second entry.
        let again = gw.look_up_inode(ROOT_INODE, "b").unwrap();
        assert_eq!(again.inode, b.inode);
        assert_eq!(gw.inode_count(), 2);

        let c = gw.look_up_inode(b.inode, "c").unwrap();
        let hi = gw.look_up_inode(c.inode, "hi").unwrap();
        assert_eq!(gw.get_inode_attributes(hi.inode).unwrap().attr.size, 3);
        assert!(matches!(gw.look_up_inode(c.inode, "barf"), Err(FsError::NotExist)));
    }

    #[test]
    fn reserved_qid_paths_are_remapped() {
        let low = Qid::new(QidType::FILE, 0, 1);
        assert_eq!(Gateway::inode_for(&low), (1 << 63) | 1);
        assert_eq!(Gateway::inode_for(&Qid::new(QidType::FILE, 0, 0)), 1 << 63);
        assert_eq!(Gateway::inode_for(&Qid::new(QidType::FILE, 0, 77)), 77);
    }

    #[test]
    fn directory_handles_list_and_release() {
        let gw = archive_gateway();
        let b = gw.look_up_inode(ROOT_INODE, "b").unwrap();
        let c = gw.look_up_inode(b.inode, "c").unwrap();
        let fh = gw.open_dir(c.inode).unwrap();
        let names: Vec<_> =
            gw.read_dir_entries(fh, 0, 4096).unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, [".", "d", "hi", "hello"]);

        let after_d: Vec<_> =
            gw.read_dir_entries(fh, 2, 4096).unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(after_d, ["hi", "hello"]);

        gw.release_handle(fh);
        assert_eq!(gw.handle_count(), 0);
        assert!(matches!(gw.read_dir_entries(fh, 0, 4096), Err(FsError::BadHandle)));
    }

    #[test]
    fn files_read_through_their_handle() {
        let gw = Gateway::new(
            ArchiveFs::from_bytes(sample_archive()).unwrap().attach().unwrap(),
            GatewayConfig { keep_page_cache: true, ..Default::default() },
        )
        .unwrap();
        let b = gw.look_up_inode(ROOT_INODE, "b").unwrap();
        let c = gw.look_up_inode(b.inode, "c").unwrap();
        let hello = gw.look_up_inode(c.inode, "hello").unwrap();

        let opened = gw.open_file(hello.inode, OpenFlags::READ_ONLY).unwrap();
        assert!(opened.keep_page_cache);
        assert_eq!(gw.read_file(opened.handle, 0, 4096).unwrap(), b"hello\n");
        assert_eq!(gw.read_file(opened.handle, 4, 4096).unwrap(), b"o\n");
        assert!(matches!(
            gw.open_file(hello.inode, OpenFlags::READ_WRITE),
            Err(FsError::PermissionDenied)
        ));
    }

    #[test]
    fn statfs_reports_zeroes_when_unsupported() {
        assert_eq!(archive_gateway().stat_fs().unwrap(), FsStat::default());
    }

    /// A root whose attributes never carry a valid mtime.
    struct NoMtime;

    impl ProtocolNode for NoMtime {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn walk(&self, _names: &[String]) -> FsResult<Walked> {
            Err(FsError::NotExist)
        }

        fn open(&self, _flags: OpenFlags) -> FsResult<(Qid, u32)> {
            Err(FsError::NotSupported)
        }

        fn get_attr(&self, _mask: AttrMask) -> FsResult<(Qid, AttrMask, Attr)> {
            let attr = Attr {
                mode: libc::S_IFDIR | 0o755,
                mtime_sec: SAMPLE_MTIME,
                ..Default::default()
            };
            Ok((Qid::new(QidType::DIR, 0, 1), AttrMask::MODE, attr))
        }
    }

    #[test]
    fn root_mtime_falls_back_to_cached_value() {
        let gw = Gateway::new(Box::new(NoMtime), GatewayConfig::default()).unwrap();
        gw.state().root_mtime = (12, 34);
        let attr = gw.get_inode_attributes(ROOT_INODE).unwrap().attr;
        assert_eq!((attr.mtime_sec, attr.mtime_nsec), (12, 34));
    }

    /// Stands in for a remote node whose release waits on the server.
    struct SlowRelease {
        dir: bool,
    }

    impl Drop for SlowRelease {
        fn drop(&mut self) {
            if !self.dir {
                std::thread::sleep(Duration::from_millis(300));
            }
        }
    }

    impl ProtocolNode for SlowRelease {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn walk(&self, names: &[String]) -> FsResult<Walked> {
            let qid = Qid::new(QidType::FILE, 0, 5);
            Ok((vec![qid; names.len().max(1)], Box::new(SlowRelease { dir: false })))
        }

        fn open(&self, _flags: OpenFlags) -> FsResult<(Qid, u32)> {
            Ok((Qid::new(QidType::FILE, 0, 5), 0))
        }

        fn get_attr(&self, _mask: AttrMask) -> FsResult<(Qid, AttrMask, Attr)> {
            if self.dir {
                let attr = Attr { mode: libc::S_IFDIR | 0o755, ..Default::default() };
                return Ok((Qid::new(QidType::DIR, 0, 1), AttrMask::BASIC, attr));
            }
            let attr = Attr { mode: libc::S_IFREG | 0o644, ..Default::default() };
            Ok((Qid::new(QidType::FILE, 0, 5), AttrMask::BASIC, attr))
        }
    }

    /// Time a cache query made while another thread is releasing a node.
    fn query_during(gw: &Arc<Gateway>, release: impl FnOnce(&Gateway) + Send + 'static) -> Duration {
        let worker = {
            let gw = gw.clone();
            std::thread::spawn(move || release(&gw))
        };
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        gw.inode_count();
        let waited = start.elapsed();
        worker.join().unwrap();
        waited
    }

    #[test]
    fn slow_releases_do_not_hold_the_cache_lock() {
        let gw = Arc::new(
            Gateway::new(Box::new(SlowRelease { dir: true }), GatewayConfig::default()).unwrap(),
        );
        let first = gw.look_up_inode(ROOT_INODE, "x").unwrap();
        assert_eq!(first.inode, 5);

        // A second lookup replaces, and releases, the cached node.
        let waited = query_during(&gw, |gw| {
            gw.look_up_inode(ROOT_INODE, "x").unwrap();
        });
        assert!(waited < Duration::from_millis(200), "lookup blocked the cache for {waited:?}");
        assert_eq!(gw.inode_count(), 2);

        let opened = gw.open_file(first.inode, OpenFlags::READ_ONLY).unwrap();
        let waited = query_during(&gw, move |gw| gw.release_handle(opened.handle));
        assert!(waited < Duration::from_millis(200), "release blocked the cache for {waited:?}");
        assert_eq!(gw.handle_count(), 0);
    }
}
