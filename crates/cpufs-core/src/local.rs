// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Real-filesystem backend

use std::any::Any;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use cpufs_proto::{
    AccessMode, Attr, AttrMask, Dirent, FsStat, OpenFlags, Qid, QidType, SetAttr, SetAttrMask,
    AT_REMOVEDIR,
};
use nix::fcntl::AT_FDCWD;
use nix::sys::stat::{
    fchmodat, makedev, mknod, utimensat, FchmodatFlags, Mode, SFlag, UtimensatFlags,
};
use nix::sys::statvfs::statvfs;
use nix::sys::time::TimeSpec;
use nix::unistd::truncate;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::node::{check_name, Attacher, ProtocolNode, Walked};

/// Magic reported in `Rstatfs`; the kernel client ignores it.
const V9FS_MAGIC: u32 = 0x0102_1997;

/// Serves the directory tree under `root`.
#[derive(Clone, Debug)]
pub struct LocalFs {
    root: Arc<PathBuf>,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: Arc::new(root.into()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Attacher for LocalFs {
    fn attach(&self) -> FsResult<Box<dyn ProtocolNode>> {
        let meta = fs::symlink_metadata(self.root.as_path())?;
        if !meta.is_dir() {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::ENOTDIR)));
        }
        Ok(Box::new(LocalNode::new(self.root.clone(), self.root.to_path_buf())))
    }
}

struct OpenFile {
    file: File,
    append: bool,
}

/// A path inside a [`LocalFs`] tree, optionally opened.
pub struct LocalNode {
    root: Arc<PathBuf>,
    path: RwLock<PathBuf>,
    file: OnceLock<OpenFile>,
}

fn qid_of(meta: &fs::Metadata) -> Qid {
    let version = (meta.mtime() as u64)
        .wrapping_mul(1000)
        .wrapping_add(meta.mtime_nsec() as u64 / 1_000_000);
    Qid::new(QidType::from_mode(meta.mode()), version as u32, meta.ino())
}

/// Times before the epoch are reported as the epoch itself.
fn since_epoch(sec: i64, nsec: i64) -> (u64, u64) {
    if sec < 0 {
        (0, 0)
    } else {
        (sec as u64, nsec.clamp(0, 999_999_999) as u64)
    }
}

fn attr_of(meta: &fs::Metadata) -> Attr {
    let (atime_sec, atime_nsec) = since_epoch(meta.atime(), meta.atime_nsec());
    let (mtime_sec, mtime_nsec) = since_epoch(meta.mtime(), meta.mtime_nsec());
    let (ctime_sec, ctime_nsec) = since_epoch(meta.ctime(), meta.ctime_nsec());
    Attr {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime_sec,
        atime_nsec,
        mtime_sec,
        mtime_nsec,
        ctime_sec,
        ctime_nsec,
        ..Default::default()
    }
}

/// `utimensat` argument for one timestamp of a `Tsetattr`.
fn timespec(set: bool, explicit: bool, sec: u64, nsec: u64) -> FsResult<TimeSpec> {
    if !set {
        return Ok(TimeSpec::UTIME_OMIT);
    }
    if !explicit {
        return Ok(TimeSpec::UTIME_NOW);
    }
    let sec = libc::time_t::try_from(sec).map_err(|_| FsError::InvalidArgument)?;
    Ok(TimeSpec::new(sec, nsec.min(999_999_999) as _))
}

impl LocalNode {
    fn new(root: Arc<PathBuf>, path: PathBuf) -> Self {
        Self { root, path: RwLock::new(path), file: OnceLock::new() }
    }

    /// Current tracked path.
    pub fn path(&self) -> PathBuf {
        self.path.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn child(&self, name: &str) -> FsResult<PathBuf> {
        check_name(name)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        Ok(self.path().join(name))
    }

    fn opened(&self) -> FsResult<&OpenFile> {
        self.file.get().ok_or(FsError::BadHandle)
    }

    fn peer<'a>(&self, other: &'a dyn ProtocolNode) -> FsResult<&'a LocalNode> {
        other.as_any().downcast_ref::<LocalNode>().ok_or(FsError::InvalidArgument)
    }

    fn qid_at(path: &Path) -> FsResult<Qid> {
        Ok(qid_of(&fs::symlink_metadata(path)?))
    }
}

impl ProtocolNode for LocalNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn walk(&self, names: &[String]) -> FsResult<Walked> {
        let mut path = self.path();
        let mut qids = Vec::with_capacity(names.len().max(1));
        if names.is_empty() {
            qids.push(Self::qid_at(&path)?);
        }
        for name in names {
            check_name(name)?;
            match name.as_str() {
                "." => {}
                // Never ascend above the served root.
                ".." => {
                    if path.as_path() != self.root.as_path() {
                        path.pop();
                    }
                }
                _ => path.push(name),
            }
            qids.push(Self::qid_at(&path)?);
        }
        let node: Box<dyn ProtocolNode> = Box::new(LocalNode::new(self.root.clone(), path));
        Ok((qids, node))
    }

    fn open(&self, flags: OpenFlags) -> FsResult<(Qid, u32)> {
        let path = self.path();
        let meta = fs::symlink_metadata(&path)?;
        let mut opts = OpenOptions::new();
        let writable = match flags.access_mode() {
            AccessMode::ReadOnly => {
                opts.read(true);
                false
            }
            AccessMode::WriteOnly => {
                opts.write(true);
                true
            }
            AccessMode::ReadWrite => {
                opts.read(true).write(true);
                true
            }
        };
        if flags.append() {
            opts.append(true);
        }
        if flags.truncate() {
            if writable {
                opts.truncate(true);
            } else {
                opts.custom_flags(libc::O_TRUNC);
            }
        }
        let file = opts.open(&path)?;
        self.file
            .set(OpenFile { file, append: flags.append() })
            .map_err(|_| FsError::BadHandle)?;
        debug!(path = %path.display(), flags = flags.0, "opened");
        Ok((qid_of(&meta), 0))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        Ok(self.opened()?.file.read_at(buf, offset)?)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        let open = self.opened()?;
        if open.append {
            // Append-only handles cannot honor an offset; the kernel places
            // the data at end of file.
            return Ok((&open.file).write(data)?);
        }
        Ok(open.file.write_at(data, offset)?)
    }

    fn get_attr(&self, _mask: AttrMask) -> FsResult<(Qid, AttrMask, Attr)> {
        let meta = fs::symlink_metadata(self.path())?;
        Ok((qid_of(&meta), AttrMask::BASIC, attr_of(&meta)))
    }

    /// Nothing here opens the file, so FIFOs and write-only files are safe
    /// to update. Mode changes on a symlink are refused: Linux links carry
    /// no permissions, and `chmod` through one would change its target.
    /// Owner and time updates apply to the link itself.
    fn set_attr(&self, valid: SetAttrMask, attr: SetAttr) -> FsResult<()> {
        let path = self.path();
        if valid.contains(SetAttrMask::MODE) {
            if fs::symlink_metadata(&path)?.file_type().is_symlink() {
                return Err(FsError::NotSupported);
            }
            let mode = Mode::from_bits_truncate(attr.mode & 0o7777);
            fchmodat(AT_FDCWD, path.as_path(), mode, FchmodatFlags::FollowSymlink)?;
        }
        if valid.contains(SetAttrMask::UID) || valid.contains(SetAttrMask::GID) {
            let uid = valid.contains(SetAttrMask::UID).then_some(attr.uid);
            let gid = valid.contains(SetAttrMask::GID).then_some(attr.gid);
            std::os::unix::fs::lchown(&path, uid, gid)?;
        }
        if valid.contains(SetAttrMask::SIZE) {
            let len = libc::off_t::try_from(attr.size).map_err(|_| FsError::InvalidArgument)?;
            truncate(path.as_path(), len)?;
        }
        let set_atime = valid.contains(SetAttrMask::ATIME);
        let set_mtime = valid.contains(SetAttrMask::MTIME);
        if set_atime || set_mtime {
            let atime = timespec(
                set_atime,
                valid.contains(SetAttrMask::ATIME_SET),
                attr.atime_sec,
                attr.atime_nsec,
            )?;
            let mtime = timespec(
                set_mtime,
                valid.contains(SetAttrMask::MTIME_SET),
                attr.mtime_sec,
                attr.mtime_nsec,
            )?;
            utimensat(AT_FDCWD, path.as_path(), &atime, &mtime, UtimensatFlags::NoFollowSymlink)?;
        }
        Ok(())
    }

    fn readdir(&self, offset: u64, count: u32) -> FsResult<Vec<Dirent>> {
        let path = self.path();
        let mut entries = fs::read_dir(&path)?.collect::<Result<Vec<_>, _>>()?;
        // Sorted so that offsets handed out by one call still mean the same
        // entry on the next.
        entries.sort_by_key(|e| e.file_name());

        let mut out = Vec::new();
        let mut used = 0usize;
        for (pos, entry) in entries.iter().enumerate().skip(offset as usize) {
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let ent = Dirent {
                qid: qid_of(&meta),
                offset: pos as u64 + 1,
                kind: Dirent::kind_from_mode(meta.mode()),
                name: entry.file_name().to_string_lossy().into_owned(),
            };
            if used + ent.wire_size() > count as usize {
                break;
            }
            used += ent.wire_size();
            out.push(ent);
        }
        Ok(out)
    }

    fn create(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
        _gid: u32,
    ) -> FsResult<(Box<dyn ProtocolNode>, Qid, u32)> {
        let path = self.child(name)?;
        let node = LocalNode::new(self.root.clone(), path.clone());
        let mut opts = OpenOptions::new();
        match flags.access_mode() {
            AccessMode::ReadOnly => opts.read(true),
            AccessMode::WriteOnly => opts.write(true),
            AccessMode::ReadWrite => opts.read(true).write(true),
        };
        let excl = if flags.exclusive() { libc::O_EXCL } else { 0 };
        opts.custom_flags(libc::O_CREAT | excl)
            .mode(mode & 0o7777)
            .append(flags.append());
        let file = opts.open(&path)?;
        let qid = qid_of(&file.metadata()?);
        node.file
            .set(OpenFile { file, append: flags.append() })
            .map_err(|_| FsError::BadHandle)?;
        debug!(path = %path.display(), "created");
        let node: Box<dyn ProtocolNode> = Box::new(node);
        Ok((node, qid, 0))
    }

    fn mkdir(&self, name: &str, mode: u32, _gid: u32) -> FsResult<Qid> {
        let path = self.child(name)?;
        DirBuilder::new().mode(mode & 0o7777).create(&path)?;
        Self::qid_at(&path)
    }

    fn symlink(&self, target: &str, name: &str, _gid: u32) -> FsResult<Qid> {
        let path = self.child(name)?;
        std::os::unix::fs::symlink(target, &path)?;
        Self::qid_at(&path)
    }

    fn link(&self, target: &dyn ProtocolNode, name: &str) -> FsResult<()> {
        let target = self.peer(target)?;
        fs::hard_link(target.path(), self.child(name)?)?;
        Ok(())
    }

    fn mknod(&self, name: &str, mode: u32, major: u32, minor: u32, _gid: u32) -> FsResult<Qid> {
        let path = self.child(name)?;
        mknod(
            &path,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            makedev(major.into(), minor.into()),
        )?;
        Self::qid_at(&path)
    }

    fn rename(&self, new_dir: &dyn ProtocolNode, new_name: &str) -> FsResult<()> {
        let dir = self.peer(new_dir)?;
        check_name(new_name)?;
        fs::rename(self.path(), dir.path().join(new_name))?;
        Ok(())
    }

    fn rename_at(&self, old_name: &str, new_dir: &dyn ProtocolNode, new_name: &str) -> FsResult<()> {
        let dir = self.peer(new_dir)?;
        fs::rename(self.child(old_name)?, dir.child(new_name)?)?;
        Ok(())
    }

    fn unlink_at(&self, name: &str, flags: u32) -> FsResult<()> {
        let path = self.child(name)?;
        if flags & AT_REMOVEDIR != 0 {
            fs::remove_dir(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn readlink(&self) -> FsResult<String> {
        Ok(fs::read_link(self.path())?.to_string_lossy().into_owned())
    }

    fn statfs(&self) -> FsResult<FsStat> {
        let st = statvfs(&self.path())?;
        Ok(FsStat {
            ty: V9FS_MAGIC,
            bsize: st.block_size() as u32,
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            fsid: st.filesystem_id() as u64,
            namelen: st.name_max() as u32,
        })
    }

    fn fsync(&self) -> FsResult<()> {
        if let Some(open) = self.file.get() {
            open.file.sync_all()?;
        }
        Ok(())
    }

    fn renamed(&self, parent: &dyn ProtocolNode, new_name: &str) {
        if let Some(dir) = parent.as_any().downcast_ref::<LocalNode>() {
            let target = dir.path().join(new_name);
            *self.path.write().unwrap_or_else(PoisonError::into_inner) = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> (TempDir, Box<dyn ProtocolNode>) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), b"hello world").unwrap();
        fs::write(dir.path().join("top"), b"x").unwrap();
        let root = LocalFs::new(dir.path()).attach().unwrap();
        (dir, root)
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn walk_reports_one_qid_per_component() {
        let (_dir, root) = tree();
        let (qids, node) = root.walk(&names(&["sub", "file"])).unwrap();
        assert_eq!(qids.len(), 2);
        assert!(qids[0].is_dir());
        assert!(!qids[1].is_dir());
        let (self_qids, _) = node.walk(&[]).unwrap();
        assert_eq!(self_qids, vec![qids[1]]);
    }

    #[test]
    fn walk_miss_is_not_exist() {
        let (_dir, root) = tree();
        assert!(matches!(root.walk(&names(&["sub", "nope"])), Err(FsError::NotExist)));
        assert!(matches!(root.walk(&names(&["a/b"])), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn dotdot_stops_at_root() {
        let (_dir, root) = tree();
        let (root_qid, _) = root.walk(&[]).unwrap();
        let (qids, _) = root.walk(&names(&[".."])).unwrap();
        assert_eq!(qids, root_qid);
    }

    #[test]
    fn symlinks_are_not_followed() {
        let (dir, root) = tree();
        std::os::unix::fs::symlink("sub", dir.path().join("link")).unwrap();
        let (qids, node) = root.walk(&names(&["link"])).unwrap();
        assert!(qids[0].ty.is_symlink());
        assert_eq!(node.readlink().unwrap(), "sub");
    }

    #[test]
    fn write_then_read_round_trips_at_offset() {
        let (_dir, root) = tree();
        let (_, node) = root.walk(&names(&["sub", "file"])).unwrap();
        node.open(OpenFlags::READ_WRITE).unwrap();
        assert_eq!(node.write_at(b"RUST", 6).unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(node.read_at(&mut buf, 6).unwrap(), 4);
        assert_eq!(&buf, b"RUST");
    }

    #[test]
    fn append_handle_writes_at_end() {
        let (dir, root) = tree();
        let (_, node) = root.walk(&names(&["top"])).unwrap();
        node.open(OpenFlags::WRITE_ONLY.with(OpenFlags(libc::O_APPEND as u32))).unwrap();
        node.write_at(b"yz", 0).unwrap();
        assert_eq!(fs::read(dir.path().join("top")).unwrap(), b"xyz");
    }

    #[test]
    fn reads_require_open() {
        let (_dir, root) = tree();
        let (_, node) = root.walk(&names(&["top"])).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(node.read_at(&mut buf, 0), Err(FsError::BadHandle)));
    }

    #[test]
    fn getattr_is_never_cached() {
        let (dir, root) = tree();
        let (_, node) = root.walk(&names(&["top"])).unwrap();
        let (_, _, before) = node.get_attr(AttrMask::ALL).unwrap();
        fs::write(dir.path().join("top"), b"longer").unwrap();
        let (_, valid, after) = node.get_attr(AttrMask::ALL).unwrap();
        assert_eq!(before.size, 1);
        assert_eq!(after.size, 6);
        assert!(valid.contains(AttrMask::SIZE));
    }

    #[test]
    fn readdir_pages_with_offsets() {
        let (_dir, root) = tree();
        let all = root.readdir(0, 4096).unwrap();
        let listed: Vec<_> = all.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(listed, vec!["sub", "top"]);
        assert_eq!(all[0].kind, libc::DT_DIR);
        let rest = root.readdir(all[0].offset, 4096).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "top");
        // Budget smaller than one entry yields nothing.
        assert!(root.readdir(0, 10).unwrap().is_empty());
    }

    #[test]
    fn mutations_hit_the_disk() {
        let (dir, root) = tree();
        let qid = root.mkdir("made", 0o755, 0).unwrap();
        assert!(qid.is_dir());
        let (file, _, _) = root.create("new", OpenFlags::READ_WRITE, 0o644, 0).unwrap();
        file.write_at(b"data", 0).unwrap();
        assert_eq!(fs::read(dir.path().join("new")).unwrap(), b"data");

        root.symlink("new", "alias", 0).unwrap();
        assert_eq!(fs::read_link(dir.path().join("alias")).unwrap(), Path::new("new"));

        let (_, made) = root.walk(&names(&["made"])).unwrap();
        let (_, target) = root.walk(&names(&["new"])).unwrap();
        made.link(target.as_ref(), "hard").unwrap();
        assert_eq!(fs::read(dir.path().join("made/hard")).unwrap(), b"data");

        root.rename_at("top", made.as_ref(), "moved").unwrap();
        assert!(dir.path().join("made/moved").exists());

        root.unlink_at("alias", 0).unwrap();
        made.unlink_at("hard", 0).unwrap();
        made.unlink_at("moved", 0).unwrap();
        root.unlink_at("made", AT_REMOVEDIR).unwrap();
        assert!(!dir.path().join("made").exists());
    }

    #[test]
    fn mknod_creates_fifo() {
        let (dir, root) = tree();
        let qid = root.mknod("pipe", libc::S_IFIFO | 0o600, 0, 0, 0).unwrap();
        assert!(!qid.is_dir());
        let meta = fs::symlink_metadata(dir.path().join("pipe")).unwrap();
        assert_eq!(meta.mode() & libc::S_IFMT, libc::S_IFIFO);
    }

    #[test]
    fn rename_then_renamed_tracks_new_path() {
        let (dir, root) = tree();
        let (_, node) = root.walk(&names(&["top"])).unwrap();
        node.rename(root.as_ref(), "renamed").unwrap();
        node.renamed(root.as_ref(), "renamed");
        let (_, _, attr) = node.get_attr(AttrMask::BASIC).unwrap();
        assert_eq!(attr.size, 1);
        assert!(dir.path().join("renamed").exists());
    }

    #[test]
    fn setattr_truncates_and_chmods() {
        let (dir, root) = tree();
        let (_, node) = root.walk(&names(&["sub", "file"])).unwrap();
        let attr = SetAttr { mode: 0o600, size: 5, mtime_sec: 1_000_000, ..Default::default() };
        node.set_attr(
            SetAttrMask::MODE | SetAttrMask::SIZE | SetAttrMask::MTIME | SetAttrMask::MTIME_SET,
            attr,
        )
        .unwrap();
        let meta = fs::metadata(dir.path().join("sub/file")).unwrap();
        assert_eq!(meta.len(), 5);
        assert_eq!(meta.mode() & 0o7777, 0o600);
        assert_eq!(meta.mtime(), 1_000_000);
    }

    #[test]
    fn times_before_the_epoch_report_as_epoch() {
        let (dir, root) = tree();
        let old = TimeSpec::new(-1000, 0);
        utimensat(AT_FDCWD, &dir.path().join("top"), &old, &old, UtimensatFlags::NoFollowSymlink)
            .unwrap();
        let (_, node) = root.walk(&names(&["top"])).unwrap();
        let (_, _, attr) = node.get_attr(AttrMask::BASIC).unwrap();
        assert_eq!((attr.mtime_sec, attr.mtime_nsec), (0, 0));
        assert_eq!((attr.atime_sec, attr.atime_nsec), (0, 0));
    }

    #[test]
    fn setattr_rejects_unrepresentable_times() {
        let (_dir, root) = tree();
        let (_, node) = root.walk(&names(&["top"])).unwrap();
        let attr = SetAttr { mtime_sec: u64::MAX, ..Default::default() };
        assert!(matches!(
            node.set_attr(SetAttrMask::MTIME | SetAttrMask::MTIME_SET, attr),
            Err(FsError::InvalidArgument)
        ));
        let attr = SetAttr { size: u64::MAX, ..Default::default() };
        assert!(matches!(node.set_attr(SetAttrMask::SIZE, attr), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn setattr_times_on_fifo_do_not_block() {
        let (dir, root) = tree();
        root.mknod("pipe", libc::S_IFIFO | 0o600, 0, 0, 0).unwrap();
        let (_, node) = root.walk(&names(&["pipe"])).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let now = node.set_attr(SetAttrMask::ATIME | SetAttrMask::MTIME, SetAttr::default());
            let attr = SetAttr { mtime_sec: 4242, ..Default::default() };
            let explicit = node.set_attr(SetAttrMask::MTIME | SetAttrMask::MTIME_SET, attr);
            let _ = tx.send((now.is_ok(), explicit.is_ok()));
        });
        let done = rx.recv_timeout(std::time::Duration::from_secs(5)).expect("set_attr blocked");
        assert_eq!(done, (true, true));
        assert_eq!(fs::symlink_metadata(dir.path().join("pipe")).unwrap().mtime(), 4242);
    }

    #[test]
    fn setattr_on_symlink_leaves_target_alone() {
        let (dir, root) = tree();
        std::os::unix::fs::symlink("top", dir.path().join("link")).unwrap();
        let target_before = fs::metadata(dir.path().join("top")).unwrap();
        let (_, link) = root.walk(&names(&["link"])).unwrap();

        let attr = SetAttr { mtime_sec: 12_345, ..Default::default() };
        link.set_attr(SetAttrMask::MTIME | SetAttrMask::MTIME_SET, attr).unwrap();
        assert_eq!(fs::symlink_metadata(dir.path().join("link")).unwrap().mtime(), 12_345);

        let attr = SetAttr { mode: 0o600, ..Default::default() };
        assert!(matches!(link.set_attr(SetAttrMask::MODE, attr), Err(FsError::NotSupported)));

        let target_after = fs::metadata(dir.path().join("top")).unwrap();
        assert_eq!(target_after.mtime(), target_before.mtime());
        assert_eq!(target_after.mode(), target_before.mode());
    }

    #[test]
    fn statfs_reports_filesystem() {
        let (_dir, root) = tree();
        let st = root.statfs().unwrap();
        assert!(st.bsize > 0);
        assert!(st.namelen > 0);
    }
}
