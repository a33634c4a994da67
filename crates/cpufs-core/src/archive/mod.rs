// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only backend serving a cpio archive
//!
//! The archive is read into memory and indexed once: an ordered record list,
//! a map from normalized path to record position and the direct children of
//! every record. Nothing is mutated after [`ArchiveIndex::parse`] returns.

pub mod newc;

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use cpufs_proto::{Attr, AttrMask, Dirent, OpenFlags, Qid, QidType, SetAttr, SetAttrMask};
use thiserror::Error;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::node::{check_name, Attacher, ProtocolNode, Walked};

const BLOCK_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("bad cpio magic at offset {offset}")]
    BadMagic { offset: usize },
    #[error("archive truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("malformed header field at offset {offset}")]
    BadField { offset: usize },
    #[error("record name at offset {offset} is not UTF-8")]
    BadName { offset: usize },
    #[error("archive has no records")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Record metadata carried by the archive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub nlink: u64,
    pub dev: u64,
    pub rdev: u64,
}

#[derive(Clone, Debug)]
pub struct ArchiveRecord {
    /// Normalized full path; the root is the empty string.
    pub name: String,
    pub info: RecordInfo,
    data_offset: usize,
}

impl ArchiveRecord {
    pub fn base_name(&self) -> &str {
        self.name.rsplit_once('/').map_or(self.name.as_str(), |(_, base)| base)
    }

    pub fn parent_name(&self) -> &str {
        self.name.rsplit_once('/').map_or("", |(parent, _)| parent)
    }

    fn is(&self, kind: u32) -> bool {
        self.info.mode & libc::S_IFMT == kind
    }
}

/// Strip `./`, leading and trailing slashes so that `./b/c/`, `/b/c` and
/// `b/c` all index as `b/c`.
fn normalize(name: &str) -> String {
    let mut s = name;
    loop {
        if let Some(rest) = s.strip_prefix("./") {
            s = rest;
        } else if let Some(rest) = s.strip_prefix('/') {
            s = rest;
        } else {
            break;
        }
    }
    let s = s.trim_end_matches('/');
    if s == "." {
        String::new()
    } else {
        s.to_string()
    }
}

pub struct ArchiveIndex {
    data: Vec<u8>,
    records: Vec<ArchiveRecord>,
    by_name: HashMap<String, usize>,
    children: Vec<Vec<usize>>,
    root: usize,
}

impl ArchiveIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        Self::parse(std::fs::read(path)?)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self, ArchiveError> {
        let decoded = newc::parse(&data)?;
        if decoded.is_empty() {
            return Err(ArchiveError::Empty);
        }
        let mut records: Vec<ArchiveRecord> = decoded
            .into_iter()
            .map(|r| ArchiveRecord {
                name: normalize(&r.name),
                info: RecordInfo {
                    mode: r.mode,
                    uid: r.uid,
                    gid: r.gid,
                    size: r.size,
                    mtime: r.mtime,
                    nlink: r.nlink,
                    dev: r.dev,
                    rdev: r.rdev,
                },
                data_offset: r.data_offset,
            })
            .collect();

        // Archives built without a "." entry still need a root to attach to.
        if !records.iter().any(|r| r.name.is_empty()) {
            records.insert(
                0,
                ArchiveRecord {
                    name: String::new(),
                    info: RecordInfo { mode: libc::S_IFDIR | 0o555, nlink: 2, ..Default::default() },
                    data_offset: 0,
                },
            );
        }

        let mut by_name = HashMap::with_capacity(records.len());
        for (idx, rec) in records.iter().enumerate() {
            by_name.insert(rec.name.clone(), idx);
        }
        let mut children = vec![Vec::new(); records.len()];
        for (idx, rec) in records.iter().enumerate() {
            if rec.name.is_empty() || by_name.get(&rec.name) != Some(&idx) {
                continue;
            }
            if let Some(&parent) = by_name.get(rec.parent_name()) {
                children[parent].push(idx);
            }
        }
        let root = by_name.get("").copied().unwrap_or(0);
        debug!(records = records.len(), "indexed archive");
        Ok(Self { data, records, by_name, children, root })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn record(&self, idx: usize) -> Option<&ArchiveRecord> {
        self.records.get(idx)
    }

    /// Direct children of `idx`, in archive order.
    pub fn children(&self, idx: usize) -> &[usize] {
        self.children.get(idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn content(&self, idx: usize) -> &[u8] {
        match self.records.get(idx) {
            Some(rec) if rec.is(libc::S_IFREG) || rec.is(libc::S_IFLNK) => {
                let end = rec.data_offset + rec.info.size as usize;
                self.data.get(rec.data_offset..end).unwrap_or(&[])
            }
            _ => &[],
        }
    }

    /// QID paths are record positions shifted by one so that none is zero.
    fn qid(&self, idx: usize) -> FsResult<Qid> {
        let rec = self.records.get(idx).ok_or(FsError::NotExist)?;
        Ok(Qid::new(QidType::from_mode(rec.info.mode), 0, idx as u64 + 1))
    }
}

/// Attaches sessions to the root of one indexed archive.
#[derive(Clone)]
pub struct ArchiveFs {
    index: Arc<ArchiveIndex>,
}

impl ArchiveFs {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        Ok(Self::new(ArchiveIndex::open(path)?))
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ArchiveError> {
        Ok(Self::new(ArchiveIndex::parse(data)?))
    }

    pub fn new(index: ArchiveIndex) -> Self {
        Self { index: Arc::new(index) }
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn root_node(&self) -> ArchiveNode {
        ArchiveNode { index: self.index.clone(), idx: self.index.root() }
    }
}

impl Attacher for ArchiveFs {
    fn attach(&self) -> FsResult<Box<dyn ProtocolNode>> {
        Ok(Box::new(self.root_node()))
    }
}

/// One record of an [`ArchiveFs`].
pub struct ArchiveNode {
    index: Arc<ArchiveIndex>,
    idx: usize,
}

impl ArchiveNode {
    fn record(&self) -> FsResult<&ArchiveRecord> {
        self.index.record(self.idx).ok_or(FsError::NotExist)
    }

    fn dirent(&self, idx: usize, name: &str, pos: usize) -> FsResult<Dirent> {
        let rec = self.index.record(idx).ok_or(FsError::NotExist)?;
        Ok(Dirent {
            qid: self.index.qid(idx)?,
            offset: pos as u64 + 1,
            kind: Dirent::kind_from_mode(rec.info.mode),
            name: name.to_string(),
        })
    }
}

impl ProtocolNode for ArchiveNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn walk(&self, names: &[String]) -> FsResult<Walked> {
        let mut idx = self.idx;
        let mut qids = Vec::with_capacity(names.len().max(1));
        if names.is_empty() {
            qids.push(self.index.qid(idx)?);
        }
        for name in names {
            check_name(name)?;
            let current = self.index.record(idx).ok_or(FsError::NotExist)?;
            idx = match name.as_str() {
                "." => idx,
                ".." => self.index.lookup(current.parent_name()).unwrap_or(self.index.root()),
                _ if current.name.is_empty() => {
                    self.index.lookup(name).ok_or(FsError::NotExist)?
                }
                _ => {
                    let full = format!("{}/{}", current.name, name);
                    self.index.lookup(&full).ok_or(FsError::NotExist)?
                }
            };
            qids.push(self.index.qid(idx)?);
        }
        let node: Box<dyn ProtocolNode> = Box::new(ArchiveNode { index: self.index.clone(), idx });
        Ok((qids, node))
    }

    fn open(&self, flags: OpenFlags) -> FsResult<(Qid, u32)> {
        if !flags.is_read_only() {
            return Err(FsError::PermissionDenied);
        }
        Ok((self.index.qid(self.idx)?, 0))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let content = self.index.content(self.idx);
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, _data: &[u8], _offset: u64) -> FsResult<usize> {
        Err(FsError::PermissionDenied)
    }

    /// atime and ctime are not carried by the archive: they are reported as
    /// zero yet still flagged valid.
    fn get_attr(&self, _mask: AttrMask) -> FsResult<(Qid, AttrMask, Attr)> {
        let rec = self.record()?;
        let info = rec.info;
        let attr = Attr {
            mode: info.mode,
            uid: info.uid,
            gid: info.gid,
            nlink: info.nlink,
            rdev: info.rdev,
            size: info.size,
            blksize: BLOCK_SIZE,
            blocks: info.size / BLOCK_SIZE,
            mtime_sec: info.mtime,
            ..Default::default()
        };
        Ok((self.index.qid(self.idx)?, AttrMask::BASIC, attr))
    }

    fn set_attr(&self, _valid: SetAttrMask, _attr: SetAttr) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn readdir(&self, offset: u64, count: u32) -> FsResult<Vec<Dirent>> {
        let mut listing = Vec::with_capacity(self.index.children(self.idx).len() + 1);
        listing.push(self.dirent(self.idx, ".", 0)?);
        for (i, &child) in self.index.children(self.idx).iter().enumerate() {
            let rec = self.index.record(child).ok_or(FsError::NotExist)?;
            listing.push(self.dirent(child, rec.base_name(), i + 1)?);
        }

        let mut used = 0usize;
        let mut out = Vec::new();
        for ent in listing.into_iter().skip(offset as usize) {
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
        _name: &str,
        _flags: OpenFlags,
        _mode: u32,
        _gid: u32,
    ) -> FsResult<(Box<dyn ProtocolNode>, Qid, u32)> {
        Err(FsError::PermissionDenied)
    }

    fn mkdir(&self, _name: &str, _mode: u32, _gid: u32) -> FsResult<Qid> {
        Err(FsError::PermissionDenied)
    }

    fn symlink(&self, _target: &str, _name: &str, _gid: u32) -> FsResult<Qid> {
        Err(FsError::PermissionDenied)
    }

    fn link(&self, _target: &dyn ProtocolNode, _name: &str) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn unlink_at(&self, _name: &str, _flags: u32) -> FsResult<()> {
        Err(FsError::PermissionDenied)
    }

    fn readlink(&self) -> FsResult<String> {
        let rec = self.record()?;
        if !rec.is(libc::S_IFLNK) {
            return Err(FsError::InvalidArgument);
        }
        String::from_utf8(self.index.content(self.idx).to_vec()).map_err(|_| FsError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_archive, NewcBuilder};

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn root() -> Box<dyn ProtocolNode> {
        ArchiveFs::from_bytes(sample_archive()).unwrap().attach().unwrap()
    }

    #[test]
    fn walk_resolves_nested_directories() {
        let (qids, node) = root().walk(&names(&["b", "c"])).unwrap();
        assert_eq!(qids.len(), 2);
        assert!(qids.iter().all(Qid::is_dir));
        let (again, _) = node.walk(&[]).unwrap();
        assert_eq!(again, vec![qids[1]]);
    }

    #[test]
    fn walk_miss_is_not_exist() {
        assert!(matches!(root().walk(&names(&["barf"])), Err(FsError::NotExist)));
        assert!(matches!(root().walk(&names(&["b", "barf", "c"])), Err(FsError::NotExist)));
    }

    #[test]
    fn empty_walk_matches_parent_resolution() {
        let root = root();
        let (via_parent, node) = root.walk(&names(&["b", "c", "hi"])).unwrap();
        let (own, _) = node.walk(&[]).unwrap();
        assert_eq!(own[0].path, via_parent[2].path);
    }

    #[test]
    fn reads_serve_record_content() {
        let (_, hi) = root().walk(&names(&["b", "c", "hi"])).unwrap();
        hi.open(OpenFlags::READ_ONLY).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(hi.read_at(&mut buf, 1).unwrap(), 2);
        assert_eq!(&buf, b"i\n");
        assert_eq!(hi.read_at(&mut buf, 3).unwrap(), 0);
        assert_eq!(hi.read_at(&mut buf, u64::MAX).unwrap(), 0);
    }

    #[test]
    fn readdir_synthesizes_dot_and_lists_children() {
        let root = root();
        let (_, c) = root.walk(&names(&["b", "c"])).unwrap();
        let listed = c.readdir(0, 64 * 1024).unwrap();
        let got: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(got, vec![".", "d", "hi", "hello"]);
        assert_eq!(listed[1].kind, libc::DT_DIR);
        assert_eq!(listed[2].kind, libc::DT_REG);

        let top = root.readdir(0, 64 * 1024).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[1].name, "b");
    }

    #[test]
    fn readdir_resumes_from_offset_and_respects_budget() {
        let (_, c) = root().walk(&names(&["b", "c"])).unwrap();
        let first = c.readdir(0, 60).unwrap();
        assert_eq!(first.len(), 2);
        let rest = c.readdir(first[1].offset, 64 * 1024).unwrap();
        let got: Vec<_> = rest.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(got, vec!["hi", "hello"]);
        assert!(c.readdir(4, 1024).unwrap().is_empty());
    }

    #[test]
    fn getattr_reports_zero_but_valid_times() {
        let (_, hi) = root().walk(&names(&["b", "c", "hi"])).unwrap();
        let (qid, valid, attr) = hi.get_attr(AttrMask::ALL).unwrap();
        assert!(!qid.is_dir());
        assert_eq!(attr.size, 3);
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.blocks, 0);
        assert_eq!(attr.mtime_sec, crate::testing::SAMPLE_MTIME);
        assert!(valid.contains(AttrMask::ATIME | AttrMask::CTIME));
        assert_eq!((attr.atime_sec, attr.ctime_sec), (0, 0));
    }

    #[test]
    fn archive_is_immutable() {
        let root = root();
        let (_, hi) = root.walk(&names(&["b", "c", "hi"])).unwrap();
        assert!(matches!(hi.open(OpenFlags::READ_WRITE), Err(FsError::PermissionDenied)));
        assert!(matches!(hi.write_at(b"x", 0), Err(FsError::PermissionDenied)));
        assert!(matches!(
            root.create("f", OpenFlags::READ_WRITE, 0o644, 0),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(root.mkdir("d", 0o755, 0), Err(FsError::PermissionDenied)));
        assert!(matches!(root.symlink("x", "y", 0), Err(FsError::PermissionDenied)));
        assert!(matches!(
            root.mknod("n", libc::S_IFIFO | 0o600, 0, 0, 0),
            Err(FsError::NotSupported)
        ));
        assert!(matches!(root.link(hi.as_ref(), "l"), Err(FsError::PermissionDenied)));
        assert!(matches!(hi.rename(root.as_ref(), "z"), Err(FsError::NotSupported)));
        assert!(matches!(
            root.rename_at("b", root.as_ref(), "z"),
            Err(FsError::NotSupported)
        ));
        assert!(matches!(root.unlink_at("b", 0), Err(FsError::PermissionDenied)));
        assert!(matches!(
            hi.set_attr(SetAttrMask::SIZE, SetAttr::default()),
            Err(FsError::PermissionDenied)
        ));
        assert!(matches!(root.statfs(), Err(FsError::NotSupported)));
        assert!(matches!(hi.readlink(), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn symlink_records_are_readable_links() {
        let data = NewcBuilder::new().file("target", b"t").symlink("alias", "target").finish();
        let root = ArchiveFs::from_bytes(data).unwrap().attach().unwrap();
        let (qids, alias) = root.walk(&names(&["alias"])).unwrap();
        assert!(qids[0].ty.is_symlink());
        assert_eq!(alias.readlink().unwrap(), "target");
    }

    #[test]
    fn root_is_synthesized_when_absent() {
        let data = NewcBuilder::new().file("./only", b"1").finish();
        let fs = ArchiveFs::from_bytes(data).unwrap();
        assert_eq!(fs.index().len(), 2);
        let root = fs.attach().unwrap();
        let (qids, _) = root.walk(&names(&["only"])).unwrap();
        assert_eq!(qids.len(), 1);
    }

    #[test]
    fn bogus_archives_fail_to_open() {
        assert!(ArchiveFs::from_bytes(b"bogus".to_vec()).is_err());
        assert!(matches!(
            ArchiveFs::from_bytes(NewcBuilder::new().finish()),
            Err(ArchiveError::Empty)
        ));
        assert!(matches!(
            ArchiveFs::open("/nonexistent/archive.cpio"),
            Err(ArchiveError::Io(_))
        ));
    }
}
