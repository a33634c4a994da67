// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The capability set every served file node exposes

use std::any::Any;

use cpufs_proto::{Attr, AttrMask, Dirent, FsStat, OpenFlags, Qid, SetAttr, SetAttrMask};

use crate::error::{FsError, FsResult};

/// Result of a walk: one QID per resolved component and the node reached.
pub type Walked = (Vec<Qid>, Box<dyn ProtocolNode>);

/// Result of a combined walk and attribute fetch.
pub struct WalkAttr {
    pub qids: Vec<Qid>,
    pub node: Box<dyn ProtocolNode>,
    pub qid: Qid,
    pub valid: AttrMask,
    pub attr: Attr,
}

/// One resolved location in a served tree (a 9P fid).
///
/// Nodes are never shared between fids: every successful walk constructs a
/// fresh node. Anything a backend does not override answers
/// [`FsError::NotSupported`]; `flush`, `fsync` and `close` default to
/// success.
pub trait ProtocolNode: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Resolve `names` one component at a time.
    ///
    /// An empty list clones this node and reports its own, freshly queried,
    /// QID as the single element of the returned list.
    fn walk(&self, names: &[String]) -> FsResult<Walked>;

    fn walk_getattr(&self, names: &[String], mask: AttrMask) -> FsResult<WalkAttr> {
        let (qids, node) = self.walk(names)?;
        let (qid, valid, attr) = node.get_attr(mask)?;
        Ok(WalkAttr { qids, node, qid, valid, attr })
    }

    /// Returns the QID and the preferred I/O unit (0 for "use msize").
    fn open(&self, flags: OpenFlags) -> FsResult<(Qid, u32)>;

    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> FsResult<usize> {
        Err(FsError::NotSupported)
    }

    fn write_at(&self, _data: &[u8], _offset: u64) -> FsResult<usize> {
        Err(FsError::NotSupported)
    }

    /// Always a fresh query; implementations never answer from a cache.
    fn get_attr(&self, mask: AttrMask) -> FsResult<(Qid, AttrMask, Attr)>;

    fn set_attr(&self, _valid: SetAttrMask, _attr: SetAttr) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    /// Entries from position `offset` on, limited to `count` encoded bytes.
    fn readdir(&self, _offset: u64, _count: u32) -> FsResult<Vec<Dirent>> {
        Err(FsError::NotSupported)
    }

    /// Create and open `name` in this directory. Returns the new, opened
    /// node, its QID and I/O unit.
    fn create(
        &self,
        _name: &str,
        _flags: OpenFlags,
        _mode: u32,
        _gid: u32,
    ) -> FsResult<(Box<dyn ProtocolNode>, Qid, u32)> {
        Err(FsError::NotSupported)
    }

    fn mkdir(&self, _name: &str, _mode: u32, _gid: u32) -> FsResult<Qid> {
        Err(FsError::NotSupported)
    }

    fn symlink(&self, _target: &str, _name: &str, _gid: u32) -> FsResult<Qid> {
        Err(FsError::NotSupported)
    }

    /// Hard-link `target` into this directory as `name`.
    fn link(&self, _target: &dyn ProtocolNode, _name: &str) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn mknod(&self, _name: &str, _mode: u32, _major: u32, _minor: u32, _gid: u32) -> FsResult<Qid> {
        Err(FsError::NotSupported)
    }

    /// Move this node to `new_dir/new_name`.
    fn rename(&self, _new_dir: &dyn ProtocolNode, _new_name: &str) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn rename_at(&self, _old_name: &str, _new_dir: &dyn ProtocolNode, _new_name: &str) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn unlink_at(&self, _name: &str, _flags: u32) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn readlink(&self) -> FsResult<String> {
        Err(FsError::NotSupported)
    }

    fn statfs(&self) -> FsResult<FsStat> {
        Err(FsError::NotSupported)
    }

    fn fsync(&self) -> FsResult<()> {
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn close(&self) -> FsResult<()> {
        Ok(())
    }

    /// Bookkeeping after this node was moved to `parent/new_name`. No I/O.
    fn renamed(&self, _parent: &dyn ProtocolNode, _new_name: &str) {}
}

/// Produces the root node for a freshly attached session.
pub trait Attacher: Send + Sync {
    fn attach(&self) -> FsResult<Box<dyn ProtocolNode>>;
}

/// Reject names that could escape the directory they are resolved in.
pub(crate) fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}
