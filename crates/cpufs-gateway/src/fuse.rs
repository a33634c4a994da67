// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `fuser` adapter for [`Gateway`]
//!
//! Only lookup, getattr, directory listing, read-only file access and
//! statfs are implemented. Every other request falls through to fuser's
//! default handlers, which reply `ENOSYS`.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpufs_core::FsError;
use cpufs_proto::{Attr, OpenFlags};
use fuser::{
    BackgroundSession, FileAttr, FileType, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use libc::c_int;
use tracing::{debug, info};

use crate::gateway::Gateway;
use crate::mount::{GatewayMounter, MountedGateway, FS_NAME};

/// Bytes requested from the backend per readdir call.
const READDIR_CHUNK: u32 = 64 * 1024;

pub struct GatewayFs {
    gateway: Arc<Gateway>,
}

impl GatewayFs {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

fn ttl(expiry: Instant) -> Duration {
    expiry.saturating_duration_since(Instant::now())
}

fn errno(e: FsError) -> c_int {
    debug!(error = %e, "replying with error");
    e.errno()
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn dirent_type(kind: u8) -> FileType {
    match kind {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn to_fuse(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime(),
        mtime: attr.mtime(),
        ctime: attr.ctime(),
        crtime: attr.btime(),
        kind: file_type(attr.mode),
        perm: attr.permissions(),
        nlink: attr.nlink.max(1) as u32,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev as u32,
        blksize: attr.blksize as u32,
        flags: 0,
    }
}

impl fuser::Filesystem for GatewayFs {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        info!("cpud gateway mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("cpud gateway unmounted");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.gateway.look_up_inode(parent, name) {
            Ok(entry) => reply.entry(&ttl(entry.expiry), &to_fuse(entry.inode, &entry.attr), 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.gateway.get_inode_attributes(ino) {
            Ok(cached) => reply.attr(&ttl(cached.expiry), &to_fuse(ino, &cached.attr)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.gateway.open_dir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readdir(&mut self, _req: &Request, _ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        match self.gateway.read_dir_entries(fh, offset.max(0) as u64, READDIR_CHUNK) {
            Ok(entries) => {
                for entry in entries {
                    let ino = Gateway::inode_for(&entry.qid);
                    if reply.add(ino, entry.offset as i64, dirent_type(entry.kind), &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.gateway.release_handle(fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.gateway.open_file(ino, OpenFlags(flags as u32)) {
            Ok(opened) => {
                let open_flags =
                    if opened.keep_page_cache { fuser::consts::FOPEN_KEEP_CACHE } else { 0 };
                reply.opened(opened.handle, open_flags);
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.gateway.read_file(fh, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.gateway.release_handle(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.gateway.stat_fs() {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                st.ffree,
                st.bsize,
                st.namelen,
                st.bsize,
            ),
            Err(e) => reply.error(errno(e)),
        }
    }
}

impl MountedGateway for BackgroundSession {
    fn join(self: Box<Self>) {
        BackgroundSession::join(*self)
    }
}

/// Mounts through `fuser`, serving from a background thread.
pub struct FuserMounter;

impl GatewayMounter for FuserMounter {
    fn mount(&self, gateway: Arc<Gateway>, target: &Path) -> io::Result<Box<dyn MountedGateway>> {
        let options = [
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::Subtype(FS_NAME.to_string()),
            MountOption::RO,
            MountOption::NoDev,
            MountOption::NoSuid,
        ];
        let session = fuser::spawn_mount2(GatewayFs::new(gateway), target, &options)?;
        info!(target = %target.display(), "gateway mount started");
        Ok(Box::new(session))
    }
}
