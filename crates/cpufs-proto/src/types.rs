// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity and attribute value types shared by backends and the gateway

use std::fmt;
use std::ops::BitOr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `unlinkat` flag requesting directory removal (Linux `AT_REMOVEDIR`).
pub const AT_REMOVEDIR: u32 = libc::AT_REMOVEDIR as u32;

/// File-kind bits carried in a QID.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct QidType(pub u8);

impl QidType {
    pub const DIR: QidType = QidType(0x80);
    pub const APPEND: QidType = QidType(0x40);
    pub const EXCL: QidType = QidType(0x20);
    pub const MOUNT: QidType = QidType(0x10);
    pub const AUTH: QidType = QidType(0x08);
    pub const TMP: QidType = QidType(0x04);
    pub const SYMLINK: QidType = QidType(0x02);
    pub const FILE: QidType = QidType(0x00);

    /// Derive the QID kind from a `st_mode` value.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => Self::DIR,
            libc::S_IFLNK => Self::SYMLINK,
            _ => Self::FILE,
        }
    }

    pub fn is_dir(self) -> bool {
        self.0 & Self::DIR.0 != 0
    }

    pub fn is_symlink(self) -> bool {
        self.0 & Self::SYMLINK.0 != 0
    }
}

/// Server-side identity of one file.
///
/// `path` is stable for the lifetime of the serving process: resolving the
/// same object twice yields the same value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Qid {
    pub ty: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn new(ty: QidType, version: u32, path: u64) -> Self {
        Self { ty, version, path }
    }

    pub fn is_dir(&self) -> bool {
        self.ty.is_dir()
    }
}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#x} {} {:#04x})", self.path, self.version, self.ty.0)
    }
}

/// `Tgetattr` request/validity mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttrMask(pub u64);

impl AttrMask {
    pub const MODE: AttrMask = AttrMask(0x0000_0001);
    pub const NLINK: AttrMask = AttrMask(0x0000_0002);
    pub const UID: AttrMask = AttrMask(0x0000_0004);
    pub const GID: AttrMask = AttrMask(0x0000_0008);
    pub const RDEV: AttrMask = AttrMask(0x0000_0010);
    pub const ATIME: AttrMask = AttrMask(0x0000_0020);
    pub const MTIME: AttrMask = AttrMask(0x0000_0040);
    pub const CTIME: AttrMask = AttrMask(0x0000_0080);
    pub const INO: AttrMask = AttrMask(0x0000_0100);
    pub const SIZE: AttrMask = AttrMask(0x0000_0200);
    pub const BLOCKS: AttrMask = AttrMask(0x0000_0400);
    pub const BTIME: AttrMask = AttrMask(0x0000_0800);
    pub const GEN: AttrMask = AttrMask(0x0000_1000);
    pub const DATA_VERSION: AttrMask = AttrMask(0x0000_2000);
    /// Everything a `stat(2)` caller expects.
    pub const BASIC: AttrMask = AttrMask(0x0000_07ff);
    pub const ALL: AttrMask = AttrMask(0x0000_3fff);

    pub fn contains(self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AttrMask {
    type Output = AttrMask;

    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}

/// Attribute record returned by `Rgetattr`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
    pub btime_sec: u64,
    pub btime_nsec: u64,
    pub gen: u64,
    pub data_version: u64,
}

impl Attr {
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn permissions(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    pub fn atime(&self) -> SystemTime {
        system_time(self.atime_sec, self.atime_nsec)
    }

    pub fn mtime(&self) -> SystemTime {
        system_time(self.mtime_sec, self.mtime_nsec)
    }

    pub fn ctime(&self) -> SystemTime {
        system_time(self.ctime_sec, self.ctime_nsec)
    }

    pub fn btime(&self) -> SystemTime {
        system_time(self.btime_sec, self.btime_nsec)
    }
}

/// Times a peer sends may be arbitrary; anything `SystemTime` cannot hold
/// becomes the epoch.
fn system_time(sec: u64, nsec: u64) -> SystemTime {
    UNIX_EPOCH
        .checked_add(Duration::new(sec, nsec.min(999_999_999) as u32))
        .unwrap_or(UNIX_EPOCH)
}

/// `Tsetattr` validity mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SetAttrMask(pub u32);

impl SetAttrMask {
    pub const MODE: SetAttrMask = SetAttrMask(0x0001);
    pub const UID: SetAttrMask = SetAttrMask(0x0002);
    pub const GID: SetAttrMask = SetAttrMask(0x0004);
    pub const SIZE: SetAttrMask = SetAttrMask(0x0008);
    pub const ATIME: SetAttrMask = SetAttrMask(0x0010);
    pub const MTIME: SetAttrMask = SetAttrMask(0x0020);
    pub const CTIME: SetAttrMask = SetAttrMask(0x0040);
    /// Use the supplied atime rather than "now".
    pub const ATIME_SET: SetAttrMask = SetAttrMask(0x0080);
    /// Use the supplied mtime rather than "now".
    pub const MTIME_SET: SetAttrMask = SetAttrMask(0x0100);

    pub fn contains(self, other: SetAttrMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SetAttrMask {
    type Output = SetAttrMask;

    fn bitor(self, rhs: SetAttrMask) -> SetAttrMask {
        SetAttrMask(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

/// `Rstatfs` payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsStat {
    pub ty: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// One `Rreaddir` entry.
///
/// `offset` is the opaque cookie a reader passes back to continue after this
/// entry; `kind` is a `DT_*` value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub qid: Qid,
    pub offset: u64,
    pub kind: u8,
    pub name: String,
}

impl Dirent {
    /// Encoded size inside an `Rreaddir` payload.
    pub fn wire_size(&self) -> usize {
        13 + 8 + 1 + 2 + self.name.len()
    }

    /// `DT_*` value for a `st_mode`.
    pub fn kind_from_mode(mode: u32) -> u8 {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => libc::DT_DIR,
            libc::S_IFREG => libc::DT_REG,
            libc::S_IFLNK => libc::DT_LNK,
            libc::S_IFCHR => libc::DT_CHR,
            libc::S_IFBLK => libc::DT_BLK,
            libc::S_IFIFO => libc::DT_FIFO,
            libc::S_IFSOCK => libc::DT_SOCK,
            _ => libc::DT_UNKNOWN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Linux open flags as carried by `Tlopen` and `Tlcreate`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(libc::O_RDONLY as u32);
    pub const WRITE_ONLY: OpenFlags = OpenFlags(libc::O_WRONLY as u32);
    pub const READ_WRITE: OpenFlags = OpenFlags(libc::O_RDWR as u32);

    pub fn access_mode(self) -> AccessMode {
        match self.0 & libc::O_ACCMODE as u32 {
            m if m == libc::O_WRONLY as u32 => AccessMode::WriteOnly,
            m if m == libc::O_RDWR as u32 => AccessMode::ReadWrite,
            _ => AccessMode::ReadOnly,
        }
    }

    pub fn is_read_only(self) -> bool {
        self.access_mode() == AccessMode::ReadOnly && !self.truncate()
    }

    pub fn append(self) -> bool {
        self.0 & libc::O_APPEND as u32 != 0
    }

    pub fn truncate(self) -> bool {
        self.0 & libc::O_TRUNC as u32 != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 & libc::O_EXCL as u32 != 0
    }

    pub fn with(self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | other.0)
    }
}

impl From<u32> for OpenFlags {
    fn from(raw: u32) -> Self {
        OpenFlags(raw)
    }
}
