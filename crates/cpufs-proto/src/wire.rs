// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L frame codec
//!
//! Every frame is `size[4] type[1] tag[2] body`, little-endian, where `size`
//! counts the whole frame including itself. Strings are `len[2]` followed by
//! UTF-8 bytes and QIDs are `type[1] version[4] path[8]`.

use std::io::{self, Read, Write};

use crate::error::{ProtoError, ProtoResult};
use crate::types::{Attr, AttrMask, Dirent, FsStat, OpenFlags, Qid, QidType, SetAttr, SetAttrMask};

pub const VERSION_9P2000L: &str = "9P2000.L";
pub const NOTAG: u16 = 0xffff;
pub const NOFID: u32 = 0xffff_ffff;
/// Room reserved for the header of a `Tread`/`Twrite` style message.
pub const IOHDRSZ: u32 = 24;
const HEADER_SIZE: usize = 7;

mod ty {
    pub const RLERROR: u8 = 7;
    pub const TSTATFS: u8 = 8;
    pub const RSTATFS: u8 = 9;
    pub const TLOPEN: u8 = 12;
    pub const RLOPEN: u8 = 13;
    pub const TLCREATE: u8 = 14;
    pub const RLCREATE: u8 = 15;
    pub const TSYMLINK: u8 = 16;
    pub const RSYMLINK: u8 = 17;
    pub const TMKNOD: u8 = 18;
    pub const RMKNOD: u8 = 19;
    pub const TRENAME: u8 = 20;
    pub const RRENAME: u8 = 21;
    pub const TREADLINK: u8 = 22;
    pub const RREADLINK: u8 = 23;
    pub const TGETATTR: u8 = 24;
    pub const RGETATTR: u8 = 25;
    pub const TSETATTR: u8 = 26;
    pub const RSETATTR: u8 = 27;
    pub const TREADDIR: u8 = 40;
    pub const RREADDIR: u8 = 41;
    pub const TFSYNC: u8 = 50;
    pub const RFSYNC: u8 = 51;
    pub const TLINK: u8 = 70;
    pub const RLINK: u8 = 71;
    pub const TMKDIR: u8 = 72;
    pub const RMKDIR: u8 = 73;
    pub const TRENAMEAT: u8 = 74;
    pub const RRENAMEAT: u8 = 75;
    pub const TUNLINKAT: u8 = 76;
    pub const RUNLINKAT: u8 = 77;
    pub const TVERSION: u8 = 100;
    pub const RVERSION: u8 = 101;
    pub const TAUTH: u8 = 102;
    pub const TATTACH: u8 = 104;
    pub const RATTACH: u8 = 105;
    pub const TFLUSH: u8 = 108;
    pub const RFLUSH: u8 = 109;
    pub const TWALK: u8 = 110;
    pub const RWALK: u8 = 111;
    pub const TREAD: u8 = 116;
    pub const RREAD: u8 = 117;
    pub const TWRITE: u8 = 118;
    pub const RWRITE: u8 = 119;
    pub const TCLUNK: u8 = 120;
    pub const RCLUNK: u8 = 121;
    pub const TREMOVE: u8 = 122;
    pub const RREMOVE: u8 = 123;
}

/// A decoded message together with its tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fcall<M> {
    pub tag: u16,
    pub msg: M,
}

/// Requests, as sent by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tmessage {
    Version { msize: u32, version: String },
    Auth { afid: u32, uname: String, aname: String, n_uname: u32 },
    Attach { fid: u32, afid: u32, uname: String, aname: String, n_uname: u32 },
    Flush { oldtag: u16 },
    Walk { fid: u32, newfid: u32, names: Vec<String> },
    Read { fid: u32, offset: u64, count: u32 },
    Write { fid: u32, offset: u64, data: Vec<u8> },
    Clunk { fid: u32 },
    Remove { fid: u32 },
    Statfs { fid: u32 },
    Lopen { fid: u32, flags: OpenFlags },
    Lcreate { fid: u32, name: String, flags: OpenFlags, mode: u32, gid: u32 },
    Symlink { fid: u32, name: String, target: String, gid: u32 },
    Mknod { dfid: u32, name: String, mode: u32, major: u32, minor: u32, gid: u32 },
    Rename { fid: u32, dfid: u32, name: String },
    Readlink { fid: u32 },
    Getattr { fid: u32, mask: AttrMask },
    Setattr { fid: u32, valid: SetAttrMask, attr: SetAttr },
    Readdir { fid: u32, offset: u64, count: u32 },
    Fsync { fid: u32, datasync: u32 },
    Link { dfid: u32, fid: u32, name: String },
    Mkdir { dfid: u32, name: String, mode: u32, gid: u32 },
    Renameat { olddirfid: u32, oldname: String, newdirfid: u32, newname: String },
    Unlinkat { dirfid: u32, name: String, flags: u32 },
}

/// Replies, as sent by a server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rmessage {
    Version { msize: u32, version: String },
    Attach { qid: Qid },
    Flush,
    Walk { qids: Vec<Qid> },
    Read { data: Vec<u8> },
    Write { count: u32 },
    Clunk,
    Remove,
    Statfs(FsStat),
    Lopen { qid: Qid, iounit: u32 },
    Lcreate { qid: Qid, iounit: u32 },
    Symlink { qid: Qid },
    Mknod { qid: Qid },
    Rename,
    Readlink { target: String },
    Getattr { valid: AttrMask, qid: Qid, attr: Attr },
    Setattr,
    Readdir { entries: Vec<Dirent> },
    Fsync,
    Link,
    Mkdir { qid: Qid },
    Renameat,
    Unlinkat,
    Lerror { ecode: u32 },
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new(ty: u8, tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0; 4]);
        buf.push(ty);
        buf.extend_from_slice(&tag.to_le_bytes());
        Self { buf }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn str(&mut self, s: &str) -> &mut Self {
        // Names longer than u16::MAX cannot be represented; clamp rather than wrap.
        let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
        self.u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
        self
    }

    fn qid(&mut self, qid: &Qid) -> &mut Self {
        self.u8(qid.ty.0).u32(qid.version).u64(qid.path)
    }

    fn data(&mut self, data: &[u8]) -> &mut Self {
        self.u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&size.to_le_bytes());
        self.buf
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> ProtoResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ProtoError::Truncated { offset: self.pos, needed: n });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> ProtoResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ProtoResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> ProtoResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> ProtoResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn str(&mut self) -> ProtoResult<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::BadString)
    }

    fn qid(&mut self) -> ProtoResult<Qid> {
        let ty = QidType(self.u8()?);
        let version = self.u32()?;
        let path = self.u64()?;
        Ok(Qid { ty, version, path })
    }

    fn data(&mut self) -> ProtoResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Split a frame into `(type, tag)` without decoding the body.
pub fn frame_header(frame: &[u8]) -> ProtoResult<(u8, u16)> {
    let mut d = Decoder::new(frame);
    let size = d.u32()?;
    if (size as usize) < HEADER_SIZE {
        return Err(ProtoError::Undersized(size));
    }
    Ok((d.u8()?, d.u16()?))
}

fn body(frame: &[u8]) -> ProtoResult<(u8, u16, Decoder<'_>)> {
    let (ty, tag) = frame_header(frame)?;
    let mut d = Decoder::new(frame);
    d.take(HEADER_SIZE)?;
    Ok((ty, tag, d))
}

impl Tmessage {
    pub fn name(&self) -> &'static str {
        match self {
            Tmessage::Version { .. } => "Tversion",
            Tmessage::Auth { .. } => "Tauth",
            Tmessage::Attach { .. } => "Tattach",
            Tmessage::Flush { .. } => "Tflush",
            Tmessage::Walk { .. } => "Twalk",
            Tmessage::Read { .. } => "Tread",
            Tmessage::Write { .. } => "Twrite",
            Tmessage::Clunk { .. } => "Tclunk",
            Tmessage::Remove { .. } => "Tremove",
            Tmessage::Statfs { .. } => "Tstatfs",
            Tmessage::Lopen { .. } => "Tlopen",
            Tmessage::Lcreate { .. } => "Tlcreate",
            Tmessage::Symlink { .. } => "Tsymlink",
            Tmessage::Mknod { .. } => "Tmknod",
            Tmessage::Rename { .. } => "Trename",
            Tmessage::Readlink { .. } => "Treadlink",
            Tmessage::Getattr { .. } => "Tgetattr",
            Tmessage::Setattr { .. } => "Tsetattr",
            Tmessage::Readdir { .. } => "Treaddir",
            Tmessage::Fsync { .. } => "Tfsync",
            Tmessage::Link { .. } => "Tlink",
            Tmessage::Mkdir { .. } => "Tmkdir",
            Tmessage::Renameat { .. } => "Trenameat",
            Tmessage::Unlinkat { .. } => "Tunlinkat",
        }
    }

    pub fn encode(&self, tag: u16) -> Vec<u8> {
        use ty::*;
        let mut e;
        match self {
            Tmessage::Version { msize, version } => {
                e = Encoder::new(TVERSION, tag);
                e.u32(*msize).str(version);
            }
            Tmessage::Auth { afid, uname, aname, n_uname } => {
                e = Encoder::new(TAUTH, tag);
                e.u32(*afid).str(uname).str(aname).u32(*n_uname);
            }
            Tmessage::Attach { fid, afid, uname, aname, n_uname } => {
                e = Encoder::new(TATTACH, tag);
                e.u32(*fid).u32(*afid).str(uname).str(aname).u32(*n_uname);
            }
            Tmessage::Flush { oldtag } => {
                e = Encoder::new(TFLUSH, tag);
                e.u16(*oldtag);
            }
            Tmessage::Walk { fid, newfid, names } => {
                e = Encoder::new(TWALK, tag);
                e.u32(*fid).u32(*newfid).u16(names.len() as u16);
                for name in names {
                    e.str(name);
                }
            }
            Tmessage::Read { fid, offset, count } => {
                e = Encoder::new(TREAD, tag);
                e.u32(*fid).u64(*offset).u32(*count);
            }
            Tmessage::Write { fid, offset, data } => {
                e = Encoder::new(TWRITE, tag);
                e.u32(*fid).u64(*offset).data(data);
            }
            Tmessage::Clunk { fid } => {
                e = Encoder::new(TCLUNK, tag);
                e.u32(*fid);
            }
            Tmessage::Remove { fid } => {
                e = Encoder::new(TREMOVE, tag);
                e.u32(*fid);
            }
            Tmessage::Statfs { fid } => {
                e = Encoder::new(TSTATFS, tag);
                e.u32(*fid);
            }
            Tmessage::Lopen { fid, flags } => {
                e = Encoder::new(TLOPEN, tag);
                e.u32(*fid).u32(flags.0);
            }
            Tmessage::Lcreate { fid, name, flags, mode, gid } => {
                e = Encoder::new(TLCREATE, tag);
                e.u32(*fid).str(name).u32(flags.0).u32(*mode).u32(*gid);
            }
            Tmessage::Symlink { fid, name, target, gid } => {
                e = Encoder::new(TSYMLINK, tag);
                e.u32(*fid).str(name).str(target).u32(*gid);
            }
            Tmessage::Mknod { dfid, name, mode, major, minor, gid } => {
                e = Encoder::new(TMKNOD, tag);
                e.u32(*dfid).str(name).u32(*mode).u32(*major).u32(*minor).u32(*gid);
            }
            Tmessage::Rename { fid, dfid, name } => {
                e = Encoder::new(TRENAME, tag);
                e.u32(*fid).u32(*dfid).str(name);
            }
            Tmessage::Readlink { fid } => {
                e = Encoder::new(TREADLINK, tag);
                e.u32(*fid);
            }
            Tmessage::Getattr { fid, mask } => {
                e = Encoder::new(TGETATTR, tag);
                e.u32(*fid).u64(mask.0);
            }
            Tmessage::Setattr { fid, valid, attr } => {
                e = Encoder::new(TSETATTR, tag);
                e.u32(*fid)
                    .u32(valid.0)
                    .u32(attr.mode)
                    .u32(attr.uid)
                    .u32(attr.gid)
                    .u64(attr.size)
                    .u64(attr.atime_sec)
                    .u64(attr.atime_nsec)
                    .u64(attr.mtime_sec)
                    .u64(attr.mtime_nsec);
            }
            Tmessage::Readdir { fid, offset, count } => {
                e = Encoder::new(TREADDIR, tag);
                e.u32(*fid).u64(*offset).u32(*count);
            }
            Tmessage::Fsync { fid, datasync } => {
                e = Encoder::new(TFSYNC, tag);
                e.u32(*fid).u32(*datasync);
            }
            Tmessage::Link { dfid, fid, name } => {
                e = Encoder::new(TLINK, tag);
                e.u32(*dfid).u32(*fid).str(name);
            }
            Tmessage::Mkdir { dfid, name, mode, gid } => {
                e = Encoder::new(TMKDIR, tag);
                e.u32(*dfid).str(name).u32(*mode).u32(*gid);
            }
            Tmessage::Renameat { olddirfid, oldname, newdirfid, newname } => {
                e = Encoder::new(TRENAMEAT, tag);
                e.u32(*olddirfid).str(oldname).u32(*newdirfid).str(newname);
            }
            Tmessage::Unlinkat { dirfid, name, flags } => {
                e = Encoder::new(TUNLINKAT, tag);
                e.u32(*dirfid).str(name).u32(*flags);
            }
        }
        e.finish()
    }

    pub fn decode(frame: &[u8]) -> ProtoResult<Fcall<Tmessage>> {
        use ty::*;
        let (kind, tag, mut d) = body(frame)?;
        let msg = match kind {
            TVERSION => Tmessage::Version { msize: d.u32()?, version: d.str()? },
            TAUTH => Tmessage::Auth {
                afid: d.u32()?,
                uname: d.str()?,
                aname: d.str()?,
                n_uname: d.u32()?,
            },
            TATTACH => Tmessage::Attach {
                fid: d.u32()?,
                afid: d.u32()?,
                uname: d.str()?,
                aname: d.str()?,
                n_uname: d.u32()?,
            },
            TFLUSH => Tmessage::Flush { oldtag: d.u16()? },
            TWALK => {
                let fid = d.u32()?;
                let newfid = d.u32()?;
                let count = d.u16()? as usize;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(d.str()?);
                }
                Tmessage::Walk { fid, newfid, names }
            }
            TREAD => Tmessage::Read { fid: d.u32()?, offset: d.u64()?, count: d.u32()? },
            TWRITE => Tmessage::Write { fid: d.u32()?, offset: d.u64()?, data: d.data()? },
            TCLUNK => Tmessage::Clunk { fid: d.u32()? },
            TREMOVE => Tmessage::Remove { fid: d.u32()? },
            TSTATFS => Tmessage::Statfs { fid: d.u32()? },
            TLOPEN => Tmessage::Lopen { fid: d.u32()?, flags: OpenFlags(d.u32()?) },
            TLCREATE => Tmessage::Lcreate {
                fid: d.u32()?,
                name: d.str()?,
                flags: OpenFlags(d.u32()?),
                mode: d.u32()?,
                gid: d.u32()?,
            },
            TSYMLINK => Tmessage::Symlink {
                fid: d.u32()?,
                name: d.str()?,
                target: d.str()?,
                gid: d.u32()?,
            },
            TMKNOD => Tmessage::Mknod {
                dfid: d.u32()?,
                name: d.str()?,
                mode: d.u32()?,
                major: d.u32()?,
                minor: d.u32()?,
                gid: d.u32()?,
            },
            TRENAME => Tmessage::Rename { fid: d.u32()?, dfid: d.u32()?, name: d.str()? },
            TREADLINK => Tmessage::Readlink { fid: d.u32()? },
            TGETATTR => Tmessage::Getattr { fid: d.u32()?, mask: AttrMask(d.u64()?) },
            TSETATTR => Tmessage::Setattr {
                fid: d.u32()?,
                valid: SetAttrMask(d.u32()?),
                attr: SetAttr {
                    mode: d.u32()?,
                    uid: d.u32()?,
                    gid: d.u32()?,
                    size: d.u64()?,
                    atime_sec: d.u64()?,
                    atime_nsec: d.u64()?,
                    mtime_sec: d.u64()?,
                    mtime_nsec: d.u64()?,
                },
            },
            TREADDIR => Tmessage::Readdir { fid: d.u32()?, offset: d.u64()?, count: d.u32()? },
            TFSYNC => {
                let fid = d.u32()?;
                // Older clients send only the fid.
                let datasync = if d.remaining() >= 4 { d.u32()? } else { 0 };
                Tmessage::Fsync { fid, datasync }
            }
            TLINK => Tmessage::Link { dfid: d.u32()?, fid: d.u32()?, name: d.str()? },
            TMKDIR => Tmessage::Mkdir {
                dfid: d.u32()?,
                name: d.str()?,
                mode: d.u32()?,
                gid: d.u32()?,
            },
            TRENAMEAT => Tmessage::Renameat {
                olddirfid: d.u32()?,
                oldname: d.str()?,
                newdirfid: d.u32()?,
                newname: d.str()?,
            },
            TUNLINKAT => Tmessage::Unlinkat { dirfid: d.u32()?, name: d.str()?, flags: d.u32()? },
            other => return Err(ProtoError::UnknownType(other)),
        };
        Ok(Fcall { tag, msg })
    }
}

fn encode_attr(e: &mut Encoder, attr: &Attr) {
    e.u32(attr.mode)
        .u32(attr.uid)
        .u32(attr.gid)
        .u64(attr.nlink)
        .u64(attr.rdev)
        .u64(attr.size)
        .u64(attr.blksize)
        .u64(attr.blocks)
        .u64(attr.atime_sec)
        .u64(attr.atime_nsec)
        .u64(attr.mtime_sec)
        .u64(attr.mtime_nsec)
        .u64(attr.ctime_sec)
        .u64(attr.ctime_nsec)
        .u64(attr.btime_sec)
        .u64(attr.btime_nsec)
        .u64(attr.gen)
        .u64(attr.data_version);
}

fn decode_attr(d: &mut Decoder<'_>) -> ProtoResult<Attr> {
    Ok(Attr {
        mode: d.u32()?,
        uid: d.u32()?,
        gid: d.u32()?,
        nlink: d.u64()?,
        rdev: d.u64()?,
        size: d.u64()?,
        blksize: d.u64()?,
        blocks: d.u64()?,
        atime_sec: d.u64()?,
        atime_nsec: d.u64()?,
        mtime_sec: d.u64()?,
        mtime_nsec: d.u64()?,
        ctime_sec: d.u64()?,
        ctime_nsec: d.u64()?,
        btime_sec: d.u64()?,
        btime_nsec: d.u64()?,
        gen: d.u64()?,
        data_version: d.u64()?,
    })
}

impl Rmessage {
    pub fn name(&self) -> &'static str {
        match self {
            Rmessage::Version { .. } => "Rversion",
            Rmessage::Attach { .. } => "Rattach",
            Rmessage::Flush => "Rflush",
            Rmessage::Walk { .. } => "Rwalk",
            Rmessage::Read { .. } => "Rread",
            Rmessage::Write { .. } => "Rwrite",
            Rmessage::Clunk => "Rclunk",
            Rmessage::Remove => "Rremove",
            Rmessage::Statfs(_) => "Rstatfs",
            Rmessage::Lopen { .. } => "Rlopen",
            Rmessage::Lcreate { .. } => "Rlcreate",
            Rmessage::Symlink { .. } => "Rsymlink",
            Rmessage::Mknod { .. } => "Rmknod",
            Rmessage::Rename => "Rrename",
            Rmessage::Readlink { .. } => "Rreadlink",
            Rmessage::Getattr { .. } => "Rgetattr",
            Rmessage::Setattr => "Rsetattr",
            Rmessage::Readdir { .. } => "Rreaddir",
            Rmessage::Fsync => "Rfsync",
            Rmessage::Link => "Rlink",
            Rmessage::Mkdir { .. } => "Rmkdir",
            Rmessage::Renameat => "Rrenameat",
            Rmessage::Unlinkat => "Runlinkat",
            Rmessage::Lerror { .. } => "Rlerror",
        }
    }

    pub fn encode(&self, tag: u16) -> Vec<u8> {
        use ty::*;
        let mut e;
        match self {
            Rmessage::Version { msize, version } => {
                e = Encoder::new(RVERSION, tag);
                e.u32(*msize).str(version);
            }
            Rmessage::Attach { qid } => {
                e = Encoder::new(RATTACH, tag);
                e.qid(qid);
            }
            Rmessage::Flush => e = Encoder::new(RFLUSH, tag),
            Rmessage::Walk { qids } => {
                e = Encoder::new(RWALK, tag);
                e.u16(qids.len() as u16);
                for qid in qids {
                    e.qid(qid);
                }
            }
            Rmessage::Read { data } => {
                e = Encoder::new(RREAD, tag);
                e.data(data);
            }
            Rmessage::Write { count } => {
                e = Encoder::new(RWRITE, tag);
                e.u32(*count);
            }
            Rmessage::Clunk => e = Encoder::new(RCLUNK, tag),
            Rmessage::Remove => e = Encoder::new(RREMOVE, tag),
            Rmessage::Statfs(st) => {
                e = Encoder::new(RSTATFS, tag);
                e.u32(st.ty)
                    .u32(st.bsize)
                    .u64(st.blocks)
                    .u64(st.bfree)
                    .u64(st.bavail)
                    .u64(st.files)
                    .u64(st.ffree)
                    .u64(st.fsid)
                    .u32(st.namelen);
            }
            Rmessage::Lopen { qid, iounit } => {
                e = Encoder::new(RLOPEN, tag);
                e.qid(qid).u32(*iounit);
            }
            Rmessage::Lcreate { qid, iounit } => {
                e = Encoder::new(RLCREATE, tag);
                e.qid(qid).u32(*iounit);
            }
            Rmessage::Symlink { qid } => {
                e = Encoder::new(RSYMLINK, tag);
                e.qid(qid);
            }
            Rmessage::Mknod { qid } => {
                e = Encoder::new(RMKNOD, tag);
                e.qid(qid);
            }
            Rmessage::Rename => e = Encoder::new(RRENAME, tag),
            Rmessage::Readlink { target } => {
                e = Encoder::new(RREADLINK, tag);
                e.str(target);
            }
            Rmessage::Getattr { valid, qid, attr } => {
                e = Encoder::new(RGETATTR, tag);
                e.u64(valid.0).qid(qid);
                encode_attr(&mut e, attr);
            }
            Rmessage::Setattr => e = Encoder::new(RSETATTR, tag),
            Rmessage::Readdir { entries } => {
                e = Encoder::new(RREADDIR, tag);
                let total: usize = entries.iter().map(Dirent::wire_size).sum();
                e.u32(total as u32);
                for ent in entries {
                    e.qid(&ent.qid).u64(ent.offset).u8(ent.kind).str(&ent.name);
                }
            }
            Rmessage::Fsync => e = Encoder::new(RFSYNC, tag),
            Rmessage::Link => e = Encoder::new(RLINK, tag),
            Rmessage::Mkdir { qid } => {
                e = Encoder::new(RMKDIR, tag);
                e.qid(qid);
            }
            Rmessage::Renameat => e = Encoder::new(RRENAMEAT, tag),
            Rmessage::Unlinkat => e = Encoder::new(RUNLINKAT, tag),
            Rmessage::Lerror { ecode } => {
                e = Encoder::new(RLERROR, tag);
                e.u32(*ecode);
            }
        }
        e.finish()
    }

    pub fn decode(frame: &[u8]) -> ProtoResult<Fcall<Rmessage>> {
        use ty::*;
        let (kind, tag, mut d) = body(frame)?;
        let msg = match kind {
            RVERSION => Rmessage::Version { msize: d.u32()?, version: d.str()? },
            RATTACH => Rmessage::Attach { qid: d.qid()? },
            RFLUSH => Rmessage::Flush,
            RWALK => {
                let count = d.u16()? as usize;
                let mut qids = Vec::with_capacity(count);
                for _ in 0..count {
                    qids.push(d.qid()?);
                }
                Rmessage::Walk { qids }
            }
            RREAD => Rmessage::Read { data: d.data()? },
            RWRITE => Rmessage::Write { count: d.u32()? },
            RCLUNK => Rmessage::Clunk,
            RREMOVE => Rmessage::Remove,
            RSTATFS => Rmessage::Statfs(FsStat {
                ty: d.u32()?,
                bsize: d.u32()?,
                blocks: d.u64()?,
                bfree: d.u64()?,
                bavail: d.u64()?,
                files: d.u64()?,
                ffree: d.u64()?,
                fsid: d.u64()?,
                namelen: d.u32()?,
            }),
            RLOPEN => Rmessage::Lopen { qid: d.qid()?, iounit: d.u32()? },
            RLCREATE => Rmessage::Lcreate { qid: d.qid()?, iounit: d.u32()? },
            RSYMLINK => Rmessage::Symlink { qid: d.qid()? },
            RMKNOD => Rmessage::Mknod { qid: d.qid()? },
            RRENAME => Rmessage::Rename,
            RREADLINK => Rmessage::Readlink { target: d.str()? },
            RGETATTR => Rmessage::Getattr {
                valid: AttrMask(d.u64()?),
                qid: d.qid()?,
                attr: decode_attr(&mut d)?,
            },
            RSETATTR => Rmessage::Setattr,
            RREADDIR => {
                let payload = d.data()?;
                let mut entries = Vec::new();
                let mut inner = Decoder::new(&payload);
                while inner.remaining() > 0 {
                    entries.push(Dirent {
                        qid: inner.qid()?,
                        offset: inner.u64()?,
                        kind: inner.u8()?,
                        name: inner.str()?,
                    });
                }
                Rmessage::Readdir { entries }
            }
            RFSYNC => Rmessage::Fsync,
            RLINK => Rmessage::Link,
            RMKDIR => Rmessage::Mkdir { qid: d.qid()? },
            RRENAMEAT => Rmessage::Renameat,
            RUNLINKAT => Rmessage::Unlinkat,
            RLERROR => Rmessage::Lerror { ecode: d.u32()? },
            other => return Err(ProtoError::UnknownType(other)),
        };
        Ok(Fcall { tag, msg })
    }
}

/// Bytes of `Rread` payload that fit in one frame of `msize` bytes.
pub fn max_io_size(msize: u32) -> u32 {
    msize.saturating_sub(IOHDRSZ)
}

/// Largest `Rreaddir` payload for a request of `count` bytes.
pub fn readdir_budget(msize: u32, count: u32) -> usize {
    count.min(max_io_size(msize)) as usize
}

/// Read one whole frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R, msize: u32) -> ProtoResult<Option<Vec<u8>>> {
    let mut size_buf = [0u8; 4];
    let mut filled = 0;
    while filled < size_buf.len() {
        match reader.read(&mut size_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtoError::Io(io::ErrorKind::UnexpectedEof.into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let size = u32::from_le_bytes(size_buf);
    if (size as usize) < HEADER_SIZE {
        return Err(ProtoError::Undersized(size));
    }
    if size > msize {
        return Err(ProtoError::Oversized { size, msize });
    }
    let mut frame = vec![0u8; size as usize];
    frame[..4].copy_from_slice(&size_buf);
    reader.read_exact(&mut frame[4..])?;
    Ok(Some(frame))
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> ProtoResult<()> {
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}
