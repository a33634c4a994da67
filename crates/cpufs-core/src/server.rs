// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L server over any byte stream
//!
//! One call to [`Server::serve`] owns one connection and handles its
//! requests in order. Run each connection on its own thread to serve several
//! clients.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use cpufs_proto::wire::{frame_header, max_io_size, readdir_budget};
use cpufs_proto::{
    read_frame, write_frame, AttrMask, ProtoError, Rmessage, Tmessage, VERSION_9P2000L,
};
use tracing::{debug, info, trace, warn, Span};

use crate::error::{FsError, FsResult};
use crate::node::{Attacher, ProtocolNode};
use crate::nonce::Nonce;

/// msize offered to clients unless configured otherwise.
pub const DEFAULT_MSIZE: u32 = 1024 * 1024;
const MIN_MSIZE: u32 = 4096;

pub struct Server {
    attacher: Arc<dyn Attacher>,
    msize: u32,
    span: Span,
}

struct Connection {
    msize: u32,
    fids: HashMap<u32, Box<dyn ProtocolNode>>,
}

impl Connection {
    fn node(&self, fid: u32) -> FsResult<&dyn ProtocolNode> {
        self.fids.get(&fid).map(|n| n.as_ref()).ok_or(FsError::BadHandle)
    }

    fn install(&mut self, fid: u32, node: Box<dyn ProtocolNode>) {
        if let Some(old) = self.fids.insert(fid, node) {
            let _ = old.close();
        }
    }

    fn clunk_all(&mut self) {
        for (_, node) in self.fids.drain() {
            let _ = node.close();
        }
    }
}

impl Server {
    pub fn new(attacher: Arc<dyn Attacher>) -> Self {
        Self { attacher, msize: DEFAULT_MSIZE, span: Span::none() }
    }

    pub fn with_msize(mut self, msize: u32) -> Self {
        self.msize = msize.max(MIN_MSIZE);
        self
    }

    /// Span that every request handled by this server is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Check the session secret, then serve.
    pub fn serve_authenticated<S: Read + Write>(&self, mut stream: S, nonce: &Nonce) -> FsResult<()> {
        if let Err(e) = nonce.verify_from(&mut stream) {
            self.span.in_scope(|| warn!(error = %e, "rejecting connection: bad nonce"));
            return Err(e);
        }
        self.serve(stream)
    }

    /// Serve requests until the peer closes the stream.
    pub fn serve<S: Read + Write>(&self, mut stream: S) -> FsResult<()> {
        let _enter = self.span.enter();
        let mut conn = Connection { msize: self.msize, fids: HashMap::new() };
        let result = self.serve_loop(&mut stream, &mut conn);
        conn.clunk_all();
        match &result {
            Ok(()) => info!("9P connection closed"),
            Err(e) => warn!(error = %e, "9P connection failed"),
        }
        result
    }

    fn serve_loop<S: Read + Write>(&self, stream: &mut S, conn: &mut Connection) -> FsResult<()> {
        while let Some(frame) = read_frame(stream, conn.msize)? {
            let (_, tag) = frame_header(&frame)?;
            let reply = match Tmessage::decode(&frame) {
                Ok(call) => {
                    trace!(tag, msg = call.msg.name(), "request");
                    self.dispatch(conn, call.msg).unwrap_or_else(|e| {
                        debug!(tag, error = %e, "request failed");
                        Rmessage::Lerror { ecode: e.errno() as u32 }
                    })
                }
                Err(ProtoError::UnknownType(ty)) => {
                    debug!(tag, ty, "unsupported message type");
                    Rmessage::Lerror { ecode: libc::EOPNOTSUPP as u32 }
                }
                Err(e) => {
                    warn!(tag, error = %e, "malformed request");
                    Rmessage::Lerror { ecode: libc::EINVAL as u32 }
                }
            };
            write_frame(stream, &reply.encode(tag))?;
        }
        Ok(())
    }

    fn dispatch(&self, conn: &mut Connection, msg: Tmessage) -> FsResult<Rmessage> {
        Ok(match msg {
            Tmessage::Version { msize, version } => {
                conn.clunk_all();
                conn.msize = msize.min(self.msize).max(MIN_MSIZE);
                let version = if version.starts_with(VERSION_9P2000L) {
                    VERSION_9P2000L.to_string()
                } else {
                    "unknown".to_string()
                };
                debug!(msize = conn.msize, %version, "negotiated");
                Rmessage::Version { msize: conn.msize, version }
            }
            Tmessage::Auth { .. } => return Err(FsError::NotSupported),
            Tmessage::Attach { fid, uname, .. } => {
                if conn.fids.contains_key(&fid) {
                    return Err(FsError::BadHandle);
                }
                let root = self.attacher.attach()?;
                let (qid, _, _) = root.get_attr(AttrMask::BASIC)?;
                info!(fid, %uname, "attached");
                conn.install(fid, root);
                Rmessage::Attach { qid }
            }
            Tmessage::Flush { .. } => Rmessage::Flush,
            Tmessage::Walk { fid, newfid, names } => {
                if newfid != fid && conn.fids.contains_key(&newfid) {
                    return Err(FsError::BadHandle);
                }
                let (qids, node) = conn.node(fid)?.walk(&names)?;
                conn.install(newfid, node);
                Rmessage::Walk { qids: if names.is_empty() { Vec::new() } else { qids } }
            }
            Tmessage::Read { fid, offset, count } => {
                let mut data = vec![0u8; count.min(max_io_size(conn.msize)) as usize];
                let n = conn.node(fid)?.read_at(&mut data, offset)?;
                data.truncate(n);
                Rmessage::Read { data }
            }
            Tmessage::Write { fid, offset, data } => {
                let count = conn.node(fid)?.write_at(&data, offset)?;
                Rmessage::Write { count: count as u32 }
            }
            Tmessage::Clunk { fid } => {
                let node = conn.fids.remove(&fid).ok_or(FsError::BadHandle)?;
                node.close()?;
                Rmessage::Clunk
            }
            Tmessage::Remove { fid } => {
                // The fid is released even though removal by fid is not offered.
                let node = conn.fids.remove(&fid).ok_or(FsError::BadHandle)?;
                let _ = node.close();
                return Err(FsError::NotSupported);
            }
            Tmessage::Statfs { fid } => Rmessage::Statfs(conn.node(fid)?.statfs()?),
            Tmessage::Lopen { fid, flags } => {
                let (qid, iounit) = conn.node(fid)?.open(flags)?;
                Rmessage::Lopen { qid, iounit }
            }
            Tmessage::Lcreate { fid, name, flags, mode, gid } => {
                let (node, qid, iounit) = conn.node(fid)?.create(&name, flags, mode, gid)?;
                conn.install(fid, node);
                Rmessage::Lcreate { qid, iounit }
            }
            Tmessage::Symlink { fid, name, target, gid } => {
                Rmessage::Symlink { qid: conn.node(fid)?.symlink(&target, &name, gid)? }
            }
            Tmessage::Mknod { dfid, name, mode, major, minor, gid } => {
                Rmessage::Mknod { qid: conn.node(dfid)?.mknod(&name, mode, major, minor, gid)? }
            }
            Tmessage::Rename { fid, dfid, name } => {
                let node = conn.node(fid)?;
                let dir = conn.node(dfid)?;
                node.rename(dir, &name)?;
                node.renamed(dir, &name);
                Rmessage::Rename
            }
            Tmessage::Readlink { fid } => Rmessage::Readlink { target: conn.node(fid)?.readlink()? },
            Tmessage::Getattr { fid, mask } => {
                let (qid, valid, attr) = conn.node(fid)?.get_attr(mask)?;
                Rmessage::Getattr { valid, qid, attr }
            }
            Tmessage::Setattr { fid, valid, attr } => {
                conn.node(fid)?.set_attr(valid, attr)?;
                Rmessage::Setattr
            }
            Tmessage::Readdir { fid, offset, count } => {
                let budget = readdir_budget(conn.msize, count);
                let mut entries = conn.node(fid)?.readdir(offset, budget as u32)?;
                let mut used = 0usize;
                let keep = entries
                    .iter()
                    .take_while(|e| {
                        used += e.wire_size();
                        used <= budget
                    })
                    .count();
                entries.truncate(keep);
                Rmessage::Readdir { entries }
            }
            Tmessage::Fsync { fid, .. } => {
                conn.node(fid)?.fsync()?;
                Rmessage::Fsync
            }
            Tmessage::Link { dfid, fid, name } => {
                conn.node(dfid)?.link(conn.node(fid)?, &name)?;
                Rmessage::Link
            }
            Tmessage::Mkdir { dfid, name, mode, gid } => {
                Rmessage::Mkdir { qid: conn.node(dfid)?.mkdir(&name, mode, gid)? }
            }
            Tmessage::Renameat { olddirfid, oldname, newdirfid, newname } => {
                conn.node(olddirfid)?.rename_at(&oldname, conn.node(newdirfid)?, &newname)?;
                Rmessage::Renameat
            }
            Tmessage::Unlinkat { dirfid, name, flags } => {
                conn.node(dirfid)?.unlink_at(&name, flags)?;
                Rmessage::Unlinkat
            }
        })
    }
}
