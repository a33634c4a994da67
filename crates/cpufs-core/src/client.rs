// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! 9P2000.L client
//!
//! Requests are multiplexed by tag: callers block on a per-request channel
//! while a reader thread routes each reply to its waiter, so concurrent
//! callers do not serialize on the socket. Fids handed out as
//! [`RemoteNode`]s are clunked when the node is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use cpufs_proto::wire::{frame_header, max_io_size};
use cpufs_proto::{
    read_frame, write_frame, Attr, AttrMask, Dirent, FsStat, OpenFlags, ProtoError, Qid,
    Rmessage, SetAttr, SetAttrMask, Tmessage, NOFID, NOTAG, VERSION_9P2000L,
};
use tracing::{debug, trace, warn, Span};

use crate::error::{FsError, FsResult};
use crate::node::{ProtocolNode, Walked};

/// `n_uname` meaning "no numeric user".
const NONUNAME: u32 = u32::MAX;

/// A bidirectional stream that can be split into independent read and write
/// halves.
pub trait DuplexStream: Read + Write + Send + Sync + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>
    where
        Self: Sized;

    fn shutdown_stream(&self);
}

impl DuplexStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl DuplexStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_stream(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

type Reply = FsResult<Rmessage>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unexpected(expected: &'static str, got: Rmessage) -> FsError {
    FsError::Protocol(ProtoError::UnexpectedReply { expected, got: got.name() })
}

macro_rules! expect_reply {
    ($reply:expr, $pat:pat => $out:expr, $name:literal) => {
        match $reply {
            $pat => Ok($out),
            other => Err(unexpected($name, other)),
        }
    };
}

#[derive(Default)]
struct Pending {
    next_tag: u16,
    waiters: HashMap<u16, Sender<Reply>>,
    closed: bool,
}

impl Pending {
    fn alloc_tag(&mut self) -> u16 {
        loop {
            let tag = self.next_tag;
            self.next_tag = self.next_tag.wrapping_add(1);
            if tag != NOTAG && !self.waiters.contains_key(&tag) {
                return tag;
            }
        }
    }
}

struct ClientInner {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<Pending>,
    next_fid: AtomicU32,
    msize: AtomicU32,
    closer: Option<Box<dyn Fn() + Send + Sync>>,
    span: Span,
}

impl ClientInner {
    fn rpc(&self, msg: Tmessage) -> Reply {
        self.rpc_tagged(None, msg)
    }

    fn rpc_tagged(&self, fixed_tag: Option<u16>, msg: Tmessage) -> Reply {
        let (tx, rx) = mpsc::channel();
        let tag = {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(FsError::closed());
            }
            let tag = fixed_tag.unwrap_or_else(|| pending.alloc_tag());
            pending.waiters.insert(tag, tx);
            tag
        };
        trace!(parent: &self.span, tag, msg = msg.name(), "sending");
        let frame = msg.encode(tag);
        let sent = write_frame(&mut *lock(&self.writer), &frame);
        if let Err(e) = sent {
            lock(&self.pending).waiters.remove(&tag);
            return Err(e.into());
        }
        match rx.recv() {
            Ok(Ok(Rmessage::Lerror { ecode })) => Err(FsError::from_errno(ecode as i32)),
            Ok(reply) => reply,
            Err(_) => Err(FsError::closed()),
        }
    }

    fn complete(&self, tag: u16, reply: Reply) {
        match lock(&self.pending).waiters.remove(&tag) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => warn!(parent: &self.span, tag, "reply for unknown tag"),
        }
    }

    fn fail_all(&self) {
        let mut pending = lock(&self.pending);
        pending.closed = true;
        for (_, tx) in pending.waiters.drain() {
            let _ = tx.send(Err(FsError::closed()));
        }
    }

    fn alloc_fid(&self) -> u32 {
        loop {
            let fid = self.next_fid.fetch_add(1, Ordering::Relaxed);
            if fid != NOFID {
                return fid;
            }
        }
    }

    fn max_io(&self) -> usize {
        max_io_size(self.msize.load(Ordering::Relaxed)) as usize
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(close) = &self.closer {
            close();
        }
    }
}

fn reader_loop<R: Read>(inner: Weak<ClientInner>, mut reader: R, msize: u32) {
    loop {
        let frame = match read_frame(&mut reader, msize) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "9P reader stopped");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match Rmessage::decode(&frame) {
            Ok(call) => inner.complete(call.tag, Ok(call.msg)),
            Err(e) => match frame_header(&frame) {
                Ok((_, tag)) => inner.complete(tag, Err(e.into())),
                Err(_) => break,
            },
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.fail_all();
    }
}

/// Connection to a 9P2000.L server.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Negotiate a session over `stream`, requesting `msize`.
    pub fn connect<S: DuplexStream>(stream: S, msize: u32) -> FsResult<Self> {
        Self::connect_with_span(stream, msize, Span::none())
    }

    /// Like [`Client::connect`], recording traffic under `span`.
    pub fn connect_with_span<S: DuplexStream>(stream: S, msize: u32, span: Span) -> FsResult<Self> {
        let reader = stream.try_clone_stream()?;
        let closer = reader.try_clone_stream()?;
        Self::start(reader, stream, msize, Some(Box::new(move || closer.shutdown_stream())), span)
    }

    /// Negotiate over separate read and write halves.
    pub fn from_halves<R, W>(reader: R, writer: W, msize: u32) -> FsResult<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::start(reader, writer, msize, None, Span::none())
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        msize: u32,
        closer: Option<Box<dyn Fn() + Send + Sync>>,
        span: Span,
    ) -> FsResult<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(Pending::default()),
            next_fid: AtomicU32::new(1),
            msize: AtomicU32::new(msize),
            closer,
            span: span.clone(),
        });
        let weak = Arc::downgrade(&inner);
        thread::Builder::new().name("9p-client-reader".into()).spawn(move || {
            let _enter = span.enter();
            reader_loop(weak, reader, msize)
        })?;

        let reply = inner.rpc_tagged(
            Some(NOTAG),
            Tmessage::Version { msize, version: VERSION_9P2000L.to_string() },
        )?;
        let (negotiated, version) =
            expect_reply!(reply, Rmessage::Version { msize, version } => (msize, version), "Rversion")?;
        if version != VERSION_9P2000L {
            warn!(parent: &inner.span, %version, "server does not speak 9P2000.L");
            return Err(FsError::NotSupported);
        }
        inner.msize.store(negotiated.min(msize), Ordering::Relaxed);
        debug!(parent: &inner.span, msize = negotiated, "9P session negotiated");
        Ok(Self { inner })
    }

    pub fn msize(&self) -> u32 {
        self.inner.msize.load(Ordering::Relaxed)
    }

    /// Attach to the server's tree as `uname`.
    pub fn attach(&self, uname: &str, aname: &str) -> FsResult<(Qid, RemoteNode)> {
        let fid = self.inner.alloc_fid();
        let reply = self.inner.rpc(Tmessage::Attach {
            fid,
            afid: NOFID,
            uname: uname.to_string(),
            aname: aname.to_string(),
            n_uname: NONUNAME,
        })?;
        let qid = expect_reply!(reply, Rmessage::Attach { qid } => qid, "Rattach")?;
        Ok((qid, RemoteNode::new(self.inner.clone(), fid)))
    }
}

/// A fid on a remote server.
pub struct RemoteNode {
    client: Arc<ClientInner>,
    fid: u32,
    clunked: AtomicBool,
}

impl RemoteNode {
    fn new(client: Arc<ClientInner>, fid: u32) -> Self {
        Self { client, fid, clunked: AtomicBool::new(false) }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    fn peer<'a>(&self, other: &'a dyn ProtocolNode) -> FsResult<&'a RemoteNode> {
        let peer = other.as_any().downcast_ref::<RemoteNode>().ok_or(FsError::InvalidArgument)?;
        if !Arc::ptr_eq(&peer.client, &self.client) {
            return Err(FsError::InvalidArgument);
        }
        Ok(peer)
    }

    /// Walk zero names: a second fid for the same file.
    fn clone_fid(&self) -> FsResult<RemoteNode> {
        let newfid = self.client.alloc_fid();
        let reply =
            self.client.rpc(Tmessage::Walk { fid: self.fid, newfid, names: Vec::new() })?;
        expect_reply!(reply, Rmessage::Walk { .. } => (), "Rwalk")?;
        Ok(RemoteNode::new(self.client.clone(), newfid))
    }

    fn clunk(&self) -> FsResult<()> {
        if self.clunked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let reply = self.client.rpc(Tmessage::Clunk { fid: self.fid })?;
        expect_reply!(reply, Rmessage::Clunk => (), "Rclunk")
    }
}

impl Drop for RemoteNode {
    fn drop(&mut self) {
        if let Err(e) = self.clunk() {
            trace!(parent: &self.client.span, fid = self.fid, error = %e, "clunk on drop failed");
        }
    }
}

impl ProtocolNode for RemoteNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn walk(&self, names: &[String]) -> FsResult<Walked> {
        let newfid = self.client.alloc_fid();
        let reply =
            self.client.rpc(Tmessage::Walk { fid: self.fid, newfid, names: names.to_vec() })?;
        let mut qids = expect_reply!(reply, Rmessage::Walk { qids } => qids, "Rwalk")?;
        let node = RemoteNode::new(self.client.clone(), newfid);
        if qids.len() < names.len() {
            // A short walk leaves newfid unassigned on the server.
            node.clunked.store(true, Ordering::Release);
            return Err(FsError::NotExist);
        }
        if names.is_empty() {
            let (qid, _, _) = node.get_attr(AttrMask::BASIC)?;
            qids.push(qid);
        }
        let node: Box<dyn ProtocolNode> = Box::new(node);
        Ok((qids, node))
    }

    fn open(&self, flags: OpenFlags) -> FsResult<(Qid, u32)> {
        let reply = self.client.rpc(Tmessage::Lopen { fid: self.fid, flags })?;
        expect_reply!(reply, Rmessage::Lopen { qid, iounit } => (qid, iounit), "Rlopen")
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let count = buf.len().min(self.client.max_io()) as u32;
        let reply = self.client.rpc(Tmessage::Read { fid: self.fid, offset, count })?;
        let data = expect_reply!(reply, Rmessage::Read { data } => data, "Rread")?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        let chunk = &data[..data.len().min(self.client.max_io())];
        let reply =
            self.client.rpc(Tmessage::Write { fid: self.fid, offset, data: chunk.to_vec() })?;
        expect_reply!(reply, Rmessage::Write { count } => count as usize, "Rwrite")
    }

    fn get_attr(&self, mask: AttrMask) -> FsResult<(Qid, AttrMask, Attr)> {
        let reply = self.client.rpc(Tmessage::Getattr { fid: self.fid, mask })?;
        expect_reply!(reply, Rmessage::Getattr { valid, qid, attr } => (qid, valid, attr), "Rgetattr")
    }

    fn set_attr(&self, valid: SetAttrMask, attr: SetAttr) -> FsResult<()> {
        let reply = self.client.rpc(Tmessage::Setattr { fid: self.fid, valid, attr })?;
        expect_reply!(reply, Rmessage::Setattr => (), "Rsetattr")
    }

    fn readdir(&self, offset: u64, count: u32) -> FsResult<Vec<Dirent>> {
        let reply = self.client.rpc(Tmessage::Readdir { fid: self.fid, offset, count })?;
        expect_reply!(reply, Rmessage::Readdir { entries } => entries, "Rreaddir")
    }

    fn create(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
        gid: u32,
    ) -> FsResult<(Box<dyn ProtocolNode>, Qid, u32)> {
        // Tlcreate turns the fid into the new file; keep this one on the directory.
        let file = self.clone_fid()?;
        let reply = self.client.rpc(Tmessage::Lcreate {
            fid: file.fid,
            name: name.to_string(),
            flags,
            mode,
            gid,
        })?;
        let (qid, iounit) =
            expect_reply!(reply, Rmessage::Lcreate { qid, iounit } => (qid, iounit), "Rlcreate")?;
        let file: Box<dyn ProtocolNode> = Box::new(file);
        Ok((file, qid, iounit))
    }

    fn mkdir(&self, name: &str, mode: u32, gid: u32) -> FsResult<Qid> {
        let reply = self.client.rpc(Tmessage::Mkdir {
            dfid: self.fid,
            name: name.to_string(),
            mode,
            gid,
        })?;
        expect_reply!(reply, Rmessage::Mkdir { qid } => qid, "Rmkdir")
    }

    fn symlink(&self, target: &str, name: &str, gid: u32) -> FsResult<Qid> {
        let reply = self.client.rpc(Tmessage::Symlink {
            fid: self.fid,
            name: name.to_string(),
            target: target.to_string(),
            gid,
        })?;
        expect_reply!(reply, Rmessage::Symlink { qid } => qid, "Rsymlink")
    }

    fn link(&self, target: &dyn ProtocolNode, name: &str) -> FsResult<()> {
        let target = self.peer(target)?;
        let reply = self.client.rpc(Tmessage::Link {
            dfid: self.fid,
            fid: target.fid,
            name: name.to_string(),
        })?;
        expect_reply!(reply, Rmessage::Link => (), "Rlink")
    }

    fn mknod(&self, name: &str, mode: u32, major: u32, minor: u32, gid: u32) -> FsResult<Qid> {
        let reply = self.client.rpc(Tmessage::Mknod {
            dfid: self.fid,
            name: name.to_string(),
            mode,
            major,
            minor,
            gid,
        })?;
        expect_reply!(reply, Rmessage::Mknod { qid } => qid, "Rmknod")
    }

    fn rename(&self, new_dir: &dyn ProtocolNode, new_name: &str) -> FsResult<()> {
        let dir = self.peer(new_dir)?;
        let reply = self.client.rpc(Tmessage::Rename {
            fid: self.fid,
            dfid: dir.fid,
            name: new_name.to_string(),
        })?;
        expect_reply!(reply, Rmessage::Rename => (), "Rrename")
    }

    fn rename_at(&self, old_name: &str, new_dir: &dyn ProtocolNode, new_name: &str) -> FsResult<()> {
        let dir = self.peer(new_dir)?;
        let reply = self.client.rpc(Tmessage::Renameat {
            olddirfid: self.fid,
            oldname: old_name.to_string(),
            newdirfid: dir.fid,
            newname: new_name.to_string(),
        })?;
        expect_reply!(reply, Rmessage::Renameat => (), "Rrenameat")
    }

    fn unlink_at(&self, name: &str, flags: u32) -> FsResult<()> {
        let reply = self.client.rpc(Tmessage::Unlinkat {
            dirfid: self.fid,
            name: name.to_string(),
            flags,
        })?;
        expect_reply!(reply, Rmessage::Unlinkat => (), "Runlinkat")
    }

    fn readlink(&self) -> FsResult<String> {
        let reply = self.client.rpc(Tmessage::Readlink { fid: self.fid })?;
        expect_reply!(reply, Rmessage::Readlink { target } => target, "Rreadlink")
    }

    fn statfs(&self) -> FsResult<FsStat> {
        let reply = self.client.rpc(Tmessage::Statfs { fid: self.fid })?;
        expect_reply!(reply, Rmessage::Statfs(st) => st, "Rstatfs")
    }

    fn fsync(&self) -> FsResult<()> {
        let reply = self.client.rpc(Tmessage::Fsync { fid: self.fid, datasync: 0 })?;
        expect_reply!(reply, Rmessage::Fsync => (), "Rfsync")
    }

    fn close(&self) -> FsResult<()> {
        self.clunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_skip_notag_and_in_flight() {
        let mut pending = Pending { next_tag: NOTAG - 1, ..Default::default() };
        let (tx, _rx) = mpsc::channel();
        pending.waiters.insert(0, tx);
        assert_eq!(pending.alloc_tag(), NOTAG - 1);
        // NOTAG is reserved and 0 is still waiting for its reply.
        assert_eq!(pending.alloc_tag(), 1);
    }
}
