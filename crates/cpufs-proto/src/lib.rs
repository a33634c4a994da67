// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! cpufs protocol: 9P2000.L identity model and wire codec
//!
//! This crate defines the value types shared by every protocol backend and
//! by the kernel-facing gateway (QIDs, attribute records, directory entries)
//! together with the little-endian frame codec spoken between the protocol
//! client and server.

pub mod error;
pub mod types;
pub mod wire;

pub use error::{ProtoError, ProtoResult};
pub use types::{
    AccessMode, Attr, AttrMask, Dirent, FsStat, OpenFlags, Qid, QidType, SetAttr, SetAttrMask,
    AT_REMOVEDIR,
};
pub use wire::{
    frame_header, max_io_size, read_frame, readdir_budget, write_frame, Fcall, Rmessage, Tmessage,
    IOHDRSZ, NOFID, NOTAG, VERSION_9P2000L,
};
