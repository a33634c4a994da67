// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! cpufs core: protocol backends, server and client
//!
//! Two backends implement [`ProtocolNode`]: [`LocalFs`] serves a real
//! directory tree and [`ArchiveFs`] serves a cpio archive as a read-only
//! tree. [`Server`] exposes either over a 9P2000.L byte stream and
//! [`Client`] speaks to such a server, handing out [`RemoteNode`]s that
//! implement the same trait.

pub mod archive;
pub mod client;
pub mod error;
pub mod local;
pub mod node;
pub mod nonce;
pub mod server;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use archive::{ArchiveError, ArchiveFs, ArchiveIndex, ArchiveNode};
pub use client::{Client, DuplexStream, RemoteNode};
pub use error::{FsError, FsResult};
pub use local::{LocalFs, LocalNode};
pub use node::{Attacher, ProtocolNode, WalkAttr, Walked};
pub use nonce::Nonce;
pub use server::{Server, DEFAULT_MSIZE};
