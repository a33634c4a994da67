// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel-facing gateway
//!
//! [`Gateway`] keeps the inode and handle caches that let a FUSE mount
//! forward kernel calls to any [`ProtocolNode`](cpufs_core::ProtocolNode),
//! normally a [`RemoteNode`](cpufs_core::RemoteNode) on a 9P client. The
//! `fuse` feature adds the `fuser` adapter and mounter.

pub mod gateway;
pub mod mount;

#[cfg(all(feature = "fuse", target_os = "linux"))]
pub mod fuse;

pub use gateway::{CachedAttr, Gateway, GatewayConfig, LookupEntry, OpenedFile, ROOT_INODE};
pub use mount::{default_mounter, GatewayMounter, MountedGateway};
