// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Namespace assembly for a cpu session
//!
//! [`Namespace::assemble`] authenticates a connection back to the 9P
//! server, mounts the remote tree either natively through the kernel's 9p
//! client or through the FUSE gateway, then bind-mounts the requested
//! remote directories over local ones.

pub mod bind;
pub mod config;
pub mod error;
pub mod mounter;
pub mod namespace;

pub use bind::{parse_binds, Bind, BindError};
pub use config::{CacheConfig, ConfigError, Environment, ProcessEnv, ServeMode, SessionConfig};
pub use error::{OverlayWarning, SessionError};
pub use mounter::{Mounter, NixMounter};
pub use namespace::{Connector, Namespace, TcpConnector};
