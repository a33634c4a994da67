// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mounting a [`Gateway`] into the kernel

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::gateway::Gateway;

/// File system name the gateway mount shows in the mount table.
pub const FS_NAME: &str = "cpud";

/// A live gateway mount. Dropping it unmounts.
pub trait MountedGateway: Send {
    /// Block until the mount goes away.
    fn join(self: Box<Self>);
}

/// Puts a gateway behind a kernel mount point.
pub trait GatewayMounter: Send + Sync {
    fn mount(&self, gateway: Arc<Gateway>, target: &Path) -> io::Result<Box<dyn MountedGateway>>;
}

/// The mounter this build supports: FUSE when the `fuse` feature is on,
/// otherwise one that always fails.
pub fn default_mounter() -> Box<dyn GatewayMounter> {
    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        Box::new(crate::fuse::FuserMounter)
    }
    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        Box::new(Unavailable)
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
struct Unavailable;

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
impl GatewayMounter for Unavailable {
    fn mount(&self, _gateway: Arc<Gateway>, target: &Path) -> io::Result<Box<dyn MountedGateway>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot mount {}: built without FUSE support", target.display()),
        ))
    }
}
