// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io;
use std::path::Path;

use nix::mount::MsFlags;

/// The `mount(2)` primitive. Empty strings stand for null arguments.
#[cfg_attr(test, mockall::automock)]
pub trait Mounter: Send + Sync {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> io::Result<()>;
}

/// Mounts with `nix::mount::mount`.
pub struct NixMounter;

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

impl Mounter for NixMounter {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> io::Result<()> {
        nix::mount::mount(non_empty(source), target, non_empty(fstype), flags, non_empty(data))
            .map_err(io::Error::from)
    }
}
