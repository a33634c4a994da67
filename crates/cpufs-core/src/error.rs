// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for cpufs backends, server and client

use cpufs_proto::ProtoError;
use std::io;

/// Filesystem error shared by every [`ProtocolNode`](crate::ProtocolNode)
/// implementation. Each variant has a Linux errno, which is what travels in
/// `Rlerror` and what the gateway replies to the kernel with.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("file does not exist")]
    NotExist,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file handle")]
    BadHandle,
    #[error("remote error: errno {0}")]
    Remote(i32),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
    #[error("io error: {0}")]
    Io(io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotExist => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::NotPermitted => libc::EPERM,
            FsError::NotSupported => libc::ENOSYS,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::BadHandle => libc::EBADF,
            FsError::Remote(errno) => *errno,
            FsError::Protocol(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotExist,
            libc::EACCES => FsError::PermissionDenied,
            libc::EPERM => FsError::NotPermitted,
            libc::ENOSYS | libc::EOPNOTSUPP => FsError::NotSupported,
            libc::EINVAL => FsError::InvalidArgument,
            libc::EBADF => FsError::BadHandle,
            other => FsError::Remote(other),
        }
    }

    pub(crate) fn closed() -> Self {
        FsError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "9P connection closed"))
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        if e.raw_os_error() == Some(libc::EPERM) {
            return FsError::NotPermitted;
        }
        match e.kind() {
            io::ErrorKind::NotFound => FsError::NotExist,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::Unsupported => FsError::NotSupported,
            _ => FsError::Io(e),
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(e: nix::Error) -> Self {
        FsError::from_errno(e as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_through_taxonomy() {
        for err in [
            FsError::NotExist,
            FsError::PermissionDenied,
            FsError::NotPermitted,
            FsError::NotSupported,
            FsError::InvalidArgument,
        ] {
            let back = FsError::from_errno(err.errno());
            assert_eq!(back.errno(), err.errno(), "{err}");
        }
        assert!(matches!(FsError::from_errno(libc::EOPNOTSUPP), FsError::NotSupported));
        assert_eq!(FsError::from_errno(libc::ENOTEMPTY).errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn io_errors_keep_their_errno() {
        let err = FsError::from(io::Error::from_raw_os_error(libc::ENOTDIR));
        assert_eq!(err.errno(), libc::ENOTDIR);
        assert!(matches!(
            FsError::from(io::Error::from_raw_os_error(libc::ENOENT)),
            FsError::NotExist
        ));
        let eperm = FsError::from(io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(eperm, FsError::NotPermitted));
        assert_eq!(eperm.errno(), libc::EPERM);
        let eacces = FsError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(eacces.errno(), libc::EACCES);
        let synthetic = FsError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(synthetic.errno(), libc::EIO);
    }
}
