// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Codec errors

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("truncated message: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("frame of {size} bytes exceeds negotiated msize {msize}")]
    Oversized { size: u32, msize: u32 },
    #[error("frame size {0} is smaller than the 9P header")]
    Undersized(u32),
    #[error("unsupported message type {0}")]
    UnknownType(u8),
    #[error("string field is not valid UTF-8")]
    BadString,
    #[error("unexpected reply {got} to {expected}")]
    UnexpectedReply { expected: &'static str, got: &'static str },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
