// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One-time session secret exchanged before any 9P traffic

use std::fmt;
use std::io::{Read, Write};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FsError, FsResult};

/// Shared secret written once by the connecting side and checked by the
/// serving side. The bytes are wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Nonce(Vec<u8>);

impl Nonce {
    /// 32 printable hex characters.
    pub fn generate() -> Self {
        Nonce(uuid::Uuid::new_v4().simple().to_string().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> FsResult<()> {
        writer.write_all(&self.0)?;
        writer.flush()?;
        Ok(())
    }

    /// Read exactly `self.len()` bytes and compare them in constant time.
    pub fn verify_from<R: Read>(&self, reader: &mut R) -> FsResult<()> {
        let mut got = vec![0u8; self.0.len()];
        reader.read_exact(&mut got)?;
        let diff = got.iter().zip(&self.0).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        got.zeroize();
        if diff != 0 {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }
}

impl From<String> for Nonce {
    fn from(s: String) -> Self {
        Nonce(s.into_bytes())
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce([REDACTED])")
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
