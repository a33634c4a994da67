// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};

/// One overlay: the remote directory `remote` is mounted over `local`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub local: String,
    pub remote: String,
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local == self.remote {
            f.write_str(&self.local)
        } else {
            write!(f, "{}={}", self.local, self.remote)
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("bind: element {index} is zero length")]
    EmptyElement { index: usize },
    #[error("bind: element {index}:name in \"{element}\": zero-length remote name")]
    EmptyRemote { index: usize, element: String },
    #[error("bind: element {index}:name in \"{element}\": zero-length local name")]
    EmptyLocal { index: usize, element: String },
}

/// Parse a colon-separated list of `local[=remote]` elements.
///
/// An element without `=` binds a remote path onto the same local path.
pub fn parse_binds(list: &str) -> Result<Vec<Bind>, BindError> {
    if list.is_empty() {
        return Ok(Vec::new());
    }
    list.split(':')
        .enumerate()
        .map(|(index, element)| {
            if element.is_empty() {
                return Err(BindError::EmptyElement { index });
            }
            match element.split_once('=') {
                None => Ok(Bind { local: element.to_string(), remote: element.to_string() }),
                Some(("", _)) => Err(BindError::EmptyLocal { index, element: element.to_string() }),
                Some((_, "")) => {
                    Err(BindError::EmptyRemote { index, element: element.to_string() })
                }
                Some((local, remote)) => {
                    Ok(Bind { local: local.to_string(), remote: remote.to_string() })
                }
            }
        })
        .collect()
}
