// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! cpio "newc" (SVR4, `070701`/`070702`) record decoder

use super::ArchiveError;

const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// One decoded header plus the location of its content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewcRecord {
    pub name: String,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub mtime: u64,
    pub size: u64,
    pub dev: u64,
    pub rdev: u64,
    pub data_offset: usize,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn hex_field(header: &[u8], index: usize, offset: usize) -> Result<u32, ArchiveError> {
    let start = 6 + index * 8;
    let raw = &header[start..start + 8];
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or(ArchiveError::BadField { offset: offset + start })
}

/// Decode every record up to the trailer.
pub fn parse(data: &[u8]) -> Result<Vec<NewcRecord>, ArchiveError> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    loop {
        let header = data
            .get(pos..pos + HEADER_LEN)
            .ok_or(ArchiveError::Truncated { offset: pos })?;
        if &header[..6] != b"070701" && &header[..6] != b"070702" {
            return Err(ArchiveError::BadMagic { offset: pos });
        }
        let field = |i| hex_field(header, i, pos);
        let name_size = field(11)? as usize;
        let size = field(6)? as usize;

        let name_start = pos + HEADER_LEN;
        let name_bytes = data
            .get(name_start..name_start + name_size)
            .ok_or(ArchiveError::Truncated { offset: name_start })?;
        let name_bytes = name_bytes.strip_suffix(&[0]).unwrap_or(name_bytes);
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| ArchiveError::BadName { offset: name_start })?
            .to_string();

        let data_offset = align4(name_start + name_size);
        if name == TRAILER {
            break;
        }
        if data.len() < data_offset + size {
            return Err(ArchiveError::Truncated { offset: data_offset });
        }
        records.push(NewcRecord {
            name,
            ino: field(0)?.into(),
            mode: field(1)?,
            uid: field(2)?,
            gid: field(3)?,
            nlink: field(4)?.into(),
            mtime: field(5)?.into(),
            size: size as u64,
            dev: libc::makedev(field(7)?, field(8)?),
            rdev: libc::makedev(field(9)?, field(10)?),
            data_offset,
        });
        pos = align4(data_offset + size);
    }
    Ok(records)
}
