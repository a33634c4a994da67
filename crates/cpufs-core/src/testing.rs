// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test-only utilities for cpufs
//!
//! Builds cpio newc archives in memory so tests across the workspace can
//! serve an archive without shipping binary fixtures.

/// mtime stamped on every record written by [`NewcBuilder`].
pub const SAMPLE_MTIME: u64 = 1_600_000_000;

/// In-memory newc archive writer.
#[derive(Default)]
pub struct NewcBuilder {
    buf: Vec<u8>,
    ino: u32,
}

impl NewcBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(self, name: &str) -> Self {
        self.entry(name, libc::S_IFDIR | 0o755, b"")
    }

    pub fn file(self, name: &str, content: &[u8]) -> Self {
        self.entry(name, libc::S_IFREG | 0o644, content)
    }

    pub fn symlink(self, name: &str, target: &str) -> Self {
        self.entry(name, libc::S_IFLNK | 0o777, target.as_bytes())
    }

    pub fn entry(mut self, name: &str, mode: u32, content: &[u8]) -> Self {
        self.ino += 1;
        let nlink = if mode & libc::S_IFMT == libc::S_IFDIR { 2 } else { 1 };
        self.header(self.ino, mode, nlink, name, content.len());
        self.buf.extend_from_slice(content);
        self.pad();
        self
    }

    /// Append the trailer and return the archive bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.header(0, 0, 1, "TRAILER!!!", 0);
        self.buf
    }

    fn header(&mut self, ino: u32, mode: u32, nlink: u32, name: &str, size: usize) {
        let fields = [
            ino,
            mode,
            0,
            0,
            nlink,
            SAMPLE_MTIME as u32,
            size as u32,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        ];
        self.buf.extend_from_slice(b"070701");
        for field in fields {
            self.buf.extend_from_slice(format!("{field:08x}").as_bytes());
        }
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        self.pad();
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }
}

/// `.`, `b/`, `b/c/`, `b/c/d/`, `b/c/hi` ("hi\n") and `b/c/hello`.
pub fn sample_archive() -> Vec<u8> {
    NewcBuilder::new()
        .dir(".")
        .dir("b")
        .dir("b/c")
        .dir("b/c/d")
        .file("b/c/hi", b"hi\n")
        .file("b/c/hello", b"hello\n")
        .finish()
}
