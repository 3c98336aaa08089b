//! Reassembly of stored files from their register segments, and safe
//! placement of the result under an output root.
//!
//! # Segment rules
//! - One segment: the prefix stands in for bytes that the stored length
//!   counts but the data file does not hold, so `length - prefix.len()`
//!   bytes are read and appended to the prefix.
//! - Several segments: each range is read in full and the reads are joined
//!   with the prefix of the **last** segment as separator.  Archives in the
//!   wild depend on this exact rule, so it is kept as-is.
//!
//! A segment that cannot be read in full does not lose the entry: whatever
//! was assembled up to that point travels in the [`ExtractError`].
//!
//! # Placement
//! Entry paths come from untrusted archives.  Empty paths, paths leaving
//! the output root and paths that name an existing directory are written to
//! a random `<uuid>.rpakit-bad` file in the root instead of being dropped.
//! So are the partial bytes of unreadable entries.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::register::Segment;

/// Extension marking entries that could not be written under their own name.
pub const BAD_ENTRY_EXTENSION: &str = "rpakit-bad";

// ── Reassembly ──────────────────────────────────────────────────────────────

/// An entry whose segments could not be read in full.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct ExtractError {
    /// Bytes assembled before the failure, prefix included.
    pub partial: Vec<u8>,
    #[source]
    pub source:  io::Error,
}

/// Read `len` bytes at `offset` into `buf`.  On a short or failed read the
/// bytes that did arrive stay in `buf`.
fn read_range<R: Read + Seek>(reader: &mut R, offset: u64, len: u64, buf: &mut Vec<u8>) -> io::Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    let start = buf.len();
    reader.by_ref().take(len).read_to_end(buf)?;
    let got = (buf.len() - start) as u64;
    if got < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("segment at {offset} wants {len} bytes, only {got} available"),
        ));
    }
    Ok(())
}

/// Rebuild the bytes of one register entry from `reader` (the data file).
pub fn extract<R: Read + Seek>(reader: &mut R, entry: &[Segment]) -> Result<Vec<u8>, ExtractError> {
    let mut out = Vec::new();
    let result = match entry {
        [] => Ok(()),
        [single] => {
            out.extend_from_slice(&single.prefix);
            match single.length.checked_sub(single.prefix.len() as u64) {
                Some(stored) => read_range(reader, single.offset, stored, &mut out),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "segment prefix is longer than its length",
                )),
            }
        }
        [.., last] => entry.iter().enumerate().try_for_each(|(n, s)| {
            if n > 0 {
                out.extend_from_slice(&last.prefix);
            }
            read_range(reader, s.offset, s.length, &mut out)
        }),
    };
    match result {
        Ok(())      => Ok(out),
        Err(source) => Err(ExtractError { partial: out, source }),
    }
}

// ── Placement ───────────────────────────────────────────────────────────────

/// Why an entry was redirected to a placeholder name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadEntry {
    EmptyPath,
    /// Absolute, drive-prefixed or `..`-escaping path.
    EscapesRoot,
    /// The target names an existing directory.
    DirectoryCollision,
    /// Writing under the real name failed.
    Unwritable,
    /// The segments could not be read in full; the placeholder holds what was read.
    Unreadable,
}

impl std::fmt::Display for BadEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BadEntry::EmptyPath          => "empty path",
            BadEntry::EscapesRoot        => "path escapes the output directory",
            BadEntry::DirectoryCollision => "path collides with a directory",
            BadEntry::Unwritable         => "path could not be written",
            BadEntry::Unreadable         => "data could not be read in full",
        })
    }
}

/// A random placeholder file name under `root`.
pub fn placeholder(root: &Path) -> PathBuf {
    root.join(format!("{}.{}", Uuid::new_v4().simple(), BAD_ENTRY_EXTENSION))
}

/// Where `entry_path` lands under `root`, or why it cannot land there.
pub fn destination(root: &Path, entry_path: &str) -> Result<PathBuf, BadEntry> {
    if entry_path.is_empty() {
        return Err(BadEntry::EmptyPath);
    }
    let rel = Path::new(entry_path);
    let escapes = rel.components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes {
        return Err(BadEntry::EscapesRoot);
    }
    let target = root.join(rel);
    if target.is_dir() {
        return Err(BadEntry::DirectoryCollision);
    }
    Ok(target)
}

/// Outcome of [`write_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub path:    PathBuf,
    /// Set when the entry was written under a placeholder name.
    pub renamed: Option<BadEntry>,
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)
}

/// Write `data` for `entry_path` of `depot` under `root`, falling back to a
/// placeholder name when the real one is unusable.
pub fn write_entry(root: &Path, depot: &Path, entry_path: &str, data: &[u8]) -> io::Result<Written> {
    let reason = match destination(root, entry_path) {
        Ok(target) => match write_file(&target, data) {
            Ok(()) => return Ok(Written { path: target, renamed: None }),
            Err(e) => {
                tracing::warn!(
                    depot = %depot.display(),
                    entry = entry_path,
                    error = %e,
                    "write failed, retrying under a placeholder"
                );
                BadEntry::Unwritable
            }
        },
        Err(reason) => reason,
    };
    write_placeholder(root, depot, entry_path, data, reason)
}

/// Write `data` under a fresh placeholder name in `root`.
pub fn write_placeholder(
    root:       &Path,
    depot:      &Path,
    entry_path: &str,
    data:       &[u8],
    reason:     BadEntry,
) -> io::Result<Written> {
    let path = placeholder(root);
    tracing::warn!(
        depot = %depot.display(),
        entry = entry_path,
        %reason,
        placeholder = %path.display(),
        "bad entry renamed"
    );
    write_file(&path, data)?;
    Ok(Written { path, renamed: Some(reason) })
}
