//! Candidate discovery and depot assembly.
//!
//! A depot is one logical archive.  Usually it is a single file, but the
//! legacy dialect splits it in two: `name.rpi` holds the register and
//! `name.rpa` holds the data.  [`pair_candidates`] merges such pairs so the
//! `.rpa` half is not processed a second time on its own.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::format::{ARCHIVE_SUFFIXES, DATA_SUFFIX, INDEX_SUFFIX};

/// One physical file on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchiveHandle {
    pub path:   PathBuf,
    /// Extension without the dot, as found on disk.
    pub suffix: String,
}

impl ArchiveHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let suffix = path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, suffix }
    }

    pub fn has_suffix(&self, suffix: &str) -> bool {
        self.suffix.eq_ignore_ascii_case(suffix)
    }

    pub fn is_archive(&self) -> bool {
        ARCHIVE_SUFFIXES.iter().any(|s| self.has_suffix(s))
    }
}

/// A logical archive: the file holding the header and register, and the
/// file the register's segments point into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Depot {
    pub index: ArchiveHandle,
    pub data:  PathBuf,
}

impl Depot {
    pub fn new(index: ArchiveHandle) -> Self {
        let data = if index.has_suffix(INDEX_SUFFIX) {
            index.path.with_extension(DATA_SUFFIX)
        } else {
            index.path.clone()
        };
        Self { index, data }
    }

    pub fn path(&self) -> &Path {
        &self.index.path
    }

    pub fn is_paired(&self) -> bool {
        self.data != self.index.path
    }
}

/// Collect archive candidates from `target`: the file itself, or every
/// archive below a directory.  Paths under `exclude` (the output directory)
/// are skipped.
pub fn discover(target: &Path, exclude: Option<&Path>) -> io::Result<Vec<ArchiveHandle>> {
    if target.is_file() {
        let handle = ArchiveHandle::new(target);
        return Ok(if handle.is_archive() { vec![handle] } else { Vec::new() });
    }
    if !target.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is neither a file nor a directory", target.display()),
        ));
    }

    let mut found = Vec::new();
    let walker = WalkDir::new(target).follow_links(false).sort_by_file_name();
    for entry in walker.into_iter().filter_entry(|e| exclude.map_or(true, |x| e.path() != x)) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let handle = ArchiveHandle::new(entry.path());
        if handle.is_archive() {
            found.push(handle);
        }
    }
    Ok(found)
}

/// Build depots from candidates, dropping every `.rpa` whose `.rpi` index
/// sibling is also a candidate.
pub fn pair_candidates(candidates: Vec<ArchiveHandle>) -> Vec<Depot> {
    let paired_data: BTreeSet<PathBuf> = candidates
        .iter()
        .filter(|h| h.has_suffix(INDEX_SUFFIX))
        .map(|h| h.path.with_extension(DATA_SUFFIX))
        .filter(|twin| candidates.iter().any(|h| &h.path == twin))
        .collect();

    candidates
        .into_iter()
        .filter(|h| {
            let drop = paired_data.contains(&h.path);
            if drop {
                tracing::debug!(data = %h.path.display(), "paired with its .rpi index");
            }
            !drop
        })
        .map(Depot::new)
        .collect()
}

/// Rewrite a Windows-style input path with forward slashes.
pub fn normalize_input(raw: &str) -> PathBuf {
    if cfg!(windows) && raw.contains('\\') {
        tracing::info!("input looks like a Windows path; using it in posix form");
        PathBuf::from(raw.replace('\\', "/"))
    } else {
        PathBuf::from(raw)
    }
}
