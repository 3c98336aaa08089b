//! Output staging.
//!
//! Files are never written straight into the destination.  A run writes into
//! a hidden directory created beside it and [`Staging::commit`] renames that
//! directory into place at the end, so an aborted run leaves no half-filled
//! output behind.  Simulation writes into a system temp directory that is
//! dropped on commit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::pipeline::RunError;

const STAGING_PREFIX: &str = ".rpakit-staging-";

/// Where a staged run ends up.
#[derive(Debug)]
enum Target {
    Destination(PathBuf),
    /// Throw-away output of a simulation.
    Discard,
}

/// A temporary output root that is either renamed into place or dropped.
#[derive(Debug)]
pub struct Staging {
    dir:    TempDir,
    target: Target,
}

/// `true` if `path` exists and is anything but an empty directory.
pub fn is_occupied(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(_) if path.exists() => Ok(true),
        Err(e) => Err(e),
    }
}

impl Staging {
    /// Stage output for `destination`.  Refuses a destination that already
    /// holds anything.
    pub fn for_destination(destination: &Path) -> Result<Self, RunError> {
        let staging_err = |source| RunError::Staging { path: destination.to_path_buf(), source };

        if is_occupied(destination).map_err(staging_err)? {
            return Err(RunError::DestinationNotEmpty(destination.to_path_buf()));
        }
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(staging_err)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&parent)
            .map_err(staging_err)?;

        tracing::debug!(staging = %dir.path().display(), "staging area created");
        Ok(Self { dir, target: Target::Destination(destination.to_path_buf()) })
    }

    /// Stage output that is thrown away on commit.
    pub fn scratch() -> Result<Self, RunError> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir()
            .map_err(|source| RunError::Staging { path: std::env::temp_dir(), source })?;
        tracing::debug!(staging = %dir.path().display(), "simulation area created");
        Ok(Self { dir, target: Target::Discard })
    }

    /// Root the run writes into.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    fn is_empty(&self) -> Result<bool, RunError> {
        is_occupied(self.root())
            .map(|occupied| !occupied)
            .map_err(|source| RunError::Cleanup { path: self.root().to_path_buf(), source })
    }

    /// Move staged output into the destination.  Returns the destination
    /// when something was committed, `None` when the output was dropped
    /// (simulation, or nothing written).
    pub fn commit(self) -> Result<Option<PathBuf>, RunError> {
        let destination = match &self.target {
            Target::Destination(d) => Some(d.clone()),
            Target::Discard        => None,
        };
        let Some(destination) = destination else {
            self.discard()?;
            return Ok(None);
        };
        if self.is_empty()? {
            tracing::info!("nothing was written; destination left untouched");
            self.discard()?;
            return Ok(None);
        }

        // An empty directory may have appeared or been there from the start.
        if destination.is_dir() {
            fs::remove_dir(&destination)
                .map_err(|source| RunError::Commit { path: destination.clone(), source })?;
        }
        fs::rename(self.dir.path(), &destination)
            .map_err(|source| RunError::Commit { path: destination.clone(), source })?;
        tracing::debug!(destination = %destination.display(), "staged output committed");
        // The staging path no longer exists; dropping `dir` is a no-op.
        Ok(Some(destination))
    }

    /// Remove the staging area and everything in it.
    pub fn discard(self) -> Result<(), RunError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|source| RunError::Cleanup { path, source })
    }
}
