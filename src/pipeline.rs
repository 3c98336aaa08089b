//! Per-depot processing and the run driver.
//!
//! # Depot lifecycle
//!
//! ```text
//! Init → HeaderRead → VersionOk → CipherResolved → RegisterDecoded → Ready
//!            │                                                        │
//!            └→ Skipped                          Extracted | Listed | Tested
//! ```
//!
//! A detection verdict (no magic, ambiguous, unsupported) skips the depot.
//! Anything that goes wrong after the dialect is known is a [`DepotError`]:
//! the depot is reported as `Failed` and the run moves on.  Only staging
//! problems abort a whole run ([`RunError`]).
//!
//! Every depot is processed from a fresh [`DepotState`]; the only value
//! carried across depots is the [`RunReport`] being filled in.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::cipher::{self, CipherError, ResolvedCipher};
use crate::depot::{self, Depot};
use crate::extract::{self, BadEntry};
use crate::format::{FormatDescriptor, FormatId};
use crate::register::{self, DecodeError, Register};
use crate::staging::Staging;
use crate::version::{self, DetectionOutcome};

/// Output directory name used when none is given.
pub const DEFAULT_OUTPUT_DIR: &str = "rpakit_out";

/// Bytes of an unreadable header shown in the skip log.
const HEADER_PREVIEW: usize = 16;

// ── Errors ──────────────────────────────────────────────────────────────────

/// A depot that was recognised but could not be processed.
#[derive(Error, Debug)]
pub enum DepotError {
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("{}: {source}", .path.display())]
    Cipher { path: PathBuf, #[source] source: CipherError },
    #[error("{}: {source}", .path.display())]
    Decode { path: PathBuf, #[source] source: DecodeError },
}

impl DepotError {
    pub fn path(&self) -> &Path {
        match self {
            DepotError::Io { path, .. }
            | DepotError::Cipher { path, .. }
            | DepotError::Decode { path, .. } => path,
        }
    }
}

/// Failures that end the whole run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("cannot search {}: {source}", .path.display())]
    Discover { path: PathBuf, #[source] source: io::Error },
    #[error("destination {} exists and is not empty", .0.display())]
    DestinationNotEmpty(PathBuf),
    #[error("cannot stage output for {}: {source}", .path.display())]
    Staging { path: PathBuf, #[source] source: io::Error },
    #[error("cannot move staged output into {}: {source}", .path.display())]
    Commit { path: PathBuf, #[source] source: io::Error },
    #[error("cannot remove staging area {}: {source}", .path.display())]
    Cleanup { path: PathBuf, #[source] source: io::Error },
}

// ── Options ─────────────────────────────────────────────────────────────────

/// What to do with every depot of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Extract,
    List,
    Test,
    /// Full extraction into a directory that is thrown away.
    Simulate,
}

impl Task {
    pub fn writes_files(self) -> bool {
        matches!(self, Task::Extract | Task::Simulate)
    }
}

/// Run configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub task:        Task,
    /// Output root.  `None` means `<input dir>/rpakit_out`.
    pub destination: Option<PathBuf>,
    /// Print the run report as JSON.
    pub json:        bool,
}

impl Options {
    /// Output root for a run over `target`.
    pub fn destination_for(&self, target: &Path) -> PathBuf {
        if let Some(dest) = &self.destination {
            return dest.clone();
        }
        let base = if target.is_dir() {
            target
        } else {
            target
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
        };
        base.join(DEFAULT_OUTPUT_DIR)
    }
}

// ── DepotState ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DepotLifecycle {
    Init,
    HeaderRead,
    VersionOk,
    CipherResolved,
    RegisterDecoded,
    Ready,
    Skipped,
    Extracted,
    Listed,
    Tested,
    Failed,
}

impl DepotLifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DepotLifecycle::Skipped
                | DepotLifecycle::Extracted
                | DepotLifecycle::Listed
                | DepotLifecycle::Tested
                | DepotLifecycle::Failed
        )
    }
}

/// A depot whose register is decoded and ready for a task.
#[derive(Debug)]
pub struct DepotState {
    pub depot:    Depot,
    pub header:   Vec<u8>,
    /// Final dialect, after any reversed-key relabeling.
    pub format:   FormatDescriptor,
    pub cipher:   ResolvedCipher,
    pub register: Register,
    lifecycle:    DepotLifecycle,
}

/// Result of [`prepare`].
#[derive(Debug)]
pub enum Prepared {
    Skipped { depot: Depot, outcome: DetectionOutcome },
    Ready(DepotState),
}

/// Per-entry counts of one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTally {
    pub written:   usize,
    /// Written under a placeholder name; also counted in `written`.
    pub renamed:   usize,
    /// Read short and written partially under a placeholder; also counted
    /// in `renamed`.
    pub truncated: usize,
    /// Nothing could be written.
    pub failed:    usize,
}

/// Read the first header line, newline included.
pub fn read_header<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    Ok(line)
}

fn step(path: &Path, lifecycle: &mut DepotLifecycle, next: DepotLifecycle) {
    tracing::trace!(depot = %path.display(), from = ?*lifecycle, to = ?next, "depot state");
    *lifecycle = next;
}

fn header_preview(header: &[u8]) -> String {
    match std::str::from_utf8(header) {
        Ok(text) => text.trim_end().to_owned(),
        Err(_)   => format!("0x{}", hex::encode(&header[..header.len().min(HEADER_PREVIEW)])),
    }
}

/// Drive `depot` from `Init` to `Ready`, or to `Skipped` when its dialect
/// cannot be processed.
pub fn prepare(depot: Depot) -> Result<Prepared, DepotError> {
    let path = depot.path().to_path_buf();
    let io_err = |source| DepotError::Io { path: path.clone(), source };
    let mut lifecycle = DepotLifecycle::Init;

    let mut index = BufReader::new(File::open(&path).map_err(io_err)?);
    let header = read_header(&mut index).map_err(io_err)?;
    step(&path, &mut lifecycle, DepotLifecycle::HeaderRead);

    let format = match version::resolve(&header, &depot.index.suffix) {
        Ok(format) => format,
        Err(outcome) => {
            let preview = header_preview(&header);
            match outcome {
                DetectionOutcome::UnsupportedFormat(_) => {
                    tracing::warn!(depot = %path.display(), header = %preview, "skipped: {outcome}")
                }
                _ => tracing::info!(depot = %path.display(), header = %preview, "skipped: {outcome}"),
            }
            return Ok(Prepared::Skipped { depot, outcome });
        }
    };
    step(&path, &mut lifecycle, DepotLifecycle::VersionOk);
    if format.is_official() {
        tracing::debug!(depot = %path.display(), format = format.description, "official archive");
    } else {
        tracing::debug!(depot = %path.display(), format = format.description, alias = ?format.alias, "unofficial archive");
    }

    let cipher = cipher::resolve(format, &header)
        .map_err(|source| DepotError::Cipher { path: path.clone(), source })?;
    step(&path, &mut lifecycle, DepotLifecycle::CipherResolved);
    tracing::debug!(
        depot = %path.display(),
        format = %cipher.format.id,
        offset = cipher.offset,
        key = ?cipher.key.map(|k| format!("{k:#x}")),
        "cipher resolved"
    );

    let register = register::decode(&mut index, cipher.offset, cipher.key)
        .map_err(|source| DepotError::Decode { path: path.clone(), source })?;
    step(&path, &mut lifecycle, DepotLifecycle::RegisterDecoded);

    tracing::info!(
        depot = %path.display(),
        format = cipher.format.description,
        entries = register.len(),
        "register decoded"
    );
    step(&path, &mut lifecycle, DepotLifecycle::Ready);

    Ok(Prepared::Ready(DepotState {
        depot,
        header,
        format: cipher.format,
        cipher,
        register,
        lifecycle,
    }))
}

impl DepotState {
    pub fn lifecycle(&self) -> DepotLifecycle {
        self.lifecycle
    }

    /// Stored paths, sorted.
    pub fn listing(&mut self) -> Vec<String> {
        self.lifecycle = DepotLifecycle::Listed;
        self.register.paths().map(str::to_owned).collect()
    }

    /// The identified dialect.
    pub fn test(&mut self) -> FormatDescriptor {
        self.lifecycle = DepotLifecycle::Tested;
        self.format
    }

    /// Write every entry under `root`.  Entries that cannot be read in full
    /// keep their partial bytes under a placeholder name; only a data file
    /// that cannot be opened fails the depot.
    pub fn extract_to(&mut self, root: &Path) -> Result<EntryTally, DepotError> {
        let depot = self.depot.path();
        let data_path = &self.depot.data;
        let file = File::open(data_path)
            .map_err(|source| DepotError::Io { path: data_path.clone(), source })?;
        let mut data = BufReader::new(file);

        let total = self.register.len();
        let mut tally = EntryTally::default();
        for (n, (entry, segments)) in self.register.iter().enumerate() {
            tracing::debug!("[{}/{}] {}", n + 1, total, entry);
            let outcome = match extract::extract(&mut data, segments) {
                Ok(bytes) => extract::write_entry(root, depot, entry, &bytes),
                Err(e) => {
                    tracing::warn!(
                        depot = %depot.display(),
                        data = %data_path.display(),
                        entry,
                        error = %e,
                        "entry could not be read in full"
                    );
                    tally.truncated += 1;
                    extract::write_placeholder(root, depot, entry, &e.partial, BadEntry::Unreadable)
                }
            };
            match outcome {
                Ok(written) => {
                    tally.written += 1;
                    if written.renamed.is_some() {
                        tally.renamed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(depot = %depot.display(), entry, error = %e, "entry could not be written");
                    tally.failed += 1;
                }
            }
        }
        self.lifecycle = DepotLifecycle::Extracted;
        Ok(tally)
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Outcome of one depot.
#[derive(Debug, Clone, Serialize)]
pub struct DepotReport {
    pub path:           PathBuf,
    pub format:         Option<FormatId>,
    pub alias:          Option<&'static str>,
    pub description:    Option<&'static str>,
    pub lifecycle:      DepotLifecycle,
    pub entries:        usize,
    pub written:        usize,
    pub renamed:        usize,
    pub truncated:      usize,
    pub failed_entries: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listing:        Vec<String>,
    /// Skip reason or error text.
    pub message:        Option<String>,
}

impl DepotReport {
    fn new(path: &Path) -> Self {
        Self {
            path:           path.to_path_buf(),
            format:         None,
            alias:          None,
            description:    None,
            lifecycle:      DepotLifecycle::Init,
            entries:        0,
            written:        0,
            renamed:        0,
            truncated:      0,
            failed_entries: 0,
            listing:        Vec::new(),
            message:        None,
        }
    }

    fn identify(&mut self, format: FormatDescriptor) {
        self.format = Some(format.id);
        self.alias = format.alias;
        self.description = Some(format.description);
    }

    fn fail(mut self, err: DepotError) -> Self {
        tracing::error!(depot = %err.path().display(), "{err}");
        self.lifecycle = DepotLifecycle::Failed;
        self.message = Some(err.to_string());
        self
    }
}

/// Totals of a run plus one [`DepotReport`] per depot.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task:    Task,
    pub found:   usize,
    pub done:    usize,
    pub skipped: usize,
    pub failed:  usize,
    /// Files written across all depots.
    pub files:   usize,
    /// Where output was committed, if anywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub depots:  Vec<DepotReport>,
}

impl RunReport {
    fn new(task: Task, found: usize) -> Self {
        Self {
            task,
            found,
            done: 0,
            skipped: 0,
            failed: 0,
            files: 0,
            destination: None,
            depots: Vec::with_capacity(found),
        }
    }

    fn record(&mut self, depot: DepotReport) {
        match depot.lifecycle {
            DepotLifecycle::Skipped => self.skipped += 1,
            DepotLifecycle::Failed  => self.failed += 1,
            _                       => self.done += 1,
        }
        self.files += depot.written;
        self.depots.push(depot);
    }

    /// Percentage of found depots processed so far.
    pub fn progress_pct(&self) -> f64 {
        if self.found == 0 { return 100.0; }
        self.depots.len() as f64 / self.found as f64 * 100.0
    }

    /// Summary line for display.
    pub fn summary(&self) -> String {
        format!(
            "{} depot(s) found: {} done, {} skipped, {} failed; {} file(s) written",
            self.found, self.done, self.skipped, self.failed, self.files,
        )
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Action<'a> {
    Extract(&'a Path),
    List,
    Test,
}

fn process(depot: Depot, action: Action<'_>) -> DepotReport {
    let mut report = DepotReport::new(depot.path());
    let mut state = match prepare(depot) {
        Ok(Prepared::Ready(state)) => state,
        Ok(Prepared::Skipped { outcome, .. }) => {
            if let DetectionOutcome::UnsupportedFormat(id) = outcome {
                report.format = Some(id);
            }
            report.lifecycle = DepotLifecycle::Skipped;
            report.message = Some(outcome.to_string());
            return report;
        }
        Err(e) => return report.fail(e),
    };

    report.identify(state.format);
    report.entries = state.register.len();
    match action {
        Action::List => report.listing = state.listing(),
        Action::Test => {
            let format = state.test();
            tracing::info!(depot = %report.path.display(), format = %format.id, alias = ?format.alias, "identified");
        }
        Action::Extract(root) => match state.extract_to(root) {
            Ok(tally) => {
                report.written = tally.written;
                report.renamed = tally.renamed;
                report.truncated = tally.truncated;
                report.failed_entries = tally.failed;
                tracing::info!(depot = %report.path.display(), files = tally.written, "unpacked");
            }
            Err(e) => return report.fail(e),
        },
    }
    report.lifecycle = state.lifecycle();
    report
}

/// Discover, pair and process every depot under `target`.
pub fn run(target: &Path, options: &Options) -> Result<RunReport, RunError> {
    let destination = options.destination_for(target);
    let candidates = depot::discover(target, Some(&destination))
        .map_err(|source| RunError::Discover { path: target.to_path_buf(), source })?;
    let depots = depot::pair_candidates(candidates);
    run_depots(depots, options.task, &destination)
}

/// Process `depots` in order.  Output of writing tasks is staged and only
/// committed to `destination` once every depot was handled.
pub fn run_depots(depots: Vec<Depot>, task: Task, destination: &Path) -> Result<RunReport, RunError> {
    let staging = match task {
        Task::Extract           => Some(Staging::for_destination(destination)?),
        Task::Simulate          => Some(Staging::scratch()?),
        Task::List | Task::Test => None,
    };
    let action = match (&staging, task) {
        (Some(staging), _) => Action::Extract(staging.root()),
        (None, Task::List) => Action::List,
        (None, _)          => Action::Test,
    };

    let mut report = RunReport::new(task, depots.len());
    if depots.is_empty() {
        tracing::warn!("no archive candidates found");
    }
    for depot in depots {
        let path = depot.path().to_path_buf();
        let depot_report = process(depot, action);
        report.record(depot_report);
        tracing::info!(
            "[{}/{} {:.0}%] {}",
            report.depots.len(),
            report.found,
            report.progress_pct(),
            path.display()
        );
    }

    if let Some(staging) = staging {
        report.destination = staging.commit()?;
    }
    tracing::info!("{}", report.summary());
    Ok(report)
}
