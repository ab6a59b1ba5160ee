//! Per-domain report buffering and archive rotation.
//!
//! Each whitelisted domain owns one [`DomainAggregator`]. Reports are
//! appended to a zip container held in memory; when the buffered count
//! reaches the per-archive maximum (or an operator or the daily scheduler
//! asks for it) the container is finalized and written to a new archive
//! file, and a fresh container takes its place.
//!
//! All state sits behind one non-reentrant mutex. `append` releases it before
//! triggering a flush, which takes it again, so rotation never runs inside
//! the append critical section.
//!
//! If the archive write fails the finalized bytes are kept as a sealed
//! archive and retried on the next flush. The open container is always
//! replaced before the old one is finalized, so the domain stays writable
//! whatever happens on disk. The threshold only looks at the open container:
//! sealed archives waiting on the disk never cause another rotation, so an
//! outage still produces one archive per `max_reports` reports.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Local};
use tracing::{debug, error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::archive::{write_new_archive, ArchiveError};

/// A domain that has not flushed for this long is flushed by the daily tick.
pub const STALE_FLUSH_AFTER_DAYS: i64 = 30;

type Container = ZipWriter<Cursor<Vec<u8>>>;

/// Source of the current local time.
///
/// Archive names and the staleness check depend on the calendar date, so
/// tests substitute a [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a flush.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// Archives were written, oldest first
    Written(Vec<PathBuf>),

    /// Some archives were written before a write failed; the rest stay
    /// sealed in memory for the next flush
    Partial {
        written: Vec<PathBuf>,
        pending: usize,
    },

    /// Nothing was buffered, nothing touched disk
    Empty,
}

/// A finalized archive that has not reached disk yet.
struct SealedArchive {
    bytes: Vec<u8>,
    reports: u64,
}

struct AggregatorState {
    container: Container,
    /// Reports in the open container
    open: u64,
    /// Finalized archives waiting for a successful write
    sealed: Vec<SealedArchive>,
    /// Next candidate sequence number for today's archive names
    sequence: u32,
    last_flush: DateTime<Local>,
}

impl AggregatorState {
    /// Reports buffered since the last successful flush.
    fn count(&self) -> u64 {
        self.open + self.sealed.iter().map(|s| s.reports).sum::<u64>()
    }
}

/// In-memory buffer and rotation state for one whitelisted domain.
pub struct DomainAggregator {
    name: String,
    entry_name: String,
    archive_dir: PathBuf,
    max_reports: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<AggregatorState>,
}

impl std::fmt::Debug for DomainAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainAggregator")
            .field("name", &self.name)
            .field("archive_dir", &self.archive_dir)
            .field("max_reports", &self.max_reports)
            .finish_non_exhaustive()
    }
}

impl DomainAggregator {
    /// Create the aggregator for `name` with an empty container.
    ///
    /// `max_reports` is clamped to at least 1.
    pub fn new(
        name: impl Into<String>,
        archive_dir: impl Into<PathBuf>,
        max_reports: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ArchiveError> {
        let name = name.into();
        let entry_name = format!("{}.txt", name);
        let container = new_container(&entry_name)?;
        let last_flush = clock.now();

        Ok(Self {
            name,
            entry_name,
            archive_dir: archive_dir.into(),
            max_reports: max_reports.max(1),
            clock,
            state: Mutex::new(AggregatorState {
                container,
                open: 0,
                sealed: Vec::new(),
                sequence: 0,
                last_flush,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Buffer one raw report, flushing once the open container holds the
    /// per-archive maximum.
    ///
    /// Never fails from the caller's point of view: buffering and rotation
    /// errors are logged.
    pub fn append(&self, report: &[u8]) {
        let should_flush = {
            let mut state = self.lock();

            let container = &mut state.container;
            let written = container
                .write_all(report)
                .and_then(|()| container.write_all(b"\n"));
            if let Err(e) = written {
                error!(
                    domain = %self.name,
                    error = %ArchiveError::Buffer(e),
                    "Failed to buffer report"
                );
                return;
            }

            state.open += 1;
            state.open >= self.max_reports
        };

        if should_flush {
            debug!(domain = %self.name, "Flushing: report threshold reached");
            if let Err(e) = self.flush() {
                error!(domain = %self.name, error = %e, "Threshold flush failed");
            }
        }
    }

    /// Reports buffered since the last successful flush.
    pub fn count(&self) -> u64 {
        self.lock().count()
    }

    /// Next candidate sequence number for today's archive names.
    pub fn sequence(&self) -> u32 {
        self.lock().sequence
    }

    /// Time of the last flush that wrote at least one archive.
    pub fn last_flush(&self) -> DateTime<Local> {
        self.lock().last_flush
    }

    /// Persist everything buffered to new archive files.
    ///
    /// A no-op returning [`FlushResult::Empty`] when nothing is buffered.
    pub fn flush(&self) -> Result<FlushResult, ArchiveError> {
        let now = self.clock.now();
        let mut state = self.lock();
        self.flush_locked(&mut state, now)
    }

    /// Daily maintenance: restart archive numbering for the new day and force
    /// a flush when the domain has not flushed for [`STALE_FLUSH_AFTER_DAYS`].
    pub fn daily_tick(&self) {
        let now = self.clock.now();
        let mut state = self.lock();

        state.sequence = 0;

        if now - state.last_flush > Duration::days(STALE_FLUSH_AFTER_DAYS) {
            info!(
                domain = %self.name,
                last_flush = %state.last_flush,
                buffered = state.count(),
                "Flushing stale domain"
            );
            if let Err(e) = self.flush_locked(&mut state, now) {
                error!(domain = %self.name, error = %e, "Stale flush failed");
            }
        }
    }

    fn flush_locked(
        &self,
        state: &mut AggregatorState,
        now: DateTime<Local>,
    ) -> Result<FlushResult, ArchiveError> {
        if state.count() == 0 {
            return Ok(FlushResult::Empty);
        }

        let mut lost = None;
        if state.open > 0 {
            // Swap in the replacement first; a domain must never be left
            // without a writable container.
            let fresh = new_container(&self.entry_name)?;
            let finished = std::mem::replace(&mut state.container, fresh);
            let reports = std::mem::take(&mut state.open);

            match finished.finish() {
                Ok(cursor) => state.sealed.push(SealedArchive {
                    bytes: cursor.into_inner(),
                    reports,
                }),
                Err(e) => {
                    error!(
                        domain = %self.name,
                        lost_reports = reports,
                        error = %e,
                        "Failed to finalize archive, buffered reports dropped"
                    );
                    lost = Some(ArchiveError::from(e));
                }
            }
        }

        let date = now.date_naive();
        let mut written = Vec::new();
        while let Some(archive) = state.sealed.first() {
            let path = write_new_archive(
                &self.archive_dir,
                &self.name,
                date,
                &mut state.sequence,
                &archive.bytes,
            );
            match path {
                Ok(path) => {
                    info!(
                        domain = %self.name,
                        reports = archive.reports,
                        path = %path.display(),
                        "Archive written"
                    );
                    state.sealed.remove(0);
                    written.push(path);
                }
                Err(e) if written.is_empty() => {
                    warn!(
                        domain = %self.name,
                        pending_archives = state.sealed.len(),
                        "Archive write failed, keeping sealed archives for the next flush"
                    );
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        domain = %self.name,
                        written = written.len(),
                        pending_archives = state.sealed.len(),
                        error = %e,
                        "Flush stopped partway, keeping sealed archives for the next flush"
                    );
                    state.last_flush = now;
                    return Ok(FlushResult::Partial {
                        written,
                        pending: state.sealed.len(),
                    });
                }
            }
        }

        match lost {
            Some(e) if written.is_empty() => Err(e),
            _ => {
                state.last_flush = now;
                Ok(FlushResult::Written(written))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A new in-memory zip with a single open text entry.
fn new_container(entry_name: &str) -> Result<Container, ArchiveError> {
    let mut container = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    container.start_file(entry_name, options)?;
    Ok(container)
}
