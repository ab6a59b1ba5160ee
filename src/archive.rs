//! Archive files on disk.
//!
//! Archives are named `<domain>_<YYYY-MM-DD>_<sequence>.zip`. Files are
//! created with `create_new`, so an existing archive is never overwritten:
//! a taken name just moves the sequence forward.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// Extension of every archive file
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Errors raised while sealing or persisting an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to write archive {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to probe archive directory {dir}: {source}")]
    Probe {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zip container error: {0}")]
    Container(#[from] zip::result::ZipError),

    #[error("failed to buffer report: {0}")]
    Buffer(#[source] io::Error),
}

/// An archive as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub file_name: String,
    pub size: String,
}

/// Filename for a domain's archive on `date` with the given sequence number.
pub fn archive_file_name(domain: &str, date: NaiveDate, sequence: u32) -> String {
    format!(
        "{}_{}_{}.{}",
        domain,
        date.format("%Y-%m-%d"),
        sequence,
        ARCHIVE_EXTENSION
    )
}

/// Write `bytes` to the first free archive name at or after `*sequence`.
///
/// On success `*sequence` is left one past the number that was used, so the
/// next call on the same day starts from a fresh candidate.
pub fn write_new_archive(
    dir: &Path,
    domain: &str,
    date: NaiveDate,
    sequence: &mut u32,
    bytes: &[u8],
) -> Result<PathBuf, ArchiveError> {
    loop {
        let path = dir.join(archive_file_name(domain, date, *sequence));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);

        match file {
            Ok(mut file) => {
                let written = file.write_all(bytes).and_then(|()| file.sync_all());
                if let Err(source) = written {
                    // Leave no truncated archive behind.
                    let _ = fs::remove_file(&path);
                    return Err(ArchiveError::Write { path, source });
                }
                *sequence += 1;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                *sequence += 1;
            }
            Err(source) => {
                let dir = dir.to_path_buf();
                return Err(if dir.is_dir() {
                    ArchiveError::Write { path, source }
                } else {
                    ArchiveError::Probe { dir, source }
                });
            }
        }
    }
}

/// List archive files in `dir` whose name starts with `prefix`, sorted by name.
pub fn list_archives(dir: &Path, prefix: &str) -> io::Result<Vec<ArchiveInfo>> {
    let mut archives = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        let is_archive = path
            .extension()
            .map(|ext| ext == ARCHIVE_EXTENSION)
            .unwrap_or(false);
        if !is_archive {
            continue;
        }

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.starts_with(prefix) {
            continue;
        }

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        archives.push(ArchiveInfo {
            file_name: file_name.to_string(),
            size: readable_size(metadata.len()),
        });
    }

    archives.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(archives)
}

/// Archives belonging to exactly `domain` (not to domains sharing its prefix).
pub fn list_domain_archives(dir: &Path, domain: &str) -> io::Result<Vec<ArchiveInfo>> {
    list_archives(dir, &format!("{}_", domain))
}

/// Human readable file size, 1024-based.
pub fn readable_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b > GB => format!("{:.1} Gb", b as f64 / GB as f64),
        b if b > MB => format!("{:.1} Mb", b as f64 / MB as f64),
        b if b > KB => format!("{:.1} kb", b as f64 / KB as f64),
        b => format!("{} bytes", b),
    }
}
