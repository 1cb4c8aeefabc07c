//! Result archiving.
//!
//! After a run, the session directory `<work_dir>/<session_label>` is
//! packaged into the output directory:
//! - `<session_label>_output_manifest.txt`: size-annotated tree listing
//! - `<session_label>.zip`: the directory's recursive contents, stored
//!   relative to `work_dir`
//!
//! A missing session directory is not an error; nothing is written.

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to walk session directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("failed to write zip: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// What an archiving pass produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub zip_path: PathBuf,
    pub manifest_path: PathBuf,
    pub directories: usize,
    pub files: usize,
    /// SHA-256 of the zip file, hex encoded.
    pub sha256: String,
}

/// Manifest path: `<output_dir>/<session_label>_output_manifest.txt`.
pub fn manifest_path(output_dir: &Path, session_label: &str) -> PathBuf {
    output_dir.join(format!("{session_label}_output_manifest.txt"))
}

/// Archive path: `<output_dir>/<session_label>.zip`.
pub fn zip_path(output_dir: &Path, session_label: &str) -> PathBuf {
    output_dir.join(format!("{session_label}.zip"))
}

/// Packages a session directory into the output directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultArchiver;

impl ResultArchiver {
    pub fn new() -> Self {
        Self
    }

    /// Write the manifest and zip for `<work_dir>/<session_label>`.
    ///
    /// Returns `Ok(None)` when the session directory does not exist.
    pub fn archive(
        &self,
        work_dir: &Path,
        session_label: &str,
        output_dir: &Path,
    ) -> Result<Option<ArchiveReport>> {
        let session_path = work_dir.join(session_label);
        if !session_path.is_dir() {
            info!(
                session_path = %session_path.display(),
                "no results directory to zip"
            );
            return Ok(None);
        }

        let manifest = manifest_path(output_dir, session_label);
        // Nested labels (`sub_01/ses_02`) put both files in a subdirectory.
        if let Some(parent) = manifest.parent() {
            fs::create_dir_all(parent)?;
        }
        let (directories, files) = write_manifest(&session_path, session_label, &manifest)?;

        let zip = zip_path(output_dir, session_label);
        info!(
            session_label,
            zip_path = %zip.display(),
            "zipping session directory"
        );
        write_zip(work_dir, &session_path, &zip)?;
        let sha256 = compute_checksum(&zip)?;

        info!(
            zip_path = %zip.display(),
            manifest_path = %manifest.display(),
            directories,
            files,
            sha256 = %sha256,
            "session output archived"
        );

        Ok(Some(ArchiveReport {
            zip_path: zip,
            manifest_path: manifest,
            directories,
            files,
            sha256,
        }))
    }
}

/// Human-readable size in the style of `tree -h`: `812`, `4.0K`, `1.2M`.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["K", "M", "G", "T", "P", "E"];
    if bytes < 1024 {
        return bytes.to_string();
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if size < 10.0 {
        format!("{size:.1}{}", UNITS[unit])
    } else {
        format!("{size:.0}{}", UNITS[unit])
    }
}

fn format_mtime(modified: io::Result<SystemTime>) -> String {
    modified.map_or_else(
        |_| "????-??-?? ??:??".to_string(),
        |time| DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M").to_string(),
    )
}

/// Write the tree listing; returns (directories, files) counted below the root.
fn write_manifest(session_path: &Path, session_label: &str, manifest: &Path) -> Result<(usize, usize)> {
    let mut out = BufWriter::new(fs::File::create(manifest)?);
    writeln!(out, "{session_label}/")?;

    let mut directories = 0;
    let mut files = 0;

    for entry in WalkDir::new(session_path).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let indent = "    ".repeat(entry.depth());
        let name = entry.file_name().to_string_lossy();
        let suffix = if metadata.is_dir() {
            "/".to_string()
        } else if entry.path_is_symlink() {
            format!(" -> {}", fs::read_link(entry.path())?.display())
        } else {
            String::new()
        };

        writeln!(
            out,
            "{indent}[{:>5} {}]  {name}{suffix}",
            human_size(metadata.len()),
            format_mtime(metadata.modified()),
        )?;

        if metadata.is_dir() {
            directories += 1;
        } else {
            files += 1;
        }
    }

    writeln!(out)?;
    writeln!(out, "{directories} directories, {files} files")?;
    out.flush()?;
    Ok((directories, files))
}

fn zip_time(modified: io::Result<SystemTime>) -> Option<zip::DateTime> {
    use chrono::{Datelike, Timelike};

    let time = DateTime::<Local>::from(modified.ok()?);
    zip::DateTime::from_date_and_time(
        u16::try_from(time.year()).ok()?,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .ok()
}

/// Zip `session_path` recursively; entry names are relative to `base`.
///
/// Symlinks are stored as links, never followed.
fn write_zip(base: &Path, session_path: &Path, dest: &Path) -> Result<()> {
    let mut zip = ZipWriter::new(BufWriter::new(fs::File::create(dest)?));

    for entry in WalkDir::new(session_path).sort_by_file_name() {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let rel = entry.path().strip_prefix(base).unwrap_or(entry.path());
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let mut options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(metadata.len() >= u64::from(u32::MAX));
        if let Some(time) = zip_time(metadata.modified()) {
            options = options.last_modified_time(time);
        }

        if entry.path_is_symlink() {
            let target = fs::read_link(entry.path())?;
            zip.add_symlink(name, target.to_string_lossy(), options)?;
        } else if metadata.is_dir() {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
            let mut file = fs::File::open(entry.path())?;
            io::copy(&mut file, &mut zip)?;
        }
    }

    let mut inner = zip.finish()?;
    inner.flush()?;
    Ok(())
}

/// Compute SHA256 checksum of file contents.
fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
