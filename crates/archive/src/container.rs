//! Archive container formats: writing, extracting and integrity checks.

use crate::ArchiveFormat;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use osmigrate_core::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub file_count: usize,
    pub skipped_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integrity {
    Good,
    Corrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveVerification {
    pub path: PathBuf,
    pub format: ArchiveFormat,
    pub file_count: usize,
    pub integrity: Integrity,
    pub detail: Option<String>,
}

enum ArchiveWriter {
    Zip(ZipWriter<BufWriter<File>>),
    TarGz(tar::Builder<GzEncoder<BufWriter<File>>>),
}

impl ArchiveWriter {
    fn create(format: ArchiveFormat, path: &Path) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(match format {
            ArchiveFormat::Zip => ArchiveWriter::Zip(ZipWriter::new(file)),
            ArchiveFormat::TarGz => {
                let encoder = GzEncoder::new(file, Compression::default());
                ArchiveWriter::TarGz(tar::Builder::new(encoder))
            }
        })
    }

    fn add_file(&mut self, name: &str, file: &mut File) -> Result<()> {
        match self {
            ArchiveWriter::Zip(writer) => {
                let size = file.metadata()?.len();
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .large_file(size >= ZIP64_THRESHOLD);
                writer.start_file(name, options).map_err(zip_error)?;
                io::copy(file, writer)?;
            }
            ArchiveWriter::TarGz(builder) => builder.append_file(name, file)?,
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self {
            ArchiveWriter::Zip(writer) => {
                let mut file = writer.finish().map_err(zip_error)?;
                io::Write::flush(&mut file)?;
            }
            ArchiveWriter::TarGz(builder) => {
                let mut file = builder.into_inner()?.finish()?;
                io::Write::flush(&mut file)?;
            }
        }
        Ok(())
    }
}

/// Archives every existing item under `<item basename>/<relative path>`.
///
/// Missing items are skipped. Files or directories that cannot be read because of
/// permissions are counted in `skipped_files`; any other error aborts the archive.
pub fn write_archive(format: ArchiveFormat, items: &[PathBuf], destination: &Path) -> Result<ArchiveSummary> {
    let mut writer = ArchiveWriter::create(format, destination)?;
    let mut summary = ArchiveSummary::default();

    for item in items {
        if !item.exists() {
            debug!(item = %item.display(), "backup item does not exist, skipping");
            continue;
        }
        let base = item
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| MigrateError::validation(format!("backup item has no name: {}", item.display())))?;

        for entry in WalkDir::new(item) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) if is_permission_denied(error.io_error()) => {
                    warn!(%error, "permission denied, skipping");
                    summary.skipped_files += 1;
                    continue;
                }
                Err(error) => return Err(MigrateError::Io(error.into())),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let mut file = match File::open(entry.path()) {
                Ok(file) => file,
                Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(path = %entry.path().display(), "permission denied, skipping");
                    summary.skipped_files += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            let name = arc_name(&base, item, entry.path());
            writer.add_file(&name, &mut file)?;
            summary.file_count += 1;
        }
    }

    writer.finish()?;
    Ok(summary)
}

fn arc_name(base: &str, item: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(item).unwrap_or(path);
    let mut name = base.to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

pub fn extract_archive(format: ArchiveFormat, archive: &Path, destination: &Path) -> Result<()> {
    let file = BufReader::new(File::open(archive)?);
    match format {
        ArchiveFormat::Zip => {
            let mut zip = ZipArchive::new(file).map_err(zip_error)?;
            zip.extract(destination).map_err(zip_error)?;
        }
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(GzDecoder::new(file));
            tar.unpack(destination)?;
        }
    }
    debug!(archive = %archive.display(), destination = %destination.display(), "archive extracted");
    Ok(())
}

/// Reads every entry to the end so the container checksums are exercised for both
/// formats. A damaged archive is reported as `Corrupted`, not as an error.
pub fn verify_archive(archive: impl AsRef<Path>) -> Result<ArchiveVerification> {
    let archive = archive.as_ref();
    let format = ArchiveFormat::from_path(archive)
        .ok_or_else(|| MigrateError::validation(crate::ERR_INVALID_FORMAT))?;
    if !archive.is_file() {
        return Err(MigrateError::not_found(crate::ERR_MISSING_ARCHIVE));
    }
    let file = BufReader::new(File::open(archive)?);
    let (file_count, detail) = match format {
        ArchiveFormat::Zip => scan_zip(file),
        ArchiveFormat::TarGz => scan_tar_gz(file),
    };
    let integrity = if detail.is_some() {
        Integrity::Corrupted
    } else {
        Integrity::Good
    };
    if let Some(detail) = &detail {
        warn!(archive = %archive.display(), %detail, "archive failed integrity check");
    }
    Ok(ArchiveVerification {
        path: archive.to_path_buf(),
        format,
        file_count,
        integrity,
        detail,
    })
}

fn scan_zip(file: BufReader<File>) -> (usize, Option<String>) {
    let mut zip = match ZipArchive::new(file) {
        Ok(zip) => zip,
        Err(error) => return (0, Some(error.to_string())),
    };
    let mut count = 0;
    for index in 0..zip.len() {
        let mut entry = match zip.by_index(index) {
            Ok(entry) => entry,
            Err(error) => return (count, Some(error.to_string())),
        };
        if entry.is_file() {
            count += 1;
        }
        if let Err(error) = io::copy(&mut entry, &mut io::sink()) {
            return (count, Some(format!("{}: {}", entry.name(), error)));
        }
    }
    (count, None)
}

fn scan_tar_gz(file: BufReader<File>) -> (usize, Option<String>) {
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut count = 0;
    let entries = match tar.entries() {
        Ok(entries) => entries,
        Err(error) => return (0, Some(error.to_string())),
    };
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(error) => return (count, Some(error.to_string())),
        };
        if entry.header().entry_type().is_file() {
            count += 1;
        }
        if let Err(error) = io::copy(&mut entry, &mut io::sink()) {
            return (count, Some(error.to_string()));
        }
    }
    // The gzip trailer CRC is only checked once the stream is read to its end.
    let mut rest = tar.into_inner();
    if let Err(error) = io::copy(&mut rest, &mut io::sink()) {
        return (count, Some(error.to_string()));
    }
    (count, None)
}

fn is_permission_denied(error: Option<&io::Error>) -> bool {
    error
        .map(|error| error.kind() == io::ErrorKind::PermissionDenied)
        .unwrap_or(false)
}

fn zip_error(error: ZipError) -> MigrateError {
    match error {
        ZipError::Io(error) => MigrateError::Io(error),
        other => MigrateError::Parse(format!("zip archive: {}", other)),
    }
}
