use osmigrate_core::{format_system_time, is_image_file, MigrateError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const MIN_IMAGE_SIZE: u64 = 1024 * 1024;
pub const HEADER_BLOCK_SIZE: usize = 2048;
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

pub const ERR_MISSING: &str = "File does not exist";
pub const ERR_TOO_SMALL: &str = "File too small to be valid ISO";
pub const ERR_INVALID_STRUCTURE: &str = "Invalid ISO structure";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageValidation {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub marker: HeaderMarker,
}

/// Which accepted pattern the leading block matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMarker {
    Iso9660,
    ZeroedBootArea,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub modified_utc: Option<String>,
    pub sha256: Option<String>,
    pub error: Option<String>,
}

/// Structural gate run before an image may be classified or installed.
pub fn validate_image(path: impl AsRef<Path>) -> Result<ImageValidation> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MigrateError::validation(ERR_MISSING));
    }
    let size_bytes = std::fs::metadata(path)?.len();
    if size_bytes < MIN_IMAGE_SIZE {
        return Err(MigrateError::validation(ERR_TOO_SMALL));
    }

    let mut header = vec![0u8; HEADER_BLOCK_SIZE];
    let mut file = File::open(path)?;
    let read = read_full(&mut file, &mut header)?;
    let marker = classify_header(&header[..read])
        .ok_or_else(|| MigrateError::validation(ERR_INVALID_STRUCTURE))?;

    debug!(path = %path.display(), size_bytes, ?marker, "image passed structural validation");
    Ok(ImageValidation {
        path: path.to_path_buf(),
        size_bytes,
        marker,
    })
}

/// Accepts a full leading block that starts with the ISO9660 identifier or with
/// four zero bytes. The zeroed case is a permissive heuristic for hybrid and raw images.
pub fn classify_header(header: &[u8]) -> Option<HeaderMarker> {
    if header.len() < HEADER_BLOCK_SIZE {
        return None;
    }
    if &header[0..5] == b"CD001" {
        return Some(HeaderMarker::Iso9660);
    }
    if header[0..4] == [0u8; 4] {
        return Some(HeaderMarker::ZeroedBootArea);
    }
    None
}

/// Recursively lists image files under `directory`. A missing directory yields nothing;
/// unreadable files are reported with `error` set instead of aborting the scan.
pub fn scan_directory(directory: impl AsRef<Path>) -> Vec<ImageInfo> {
    let directory = directory.as_ref();
    if !directory.exists() {
        return Vec::new();
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(directory).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, "skipping unreadable entry during image scan");
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_image_file(entry.path()) {
            continue;
        }
        images.push(describe_image(entry.path()));
    }
    images.sort_by(|left, right| left.path.cmp(&right.path));
    images
}

fn describe_image(path: &Path) -> ImageInfo {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let described = std::fs::metadata(path).map_err(MigrateError::from).and_then(|metadata| {
        let modified_utc = metadata.modified().ok().and_then(format_system_time);
        let sha256 = sha256_file(path)?;
        Ok((metadata.len(), modified_utc, sha256))
    });
    match described {
        Ok((size_bytes, modified_utc, sha256)) => ImageInfo {
            path: path.to_path_buf(),
            name,
            size_bytes,
            modified_utc,
            sha256: Some(sha256),
            error: None,
        },
        Err(error) => ImageInfo {
            path: path.to_path_buf(),
            name,
            size_bytes: 0,
            modified_utc: None,
            sha256: None,
            error: Some(error.to_string()),
        },
    }
}

pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut hasher = Sha256::new();
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn read_full(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_image(path: &Path, header: &[u8], size: usize) {
        let mut data = vec![0xAAu8; size];
        data[..header.len()].copy_from_slice(header);
        fs::write(path, data).unwrap();
    }

    fn validation_message(result: Result<ImageValidation>) -> String {
        match result {
            Err(MigrateError::Validation(message)) => message,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let message = validation_message(validate_image(dir.path().join("absent.iso")));
        assert_eq!(message, ERR_MISSING);
    }

    #[test]
    fn rejects_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.iso");
        write_image(&path, b"CD001", 4096);
        assert_eq!(validation_message(validate_image(&path)), ERR_TOO_SMALL);
    }

    #[test]
    fn rejects_unknown_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.iso");
        write_image(&path, b"JUNK!", MIN_IMAGE_SIZE as usize);
        assert_eq!(validation_message(validate_image(&path)), ERR_INVALID_STRUCTURE);
    }

    #[test]
    fn accepts_iso9660_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linux.iso");
        write_image(&path, b"CD001", MIN_IMAGE_SIZE as usize);
        let validation = validate_image(&path).unwrap();
        assert_eq!(validation.marker, HeaderMarker::Iso9660);
        assert_eq!(validation.size_bytes, MIN_IMAGE_SIZE);
    }

    #[test]
    fn accepts_zeroed_leading_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybrid.img");
        write_image(&path, &[0, 0, 0, 0], 2 * MIN_IMAGE_SIZE as usize);
        assert_eq!(validate_image(&path).unwrap().marker, HeaderMarker::ZeroedBootArea);
    }

    #[test]
    fn short_header_is_not_accepted() {
        assert_eq!(classify_header(b"CD001"), None);
    }

    #[test]
    fn scan_finds_images_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.iso"), b"abc").unwrap();
        fs::write(dir.path().join("nested/b.VMDK"), b"").unwrap();
        fs::write(dir.path().join("readme.txt"), b"ignored").unwrap();

        let images = scan_directory(dir.path());
        let names: Vec<&str> = images.iter().map(|image| image.name.as_str()).collect();
        assert_eq!(names, vec!["a.iso", "b.VMDK"]);
        assert_eq!(images[0].size_bytes, 3);
        assert_eq!(
            images[0].sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert!(images[0].modified_utc.is_some());
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        assert!(scan_directory("/definitely/not/here").is_empty());
    }
}
