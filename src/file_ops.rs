//! File operations for the mirror engine: tree scanning and file copies.

use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

use crate::errors::{SyncError, SyncResult};

pub const COPY_BUFFER_SIZE: usize = 1024 * 1024;
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// A path relative to a tree root. Local and remote files are matched on
/// this value alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativeFilePath(PathBuf);

impl RelativeFilePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Resolves this path against `root`.
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for RelativeFilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl Serialize for RelativeFilePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string_lossy())
    }
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub buffer_size: usize,
    pub preserve_metadata: bool,
    pub verify_integrity: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
            preserve_metadata: true,
            verify_integrity: false,
        }
    }
}

/// Enumerates every file below `root`, recursively, as paths relative to
/// `root`. Directories are not listed.
///
/// Fails when the root itself is missing, not a directory, or unreadable.
/// Entries below the root that cannot be read are logged and skipped.
pub fn scan_tree(root: &Path) -> SyncResult<BTreeSet<RelativeFilePath>> {
    let scan_error = |source: io::Error| SyncError::Scan {
        root: root.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(root).map_err(scan_error)?;
    if !metadata.is_dir() {
        return Err(scan_error(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a directory",
        )));
    }
    fs::read_dir(root).map_err(scan_error)?;

    let mut files = BTreeSet::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        let is_file = entry.file_type().is_file()
            || (entry.path_is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }

        match entry.path().strip_prefix(root) {
            Ok(relative) => {
                files.insert(RelativeFilePath::new(relative));
            }
            Err(_) => {
                warn!(path = %entry.path().display(), "entry outside scan root");
            }
        }
    }

    Ok(files)
}

/// Creates `path` and any missing parents.
pub fn ensure_dir(path: &Path) -> SyncResult<()> {
    fs::create_dir_all(path).map_err(|source| SyncError::DirectoryCreate {
        path: path.to_path_buf(),
        source,
    })
}

pub fn compute_file_hash(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Xxh3::new();

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.digest())
}

const TEMP_SUFFIX: &str = ".usb-mirror.tmp";

/// `.<name>.usb-mirror.tmp` next to `dest`.
fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

/// Copies `source` to `dest`, replacing `dest`. With `preserve_metadata`
/// the access/modification times and permissions follow the source.
/// The destination's parent directory must already exist.
///
/// Contents land in a temporary sibling that is renamed over `dest` only
/// once everything succeeded, so a failed copy never leaves a partial
/// file at `dest`.
pub fn copy_file(source: &Path, dest: &Path, options: &CopyOptions) -> io::Result<u64> {
    let temp = temp_path_for(dest);
    let result = copy_to_temp(source, &temp, options).and_then(|bytes| {
        fs::rename(&temp, dest)?;
        Ok(bytes)
    });
    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %temp.display(), error = %e, "cannot remove temporary copy");
            }
        }
    }
    result
}

fn copy_to_temp(source: &Path, temp: &Path, options: &CopyOptions) -> io::Result<u64> {
    let src_file = File::open(source)?;
    let src_metadata = src_file.metadata()?;
    let mut dest_file = File::create(temp)?;

    let mut bytes_copied: u64 = 0;
    {
        let mut reader = BufReader::with_capacity(options.buffer_size, src_file);
        let mut writer = BufWriter::with_capacity(options.buffer_size, &mut dest_file);
        let mut buffer = vec![0u8; options.buffer_size];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            writer.write_all(&buffer[..bytes_read])?;
            bytes_copied += bytes_read as u64;
        }
        writer.flush()?;
    }
    dest_file.sync_all()?;
    drop(dest_file);

    if options.preserve_metadata {
        let _ = fs::set_permissions(temp, src_metadata.permissions());
        filetime::set_file_times(
            temp,
            filetime::FileTime::from_last_access_time(&src_metadata),
            filetime::FileTime::from_last_modification_time(&src_metadata),
        )?;
    }

    if options.verify_integrity {
        let src_hash = compute_file_hash(source)?;
        let dest_hash = compute_file_hash(temp)?;
        if src_hash != dest_hash {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("hash mismatch after copy ({:016x} != {:016x})", src_hash, dest_hash),
            ));
        }
    }

    Ok(bytes_copied)
}
