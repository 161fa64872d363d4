//! Volume queries: is a drive path mounted, and what label does it carry.
//!
//! # Linux
//! The label is resolved through the udev symlinks in `/dev/disk/by-label`,
//! matched against the device node `sysinfo` reports for the mount point.
//!
//! # macOS / Windows
//! `sysinfo` already reports the volume name as the disk name.

use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

use crate::errors::{SyncError, SyncResult};

#[cfg(target_os = "linux")]
const BY_LABEL_DIR: &str = "/dev/disk/by-label";

/// Read-only view of the OS mount table. Implementations keep no state.
pub trait VolumeProbe: Send + Sync {
    /// Whether `path` is currently a reachable mount.
    fn is_mounted(&self, path: &Path) -> SyncResult<bool>;

    /// The label of the volume mounted exactly at `path`, if any.
    fn volume_label(&self, path: &Path) -> SyncResult<Option<String>>;
}

/// Probe backed by the real filesystem and `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemVolumeProbe;

impl SystemVolumeProbe {
    pub fn new() -> Self {
        Self
    }
}

impl VolumeProbe for SystemVolumeProbe {
    fn is_mounted(&self, path: &Path) -> SyncResult<bool> {
        match path.try_exists() {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(e) => return Err(mount_query_error(path, &e)),
        }

        // Try to read the directory - this fails quickly once the device is gone
        match fs::read_dir(path) {
            Ok(_) => Ok(true),
            Err(e) if is_device_gone(&e) => Ok(false),
            // Permission denied is not a disconnect
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Ok(true),
            Err(e) => Err(mount_query_error(path, &e)),
        }
    }

    fn volume_label(&self, path: &Path) -> SyncResult<Option<String>> {
        let target = mount_key(path);
        let disks = Disks::new_with_refreshed_list();

        let Some(disk) = disks
            .iter()
            .find(|disk| mount_key(disk.mount_point()) == target)
        else {
            return Ok(None);
        };

        #[cfg(target_os = "linux")]
        {
            Ok(label_for_device(Path::new(BY_LABEL_DIR), Path::new(disk.name())))
        }

        #[cfg(not(target_os = "linux"))]
        {
            let name = disk.name().to_string_lossy().to_string();
            Ok(if name.is_empty() { None } else { Some(name) })
        }
    }
}

fn mount_query_error(path: &Path, error: &std::io::Error) -> SyncError {
    SyncError::MountQuery {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn is_device_gone(error: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        // EIO (5) or ENODEV (19) indicate device issues
        if let Some(errno) = error.raw_os_error() {
            return errno == libc::EIO || errno == libc::ENODEV;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = error;
    }
    false
}

/// Canonical form used to compare a configured drive path with a mount point.
pub(crate) fn mount_key(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Finds the label whose `by-label` symlink resolves to `device`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn label_for_device(by_label_dir: &Path, device: &Path) -> Option<String> {
    let device = fs::canonicalize(device).ok()?;
    let entries = fs::read_dir(by_label_dir).ok()?;

    entries
        .filter_map(|entry| entry.ok())
        .find(|entry| fs::canonicalize(entry.path()).ok().as_deref() == Some(device.as_path()))
        .map(|entry| decode_udev_label(&entry.file_name().to_string_lossy()))
}

/// Undoes udev's `\xHH` escaping of label characters (space becomes `\x20`).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn decode_udev_label(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(value);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_decode_plain_label() {
        assert_eq!(decode_udev_label("IPOD"), "IPOD");
    }

    #[test]
    fn test_decode_escaped_label() {
        assert_eq!(decode_udev_label("MY\\x20MUSIC"), "MY MUSIC");
        assert_eq!(decode_udev_label("A\\x2fB"), "A/B");
    }

    #[test]
    fn test_decode_keeps_malformed_escape() {
        assert_eq!(decode_udev_label("odd\\xZZ"), "odd\\xZZ");
        assert_eq!(decode_udev_label("tail\\x2"), "tail\\x2");
    }

    #[test]
    fn test_missing_path_is_not_mounted() {
        let dir = TempDir::new().unwrap();
        let probe = SystemVolumeProbe::new();
        assert!(!probe.is_mounted(&dir.path().join("gone")).unwrap());
    }

    #[test]
    fn test_readable_directory_is_mounted() {
        let dir = TempDir::new().unwrap();
        assert!(SystemVolumeProbe::new().is_mounted(dir.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_mount_key_resolves_symlinked_mounts() {
        let dir = TempDir::new().unwrap();
        let mount = dir.path().join("media").join("IPOD");
        fs::create_dir_all(&mount).unwrap();
        let alias = dir.path().join("ipod");
        std::os::unix::fs::symlink(&mount, &alias).unwrap();

        assert_eq!(mount_key(&alias), mount_key(&mount));
        assert_eq!(mount_key(&dir.path().join("gone")), dir.path().join("gone"));
    }

    #[cfg(unix)]
    #[test]
    fn test_label_lookup_through_symlinks() {
        let dir = TempDir::new().unwrap();
        let dev = dir.path().join("dev");
        let by_label = dir.path().join("by-label");
        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(&by_label).unwrap();
        fs::write(dev.join("sdb1"), "").unwrap();
        fs::write(dev.join("sdc1"), "").unwrap();
        std::os::unix::fs::symlink(dev.join("sdb1"), by_label.join("IPOD")).unwrap();
        std::os::unix::fs::symlink(dev.join("sdc1"), by_label.join("BACKUP\\x20DISK")).unwrap();

        assert_eq!(label_for_device(&by_label, &dev.join("sdb1")), Some("IPOD".to_string()));
        assert_eq!(
            label_for_device(&by_label, &dev.join("sdc1")),
            Some("BACKUP DISK".to_string())
        );
        assert_eq!(label_for_device(&by_label, &dev.join("missing")), None);
    }
}
