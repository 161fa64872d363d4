//! Mirror configuration, persisted as JSON.
//!
//! Files written by the older tray tool (`USB_DRIVE`,
//! `EXPECTED_VOLUME_NAME`, `REMOTE_FOLDER`, `LOCAL_FOLDER`) load unchanged.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::drive_monitor::DriveIdentity;
use crate::errors::{SyncError, SyncResult};

const APP_DIR: &str = "usb-mirror";
const CONFIG_FILE: &str = "config.json";

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_drain_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Mount point or drive letter of the removable volume.
    #[serde(alias = "USB_DRIVE")]
    pub drive_path: PathBuf,
    /// Volume label that identifies the right drive (exact match).
    #[serde(alias = "EXPECTED_VOLUME_NAME")]
    pub expected_label: String,
    /// Mirror target. Relative paths are resolved against the drive.
    #[serde(alias = "REMOTE_FOLDER")]
    pub remote_path: PathBuf,
    /// Folder mirrored onto the drive.
    #[serde(alias = "LOCAL_FOLDER")]
    pub local_path: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Accept the sync offer made when the drive shows up.
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    /// Accept the eject offer made after a completed sync.
    #[serde(default)]
    pub auto_eject: bool,
    /// Hash source and destination after every copy.
    #[serde(default)]
    pub verify_copies: bool,
}

impl MirrorConfig {
    pub fn new(
        drive_path: impl Into<PathBuf>,
        expected_label: impl Into<String>,
        remote_path: impl Into<PathBuf>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            drive_path: drive_path.into(),
            expected_label: expected_label.into(),
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            auto_sync: true,
            auto_eject: false,
            verify_copies: false,
        }
    }

    /// `<config dir>/usb-mirror/config.json`, falling back to the working
    /// directory when the platform has no config dir.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            return Err(SyncError::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: MirrorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let temp_file = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_file, content)?;
        std::fs::rename(&temp_file, path)?;
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.expected_label.is_empty() {
            return Err(SyncError::InvalidConfig("expected volume label is empty".into()));
        }
        if self.drive_path.as_os_str().is_empty() {
            return Err(SyncError::InvalidConfig("drive path is empty".into()));
        }
        if self.remote_path.as_os_str().is_empty() {
            return Err(SyncError::InvalidConfig("remote folder is empty".into()));
        }
        if !self.local_path.is_dir() {
            return Err(SyncError::InvalidConfig(format!(
                "local folder not found: {}",
                self.local_path.display()
            )));
        }
        if self.poll_interval_ms == 0 || self.drain_interval_ms == 0 {
            return Err(SyncError::InvalidConfig("intervals must be positive".into()));
        }
        Ok(())
    }

    /// Root of the drive. A bare drive letter such as `U:` becomes `U:/`.
    pub fn drive_root(&self) -> PathBuf {
        let raw = self.drive_path.to_string_lossy();
        if raw.len() == 2 && raw.ends_with(':') {
            PathBuf::from(format!("{}/", raw))
        } else {
            self.drive_path.clone()
        }
    }

    pub fn remote_root(&self) -> PathBuf {
        if self.remote_path.is_absolute() {
            self.remote_path.clone()
        } else {
            self.drive_root().join(&self.remote_path)
        }
    }

    pub fn local_root(&self) -> PathBuf {
        self.local_path.clone()
    }

    pub fn drive_identity(&self) -> DriveIdentity {
        DriveIdentity {
            path: self.drive_root(),
            expected_label: self.expected_label.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}
