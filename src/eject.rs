//! Safe removal through the platform's own tooling.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

use crate::collaborators::Ejector;
use crate::errors::{SyncError, SyncResult};

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEjector;

impl SystemEjector {
    pub fn new() -> Self {
        Self
    }
}

impl Ejector for SystemEjector {
    fn eject(&self, volume_root: &Path) -> bool {
        match eject_volume(volume_root) {
            Ok(()) => true,
            Err(e) => {
                warn!(volume = %volume_root.display(), error = %e, "eject failed");
                false
            }
        }
    }
}

fn run_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> SyncResult<()> {
    debug!(program, "running eject helper");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SyncError::Eject(format!("failed to run {}: {}", program, e)))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SyncError::Eject(format!("{} failed: {}", program, stderr.trim())))
    }
}

/// Unmounts through udisks and powers the device off; plain `umount` when
/// udisks is unavailable or refuses.
#[cfg(target_os = "linux")]
fn eject_volume(volume_root: &Path) -> SyncResult<()> {
    use crate::volume::mount_key;
    use sysinfo::Disks;

    let target = mount_key(volume_root);
    let device = Disks::new_with_refreshed_list()
        .iter()
        .find(|disk| mount_key(disk.mount_point()) == target)
        .map(|disk| disk.name().to_os_string());

    if let Some(device) = device {
        let unmounted = run_command("udisksctl", &[OsStr::new("unmount"), OsStr::new("-b"), device.as_os_str()]);
        match unmounted {
            Ok(()) => {
                if let Err(e) =
                    run_command("udisksctl", &[OsStr::new("power-off"), OsStr::new("-b"), device.as_os_str()])
                {
                    // Unmounted is enough for safe removal.
                    debug!(error = %e, "power-off after unmount failed");
                }
                return Ok(());
            }
            Err(e) => debug!(error = %e, "udisksctl unmount failed, trying umount"),
        }
    }

    run_command("umount", &[target.as_os_str()])
}

#[cfg(target_os = "macos")]
fn eject_volume(volume_root: &Path) -> SyncResult<()> {
    run_command("diskutil", &[OsStr::new("eject"), volume_root.as_os_str()])
}

/// Invokes the Explorer "Eject" verb on the drive letter.
#[cfg(target_os = "windows")]
fn eject_volume(volume_root: &Path) -> SyncResult<()> {
    let letter = volume_root
        .to_string_lossy()
        .trim_end_matches(['\\', '/'])
        .to_string();
    if letter.len() != 2 || !letter.ends_with(':') {
        return Err(SyncError::Eject(format!(
            "{} is not a drive letter",
            volume_root.display()
        )));
    }
    let script = format!(
        "(New-Object -comObject Shell.Application).Namespace(17).ParseName('{}').InvokeVerb('Eject')",
        letter
    );
    run_command("powershell", &["-NoProfile", "-Command", script.as_str()])
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn eject_volume(volume_root: &Path) -> SyncResult<()> {
    Err(SyncError::Eject(format!(
        "no eject support on this platform for {}",
        volume_root.display()
    )))
}
