//! Seams between the mirror core and whatever presents it to the user.
//!
//! The core raises [`Notification`]s, asks a [`SyncPrompt`] before acting on
//! its own initiative, and hands safe removal to an [`Ejector`]. The
//! implementations here are the headless ones used by the CLI.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::session::{RejectReason, SyncSummary, SyncTrigger};
use crate::sync_engine::ProgressEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum Notification {
    DriveRecognized { drive: PathBuf, label: String },
    DriveLost { drive: PathBuf },
    SyncRejected { trigger: SyncTrigger, reason: RejectReason },
    SyncStarted { session_id: Uuid, trigger: SyncTrigger },
    Progress { session_id: Uuid, event: ProgressEvent },
    SyncCompleted { summary: SyncSummary },
    SyncFailed { session_id: Uuid, error: String },
    SyncAbandoned { session_id: Uuid },
    Ejected { drive: PathBuf },
    EjectFailed { drive: PathBuf },
    EjectDeclined { drive: PathBuf },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Answers the offers the session makes without being asked.
pub trait SyncPrompt: Send + Sync {
    /// The expected drive just showed up. Sync now?
    fn offer_sync(&self, drive: &Path) -> bool;

    /// A sync completed. Eject the drive now?
    fn offer_eject(&self, summary: &SyncSummary) -> bool;
}

/// Best-effort safe removal of a volume. Failure is reported, never fatal.
pub trait Ejector: Send + Sync {
    fn eject(&self, volume_root: &Path) -> bool;
}

#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub prompt: Arc<dyn SyncPrompt>,
    pub ejector: Arc<dyn Ejector>,
}

/// Renders notifications as log lines, or as one JSON object per line on
/// stdout for scripts.
#[derive(Default)]
pub struct LogNotifier {
    /// File count of the run in progress, for percentage output.
    total: Mutex<usize>,
    json: bool,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        if self.json {
            match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "cannot serialize notification"),
            }
            return;
        }

        match notification {
            Notification::DriveRecognized { drive, label } => {
                info!("Drive '{}' detected at {}", label, drive.display());
            }
            Notification::DriveLost { drive } => {
                info!("Drive at {} is gone", drive.display());
            }
            Notification::SyncRejected { trigger, reason } => {
                warn!(?trigger, "Sync not started: {}", reason);
            }
            Notification::SyncStarted { session_id, trigger } => {
                info!(%session_id, ?trigger, "Syncing to drive...");
            }
            Notification::Progress { event, .. } => match event {
                ProgressEvent::Init { total } => {
                    *self.total.lock() = total;
                    info!("{} files to check", total);
                }
                ProgressEvent::Item {
                    index,
                    path,
                    was_copied,
                    ..
                } => {
                    let total = *self.total.lock();
                    let percent = if total > 0 { index * 100 / total } else { 100 };
                    let action = if was_copied { "Copied" } else { "Skipped" };
                    info!("{}: {} ({}/{} - {}%)", action, path, index, total, percent);
                }
                ProgressEvent::Done { .. } => {}
            },
            Notification::SyncCompleted { summary } => {
                info!(
                    session_id = %summary.session_id,
                    "Sync completed. Copied: {}, Skipped: {}",
                    summary.copied, summary.skipped
                );
            }
            Notification::SyncFailed { session_id, error } => {
                error!(%session_id, "Sync failed: {}", error);
            }
            Notification::SyncAbandoned { session_id } => {
                warn!(%session_id, "Sync abandoned before completion");
            }
            Notification::Ejected { drive } => {
                info!("You may now safely remove the drive at {}", drive.display());
            }
            Notification::EjectFailed { drive } => {
                warn!("Automatic eject of {} failed. Eject manually.", drive.display());
            }
            Notification::EjectDeclined { drive } => {
                info!("Remember to safely eject {} before removing it.", drive.display());
            }
        }
    }
}

/// Answers both offers from fixed configuration values.
#[derive(Debug, Clone, Copy)]
pub struct ConfigPrompt {
    pub auto_sync: bool,
    pub auto_eject: bool,
}

impl SyncPrompt for ConfigPrompt {
    fn offer_sync(&self, _drive: &Path) -> bool {
        self.auto_sync
    }

    fn offer_eject(&self, _summary: &SyncSummary) -> bool {
        self.auto_eject
    }
}
