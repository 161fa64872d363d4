//! Sync session orchestration.
//!
//! A [`SyncSession`] lives on the foreground loop. It reacts to drive
//! events, starts at most one engine run at a time on the blocking pool,
//! drains that run's progress without blocking, and offers to eject the
//! drive once a run completes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{Collaborators, Notification};
use crate::config::MirrorConfig;
use crate::drive_monitor::{DriveEvent, DriveState};
use crate::file_ops::CopyOptions;
use crate::progress::{progress_channel, spawn_producer, ProgressReceiver, Received};
use crate::sync_engine::{ProgressEvent, ShutdownSignal, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// Accepted offer after the drive was recognized.
    Automatic,
    /// Explicit user request.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error("the drive is not present")]
    DriveNotReady,
    #[error("shutdown in progress")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub session_id: Uuid,
    pub trigger: SyncTrigger,
    pub copied: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// How a run ended, as seen by the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(SyncSummary),
    Failed { session_id: Uuid, error: String },
    /// The event sequence ended without `Done` and without an error.
    Abandoned { session_id: Uuid },
}

struct ActiveRun {
    id: Uuid,
    trigger: SyncTrigger,
    started_at: DateTime<Utc>,
    receiver: ProgressReceiver,
    producer: JoinHandle<()>,
}

pub struct SyncSession {
    config: MirrorConfig,
    collaborators: Collaborators,
    shutdown: ShutdownSignal,
    drive_state: DriveState,
    running: bool,
    synced_since_drive_arrival: bool,
    active: Option<ActiveRun>,
}

impl SyncSession {
    pub fn new(config: MirrorConfig, collaborators: Collaborators, shutdown: ShutdownSignal) -> Self {
        Self {
            config,
            collaborators,
            shutdown,
            drive_state: DriveState::Absent,
            running: false,
            synced_since_drive_arrival: false,
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn synced_since_drive_arrival(&self) -> bool {
        self.synced_since_drive_arrival
    }

    pub fn drive_state(&self) -> DriveState {
        self.drive_state
    }

    /// Records the drive state learned outside the event stream, e.g. from
    /// a one-off poll.
    pub fn set_drive_state(&mut self, state: DriveState) {
        if state == DriveState::Absent {
            self.synced_since_drive_arrival = false;
        }
        self.drive_state = state;
    }

    pub fn handle_drive_event(&mut self, event: DriveEvent) {
        match event {
            DriveEvent::Recognized { path, label } => {
                self.drive_state = DriveState::PresentVerified;
                self.notify(Notification::DriveRecognized {
                    drive: path.clone(),
                    label,
                });

                if self.synced_since_drive_arrival || self.running || self.shutdown.is_requested() {
                    debug!(
                        synced = self.synced_since_drive_arrival,
                        running = self.running,
                        "not offering sync"
                    );
                    return;
                }
                if self.collaborators.prompt.offer_sync(&path) {
                    // Rejections are already reported by request_sync.
                    let _ = self.request_sync(SyncTrigger::Automatic);
                }
            }
            DriveEvent::Lost { path } => {
                self.drive_state = DriveState::Absent;
                self.synced_since_drive_arrival = false;
                if self.running {
                    info!(drive = %path.display(), "drive lost during sync, letting the run finish");
                }
                self.notify(Notification::DriveLost { drive: path });
            }
        }
    }

    /// Starts a run unless one is active, shutdown began, or (for a manual
    /// request) the drive is not verified.
    pub fn request_sync(&mut self, trigger: SyncTrigger) -> Result<Uuid, RejectReason> {
        let rejection = if self.shutdown.is_requested() {
            Some(RejectReason::ShuttingDown)
        } else if self.running {
            Some(RejectReason::AlreadyRunning)
        } else if trigger == SyncTrigger::Manual && self.drive_state != DriveState::PresentVerified {
            Some(RejectReason::DriveNotReady)
        } else {
            None
        };
        if let Some(reason) = rejection {
            info!(?trigger, %reason, "sync request rejected");
            self.notify(Notification::SyncRejected { trigger, reason });
            return Err(reason);
        }

        let copy_options = CopyOptions {
            verify_integrity: self.config.verify_copies,
            ..CopyOptions::default()
        };
        let run = SyncEngine::new(
            self.config.local_root(),
            self.config.remote_root(),
            self.shutdown.clone(),
        )
        .with_copy_options(copy_options)
        .run();

        let (sender, receiver) = progress_channel();
        let producer = spawn_producer(run, sender);
        let id = Uuid::new_v4();

        self.running = true;
        self.active = Some(ActiveRun {
            id,
            trigger,
            started_at: Utc::now(),
            receiver,
            producer,
        });
        info!(session_id = %id, ?trigger, "sync session started");
        self.notify(Notification::SyncStarted {
            session_id: id,
            trigger,
        });
        Ok(id)
    }

    /// Drains whatever progress is queued without waiting for more.
    /// Returns the outcome once the active run has ended.
    pub async fn pump(&mut self) -> Option<SessionOutcome> {
        loop {
            let active = self.active.as_mut()?;
            let session_id = active.id;

            match active.receiver.try_next() {
                Received::Empty => return None,
                Received::Event(ProgressEvent::Done {
                    copied_count,
                    skipped_count,
                }) => {
                    self.notify(Notification::Progress {
                        session_id,
                        event: ProgressEvent::Done {
                            copied_count,
                            skipped_count,
                        },
                    });
                    return Some(self.finish_completed(copied_count, skipped_count).await);
                }
                Received::Event(event) => {
                    self.notify(Notification::Progress { session_id, event });
                }
                Received::Failed(e) => {
                    error!(%session_id, error = %e, "sync session failed");
                    let error = e.to_string();
                    self.end_run().await;
                    self.notify(Notification::SyncFailed {
                        session_id,
                        error: error.clone(),
                    });
                    return Some(SessionOutcome::Failed { session_id, error });
                }
                Received::Closed => {
                    warn!(%session_id, "sync session ended without completing");
                    self.end_run().await;
                    self.notify(Notification::SyncAbandoned { session_id });
                    return Some(SessionOutcome::Abandoned { session_id });
                }
            }
        }
    }

    /// Pumps on the configured drain interval until the active run ends.
    /// Returns `None` when nothing is running.
    pub async fn run_to_end(&mut self) -> Option<SessionOutcome> {
        self.active.as_ref()?;
        let mut drain = tokio::time::interval(self.drain_interval());
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            drain.tick().await;
            if let Some(outcome) = self.pump().await {
                return Some(outcome);
            }
        }
    }

    /// Waits for an active run to stop at its next file boundary and
    /// reports how it ended. Progress still queued is delivered first, so a
    /// run that already produced `Done` counts as completed. Call after the
    /// shared shutdown signal has been requested; no eject is offered.
    pub async fn shutdown(&mut self) -> Option<SessionOutcome> {
        let Some(session_id) = self.active.as_ref().map(|active| active.id) else {
            self.running = false;
            return None;
        };
        info!(%session_id, "waiting for sync worker to stop");
        let outcome = self.run_to_end().await;
        self.running = false;
        outcome
    }

    fn drain_interval(&self) -> Duration {
        self.config.drain_interval()
    }

    async fn end_run(&mut self) -> Option<ActiveRun> {
        self.running = false;
        let mut active = self.active.take()?;
        if let Err(e) = (&mut active.producer).await {
            warn!(error = %e, "sync worker panicked");
        }
        Some(active)
    }

    async fn finish_completed(&mut self, copied: usize, skipped: usize) -> SessionOutcome {
        let Some(active) = self.end_run().await else {
            return SessionOutcome::Abandoned {
                session_id: Uuid::nil(),
            };
        };
        // A drive lost mid-run already reset the flag and must be offered
        // again when it comes back.
        self.synced_since_drive_arrival = self.drive_state == DriveState::PresentVerified;

        let summary = SyncSummary {
            session_id: active.id,
            trigger: active.trigger,
            copied,
            skipped,
            started_at: active.started_at,
            finished_at: Utc::now(),
        };
        info!(session_id = %summary.session_id, copied, skipped, "sync session completed");
        self.notify(Notification::SyncCompleted {
            summary: summary.clone(),
        });
        self.offer_eject(&summary).await;
        SessionOutcome::Completed(summary)
    }

    async fn offer_eject(&self, summary: &SyncSummary) {
        let drive = self.config.drive_root();
        if self.shutdown.is_requested() || !self.collaborators.prompt.offer_eject(summary) {
            self.notify(Notification::EjectDeclined { drive });
            return;
        }

        let ejector = Arc::clone(&self.collaborators.ejector);
        let target: PathBuf = drive.clone();
        let ejected = tokio::task::spawn_blocking(move || ejector.eject(&target))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "eject task failed");
                false
            });

        if ejected {
            self.notify(Notification::Ejected { drive });
        } else {
            self.notify(Notification::EjectFailed { drive });
        }
    }

    fn notify(&self, notification: Notification) {
        self.collaborators.notifier.notify(notification);
    }
}
