//! usb-mirror library: watches for a labelled removable drive and mirrors
//! a local folder onto it.

pub mod collaborators;
pub mod config;
pub mod drive_monitor;
pub mod eject;
pub mod errors;
pub mod file_ops;
pub mod progress;
pub mod session;
pub mod sync_engine;
pub mod volume;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use collaborators::Collaborators;
use config::MirrorConfig;
use drive_monitor::DriveMonitor;
use errors::{SyncError, SyncResult};
use session::{SessionOutcome, SyncSession, SyncTrigger};
use sync_engine::ShutdownSignal;
use volume::VolumeProbe;

/// Runs the monitor and session loop until Ctrl-C.
pub async fn watch(
    config: MirrorConfig,
    collaborators: Collaborators,
    probe: Arc<dyn VolumeProbe>,
) -> SyncResult<()> {
    let shutdown = ShutdownSignal::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C, shutting down"),
        }
        signal.request();
    });

    run_until_shutdown(config, collaborators, probe, shutdown).await
}

/// Foreground loop: applies drive events to the session and drains sync
/// progress on the configured interval. Returns once `shutdown` is
/// requested and any active run has stopped.
pub async fn run_until_shutdown(
    config: MirrorConfig,
    collaborators: Collaborators,
    probe: Arc<dyn VolumeProbe>,
    shutdown: ShutdownSignal,
) -> SyncResult<()> {
    let monitor = DriveMonitor::new(
        config.drive_identity(),
        config.poll_interval(),
        probe,
        shutdown.clone(),
    );
    let (drive_tx, mut drive_rx) = mpsc::unbounded_channel();
    let monitor_task = monitor.spawn(drive_tx);

    let mut drain = tokio::time::interval(config.drain_interval());
    drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut session = SyncSession::new(config, collaborators, shutdown.clone());

    info!("watching for drive");
    loop {
        tokio::select! {
            Some(event) = drive_rx.recv() => session.handle_drive_event(event),
            _ = drain.tick() => {
                if shutdown.is_requested() {
                    break;
                }
                session.pump().await;
            }
        }
    }

    if let Some(outcome) = session.shutdown().await {
        debug!(?outcome, "sync session ended during shutdown");
    }
    monitor_task
        .await
        .map_err(|e| SyncError::Internal(format!("drive monitor task failed: {}", e)))?;
    info!("stopped watching");
    Ok(())
}

/// Probes the drive once and, when it is recognized, runs one manual
/// session to the end.
pub async fn sync_now(
    config: MirrorConfig,
    collaborators: Collaborators,
    probe: Arc<dyn VolumeProbe>,
) -> SyncResult<SessionOutcome> {
    let shutdown = ShutdownSignal::new();
    let monitor = Arc::new(DriveMonitor::new(
        config.drive_identity(),
        config.poll_interval(),
        probe,
        shutdown.clone(),
    ));

    let poller = monitor.clone();
    tokio::task::spawn_blocking(move || poller.poll_once())
        .await
        .map_err(|e| SyncError::Internal(format!("drive probe failed: {}", e)))?;

    let mut session = SyncSession::new(config, collaborators, shutdown);
    session.set_drive_state(monitor.state());
    session.request_sync(SyncTrigger::Manual)?;

    session
        .run_to_end()
        .await
        .ok_or_else(|| SyncError::Internal("sync session vanished".into()))
}
