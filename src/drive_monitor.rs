//! Presence/identity tracking for the configured removable drive.
//!
//! The monitor polls the drive path at a fixed interval, feeds each
//! observation through the pure [`DriveState::next`] transition and pushes
//! edge events onto an unbounded channel. Sending never waits on the
//! consumer, so a slow foreground cannot stall the poll cadence.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::sync_engine::ShutdownSignal;
use crate::volume::VolumeProbe;

/// The drive to watch for and the label it must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveIdentity {
    pub path: PathBuf,
    pub expected_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveState {
    #[default]
    Absent,
    PresentUnverified,
    PresentVerified,
}

/// What one poll saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub mounted: bool,
    pub label_matches: bool,
}

/// Edge produced by a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Recognized,
    Lost,
}

impl DriveState {
    pub fn next(self, observation: Observation) -> (DriveState, Option<Transition>) {
        let recognized = observation.mounted && observation.label_matches;
        match (self, recognized) {
            (DriveState::PresentVerified, true) => (DriveState::PresentVerified, None),
            (DriveState::PresentVerified, false) => (DriveState::Absent, Some(Transition::Lost)),
            (_, true) => (DriveState::PresentVerified, Some(Transition::Recognized)),
            (_, false) if observation.mounted => (DriveState::PresentUnverified, None),
            (_, false) => (DriveState::Absent, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    Recognized { path: PathBuf, label: String },
    Lost { path: PathBuf },
}

pub struct DriveMonitor {
    identity: DriveIdentity,
    poll_interval: Duration,
    probe: Arc<dyn VolumeProbe>,
    /// Published for presentation only (status display); session logic
    /// learns about the drive through events.
    state: Arc<RwLock<DriveState>>,
    shutdown: ShutdownSignal,
}

impl DriveMonitor {
    pub fn new(
        identity: DriveIdentity,
        poll_interval: Duration,
        probe: Arc<dyn VolumeProbe>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            identity,
            poll_interval,
            probe,
            state: Arc::new(RwLock::new(DriveState::Absent)),
            shutdown,
        }
    }

    pub fn state_handle(&self) -> Arc<RwLock<DriveState>> {
        self.state.clone()
    }

    pub fn state(&self) -> DriveState {
        *self.state.read()
    }

    /// Queries mount status and, only when mounted, the label. Any query
    /// error counts as not mounted.
    pub fn observe(&self) -> Observation {
        let path = &self.identity.path;
        let mounted = match self.probe.is_mounted(path) {
            Ok(mounted) => mounted,
            Err(e) => {
                debug!(error = %e, "mount query failed, treating drive as absent");
                false
            }
        };
        if !mounted {
            return Observation {
                mounted: false,
                label_matches: false,
            };
        }

        match self.probe.volume_label(path) {
            Ok(label) => Observation {
                mounted: true,
                label_matches: label.as_deref() == Some(self.identity.expected_label.as_str()),
            },
            Err(e) => {
                debug!(error = %e, "label query failed, treating drive as absent");
                Observation {
                    mounted: false,
                    label_matches: false,
                }
            }
        }
    }

    /// Runs one poll: observe, transition, and return the edge event if any.
    pub fn poll_once(&self) -> Option<DriveEvent> {
        let observation = self.observe();
        let mut state = self.state.write();
        let (next, transition) = state.next(observation);
        if next != *state {
            debug!(from = ?*state, to = ?next, "drive state changed");
        }
        *state = next;
        drop(state);

        transition.map(|transition| match transition {
            Transition::Recognized => {
                info!(drive = %self.identity.path.display(), label = %self.identity.expected_label, "drive recognized");
                DriveEvent::Recognized {
                    path: self.identity.path.clone(),
                    label: self.identity.expected_label.clone(),
                }
            }
            Transition::Lost => {
                info!(drive = %self.identity.path.display(), "drive lost");
                DriveEvent::Lost {
                    path: self.identity.path.clone(),
                }
            }
        })
    }

    /// Starts the poll loop. It ends at the first tick after shutdown is
    /// requested or once the event receiver is dropped.
    pub fn spawn(self, events: mpsc::UnboundedSender<DriveEvent>) -> JoinHandle<()> {
        let monitor = Arc::new(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if monitor.shutdown.is_requested() {
                    break;
                }

                let poller = monitor.clone();
                let event = match tokio::task::spawn_blocking(move || poller.poll_once()).await {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "drive poll task failed");
                        None
                    }
                };

                if let Some(event) = event {
                    if events.send(event).is_err() {
                        debug!("drive event receiver dropped, stopping monitor");
                        break;
                    }
                }
            }
            debug!("drive monitor stopped");
        })
    }
}
