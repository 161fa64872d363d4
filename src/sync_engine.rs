//! One-way mirror engine: diffs a local tree against a remote tree by path
//! and copies whatever the remote side is missing.

use serde::Serialize;
use std::collections::BTreeSet;
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{SyncError, SyncResult};
use crate::file_ops::{copy_file, ensure_dir, scan_tree, CopyOptions, RelativeFilePath};

/// Cooperative shutdown flag shared by the poll loop, the copy loop and the
/// foreground. Once requested it stays set.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Partition of the local file set into files the remote lacks and files it
/// already has. Computed once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub to_copy: BTreeSet<RelativeFilePath>,
    pub to_skip: BTreeSet<RelativeFilePath>,
    pub total: usize,
}

impl SyncPlan {
    pub fn compute(local: BTreeSet<RelativeFilePath>, remote: &BTreeSet<RelativeFilePath>) -> Self {
        let total = local.len();
        let (to_skip, to_copy): (BTreeSet<_>, BTreeSet<_>) =
            local.into_iter().partition(|path| remote.contains(path));
        Self {
            to_copy,
            to_skip,
            total,
        }
    }

    /// Every planned path in lexicographic order.
    fn ordered(&self) -> Vec<RelativeFilePath> {
        self.to_copy.union(&self.to_skip).cloned().collect()
    }
}

/// Progress of one run. A complete run is `Init`, one `Item` per local file
/// with `index` counting up from 1, then `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum ProgressEvent {
    Init {
        total: usize,
    },
    Item {
        index: usize,
        copied_count: usize,
        skipped_count: usize,
        path: RelativeFilePath,
        was_copied: bool,
    },
    Done {
        copied_count: usize,
        skipped_count: usize,
    },
}

type Scanner = fn(&Path) -> SyncResult<BTreeSet<RelativeFilePath>>;

pub struct SyncEngine {
    local_root: PathBuf,
    remote_root: PathBuf,
    copy_options: CopyOptions,
    shutdown: ShutdownSignal,
    scanner: Scanner,
}

impl SyncEngine {
    pub fn new(local_root: PathBuf, remote_root: PathBuf, shutdown: ShutdownSignal) -> Self {
        Self {
            local_root,
            remote_root,
            copy_options: CopyOptions::default(),
            shutdown,
            scanner: scan_tree,
        }
    }

    pub fn with_copy_options(mut self, copy_options: CopyOptions) -> Self {
        self.copy_options = copy_options;
        self
    }

    /// Consumes the engine and returns the lazy event sequence of one run.
    /// Nothing touches the disk until the first event is pulled.
    pub fn run(self) -> SyncRun {
        SyncRun {
            engine: self,
            state: RunState::Pending,
            index: 0,
            copied: 0,
            skipped: 0,
        }
    }

    #[cfg(test)]
    fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    fn prepare(&self) -> SyncResult<SyncPlan> {
        ensure_dir(&self.remote_root)?;
        let local = (self.scanner)(&self.local_root)?;
        // The remote root exists at this point; if it still cannot be
        // listed, everything local is copied.
        let remote = (self.scanner)(&self.remote_root).unwrap_or_else(|e| {
            warn!(remote_root = %self.remote_root.display(), error = %e, "remote root unreadable, treating as empty");
            BTreeSet::new()
        });
        let plan = SyncPlan::compute(local, &remote);
        info!(
            local_root = %self.local_root.display(),
            remote_root = %self.remote_root.display(),
            total = plan.total,
            to_copy = plan.to_copy.len(),
            "mirror plan computed"
        );
        Ok(plan)
    }

    fn destination(&self, path: &RelativeFilePath) -> PathBuf {
        path.under(&self.remote_root)
    }
}

enum RunState {
    Pending,
    Copying {
        plan: SyncPlan,
        queue: std::vec::IntoIter<RelativeFilePath>,
    },
    Finished,
}

/// Event sequence of a single run.
///
/// Yields `Ok` events until `Done`, or a single `Err` after which the
/// sequence ends. When shutdown is requested the sequence ends before the
/// next file without an error and without `Done`.
pub struct SyncRun {
    engine: SyncEngine,
    state: RunState,
    index: usize,
    copied: usize,
    skipped: usize,
}

impl SyncRun {
    fn process(&mut self, plan: &SyncPlan, path: &RelativeFilePath) -> SyncResult<bool> {
        let dest = self.engine.destination(path);
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }

        if plan.to_skip.contains(path) {
            self.skipped += 1;
            debug!(path = %path, "already on remote, skipped");
            return Ok(false);
        }

        let source = path.under(&self.engine.local_root);
        let bytes = copy_file(&source, &dest, &self.engine.copy_options).map_err(|source| {
            SyncError::Copy {
                path: path.as_path().to_path_buf(),
                source,
            }
        })?;
        self.copied += 1;
        debug!(path = %path, bytes, "copied");
        Ok(true)
    }
}

impl Iterator for SyncRun {
    type Item = SyncResult<ProgressEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, RunState::Finished) {
            RunState::Pending => {
                if self.engine.shutdown.is_requested() {
                    return None;
                }
                match self.engine.prepare() {
                    Ok(plan) => {
                        let total = plan.total;
                        let queue = plan.ordered().into_iter();
                        self.state = RunState::Copying { plan, queue };
                        Some(Ok(ProgressEvent::Init { total }))
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            RunState::Copying { plan, mut queue } => {
                let Some(path) = queue.next() else {
                    info!(copied = self.copied, skipped = self.skipped, "mirror run finished");
                    return Some(Ok(ProgressEvent::Done {
                        copied_count: self.copied,
                        skipped_count: self.skipped,
                    }));
                };

                if self.engine.shutdown.is_requested() {
                    info!(processed = self.index, total = plan.total, "mirror run abandoned on shutdown");
                    return None;
                }

                match self.process(&plan, &path) {
                    Ok(was_copied) => {
                        self.index += 1;
                        let event = ProgressEvent::Item {
                            index: self.index,
                            copied_count: self.copied,
                            skipped_count: self.skipped,
                            path,
                            was_copied,
                        };
                        self.state = RunState::Copying { plan, queue };
                        Some(Ok(event))
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            RunState::Finished => None,
        }
    }
}

impl FusedIterator for SyncRun {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    struct Trees {
        _dir: TempDir,
        local: PathBuf,
        remote: PathBuf,
    }

    fn trees(local: &[&str], remote: &[&str]) -> Trees {
        let dir = TempDir::new().unwrap();
        let local_root = dir.path().join("local");
        let remote_root = dir.path().join("drive").join("music");
        fs::create_dir_all(&local_root).unwrap();
        for rel in local {
            write(&local_root, rel, &format!("local {}", rel));
        }
        for rel in remote {
            write(&remote_root, rel, &format!("remote {}", rel));
        }
        Trees {
            _dir: dir,
            local: local_root,
            remote: remote_root,
        }
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn run(trees: &Trees, shutdown: ShutdownSignal) -> (Vec<ProgressEvent>, Option<SyncError>) {
        let engine = SyncEngine::new(trees.local.clone(), trees.remote.clone(), shutdown);
        let mut events = Vec::new();
        for item in engine.run() {
            match item {
                Ok(event) => events.push(event),
                Err(e) => return (events, Some(e)),
            }
        }
        (events, None)
    }

    fn rel(path: &str) -> RelativeFilePath {
        RelativeFilePath::new(path)
    }

    #[test]
    fn test_copies_everything_into_empty_remote() {
        let trees = trees(&["a.txt", "b/c.txt"], &[]);
        let (events, err) = run(&trees, ShutdownSignal::new());

        assert!(err.is_none());
        assert_eq!(
            events,
            vec![
                ProgressEvent::Init { total: 2 },
                ProgressEvent::Item {
                    index: 1,
                    copied_count: 1,
                    skipped_count: 0,
                    path: rel("a.txt"),
                    was_copied: true,
                },
                ProgressEvent::Item {
                    index: 2,
                    copied_count: 2,
                    skipped_count: 0,
                    path: RelativeFilePath::new(Path::new("b").join("c.txt")),
                    was_copied: true,
                },
                ProgressEvent::Done {
                    copied_count: 2,
                    skipped_count: 0,
                },
            ]
        );
        assert_eq!(
            fs::read_to_string(trees.remote.join("b").join("c.txt")).unwrap(),
            "local b/c.txt"
        );
    }

    #[test]
    fn test_existing_remote_file_is_skipped_untouched() {
        let trees = trees(&["a.txt"], &["a.txt"]);
        let (events, err) = run(&trees, ShutdownSignal::new());

        assert!(err.is_none());
        assert_eq!(
            events,
            vec![
                ProgressEvent::Init { total: 1 },
                ProgressEvent::Item {
                    index: 1,
                    copied_count: 0,
                    skipped_count: 1,
                    path: rel("a.txt"),
                    was_copied: false,
                },
                ProgressEvent::Done {
                    copied_count: 0,
                    skipped_count: 1,
                },
            ]
        );
        assert_eq!(fs::read_to_string(trees.remote.join("a.txt")).unwrap(), "remote a.txt");
    }

    #[test]
    fn test_empty_local_tree_goes_straight_to_done() {
        let trees = trees(&[], &["keep.txt"]);
        let (events, err) = run(&trees, ShutdownSignal::new());

        assert!(err.is_none());
        assert_eq!(
            events,
            vec![
                ProgressEvent::Init { total: 0 },
                ProgressEvent::Done {
                    copied_count: 0,
                    skipped_count: 0,
                },
            ]
        );
    }

    #[test]
    fn test_remote_ends_as_union_of_both_sets() {
        let cases: &[(&[&str], &[&str])] = &[
            (&["a", "b", "c"], &["b", "z"]),
            (&["x/1", "x/2", "y/3"], &["x/2", "y/3"]),
            (&["only"], &["other/deep/file"]),
            (&["same"], &["same"]),
        ];

        for (local, remote) in cases {
            let trees = trees(local, remote);
            let (events, err) = run(&trees, ShutdownSignal::new());
            assert!(err.is_none());

            let local_set: BTreeSet<_> = local.iter().map(|p| rel(p)).collect();
            let remote_set: BTreeSet<_> = remote.iter().map(|p| rel(p)).collect();
            let expected_copied = local_set.difference(&remote_set).count();
            let expected_skipped = local_set.intersection(&remote_set).count();

            assert_eq!(
                events.last(),
                Some(&ProgressEvent::Done {
                    copied_count: expected_copied,
                    skipped_count: expected_skipped,
                })
            );

            let after = scan_tree(&trees.remote).unwrap();
            let union: BTreeSet<_> = local_set.union(&remote_set).cloned().collect();
            assert_eq!(after, union);
        }
    }

    #[test]
    fn test_events_are_ordered() {
        let trees = trees(&["c", "a", "b/x", "b/y"], &["a"]);
        let (events, err) = run(&trees, ShutdownSignal::new());
        assert!(err.is_none());

        assert_eq!(events.first(), Some(&ProgressEvent::Init { total: 4 }));
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Item { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert!(matches!(events.last(), Some(ProgressEvent::Done { .. })));
        assert_eq!(
            events.iter().filter(|e| matches!(e, ProgressEvent::Done { .. })).count(),
            1
        );
    }

    #[test]
    fn test_second_run_copies_nothing() {
        let trees = trees(&["a.txt", "b/c.txt"], &[]);
        run(&trees, ShutdownSignal::new());
        let first_bytes = fs::read(trees.remote.join("a.txt")).unwrap();
        let first_mtime = fs::metadata(trees.remote.join("a.txt")).unwrap().modified().unwrap();

        let (events, err) = run(&trees, ShutdownSignal::new());
        assert!(err.is_none());
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Done {
                copied_count: 0,
                skipped_count: 2,
            })
        );
        assert_eq!(fs::read(trees.remote.join("a.txt")).unwrap(), first_bytes);
        assert_eq!(
            fs::metadata(trees.remote.join("a.txt")).unwrap().modified().unwrap(),
            first_mtime
        );
    }

    #[test]
    fn test_copied_files_keep_source_timestamps() {
        let trees = trees(&["song.mp3"], &[]);
        let mtime = filetime::FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(trees.local.join("song.mp3"), mtime).unwrap();

        run(&trees, ShutdownSignal::new());

        let meta = fs::metadata(trees.remote.join("song.mp3")).unwrap();
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta), mtime);
    }

    #[test]
    fn test_copy_failure_aborts_without_done() {
        let trees = trees(&["a.txt", "b.txt", "c.txt"], &[]);
        // A directory squatting on b.txt's destination makes that copy fail.
        write(&trees.remote, "b.txt/inner", "blocker");

        let (events, err) = run(&trees, ShutdownSignal::new());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ProgressEvent::Init { total: 3 });
        assert!(matches!(events[1], ProgressEvent::Item { index: 1, .. }));
        match err {
            Some(SyncError::Copy { path, .. }) => assert_eq!(path, PathBuf::from("b.txt")),
            other => panic!("expected copy error, got {:?}", other),
        }
        assert!(!trees.remote.join("c.txt").exists());
        assert!(trees.remote.join("a.txt").exists());
    }

    #[test]
    fn test_missing_local_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::new(
            dir.path().join("missing"),
            dir.path().join("remote"),
            ShutdownSignal::new(),
        );
        let mut run = engine.run();

        assert!(matches!(run.next(), Some(Err(SyncError::Scan { .. }))));
        assert!(run.next().is_none());
        // The remote root is created before anything is scanned.
        assert!(dir.path().join("remote").is_dir());
    }

    #[test]
    fn test_shutdown_stops_before_next_file() {
        let trees = trees(&["a", "b", "c"], &[]);
        let shutdown = ShutdownSignal::new();
        let engine = SyncEngine::new(trees.local.clone(), trees.remote.clone(), shutdown.clone());
        let mut run = engine.run();

        assert!(matches!(run.next(), Some(Ok(ProgressEvent::Init { total: 3 }))));
        assert!(matches!(run.next(), Some(Ok(ProgressEvent::Item { index: 1, .. }))));
        shutdown.request();
        assert!(run.next().is_none());
        assert!(run.next().is_none());
        assert!(!trees.remote.join("b").exists());
    }

    #[test]
    fn test_plan_partitions_by_path() {
        let local: BTreeSet<_> = ["a", "b", "c"].iter().map(|p| rel(p)).collect();
        let remote: BTreeSet<_> = ["b", "d"].iter().map(|p| rel(p)).collect();
        let plan = SyncPlan::compute(local, &remote);

        assert_eq!(plan.total, 3);
        assert_eq!(plan.to_skip, [rel("b")].into_iter().collect());
        assert_eq!(plan.to_copy, [rel("a"), rel("c")].into_iter().collect());
    }

    fn unreadable_remote(root: &Path) -> SyncResult<BTreeSet<RelativeFilePath>> {
        if root.ends_with("music") {
            return Err(SyncError::Scan {
                root: root.to_path_buf(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        scan_tree(root)
    }

    #[test]
    fn test_unreadable_remote_root_counts_as_empty() {
        let trees = trees(&["a.txt", "b/c.txt"], &["a.txt"]);
        let engine = SyncEngine::new(trees.local.clone(), trees.remote.clone(), ShutdownSignal::new())
            .with_scanner(unreadable_remote);

        let events: Vec<_> = engine.run().collect::<SyncResult<_>>().unwrap();

        assert_eq!(events.first(), Some(&ProgressEvent::Init { total: 2 }));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Done {
                copied_count: 2,
                skipped_count: 0,
            })
        );
        assert_eq!(fs::read_to_string(trees.remote.join("a.txt")).unwrap(), "local a.txt");
    }

    #[test]
    fn test_unreadable_local_root_stays_fatal() {
        let trees = trees(&["a.txt"], &[]);
        fn unreadable_local(root: &Path) -> SyncResult<BTreeSet<RelativeFilePath>> {
            if root.ends_with("local") {
                return Err(SyncError::Scan {
                    root: root.to_path_buf(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            scan_tree(root)
        }
        let engine = SyncEngine::new(trees.local.clone(), trees.remote.clone(), ShutdownSignal::new())
            .with_scanner(unreadable_local);
        let mut run = engine.run();

        assert!(matches!(run.next(), Some(Err(SyncError::Scan { .. }))));
        assert!(run.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_copy_leaves_nothing_to_skip_later() {
        let trees = trees(&["a.txt"], &[]);
        let engine = SyncEngine::new(trees.local.clone(), trees.remote.clone(), ShutdownSignal::new());
        let mut first = engine.run();
        assert!(matches!(first.next(), Some(Ok(ProgressEvent::Init { total: 1 }))));

        // Opening a directory succeeds on unix, so the copy fails mid-read.
        fs::remove_file(trees.local.join("a.txt")).unwrap();
        fs::create_dir(trees.local.join("a.txt")).unwrap();
        assert!(matches!(first.next(), Some(Err(SyncError::Copy { .. }))));
        assert!(!trees.remote.join("a.txt").exists());
        assert_eq!(fs::read_dir(&trees.remote).unwrap().count(), 0);

        fs::remove_dir(trees.local.join("a.txt")).unwrap();
        write(&trees.local, "a.txt", "real content");
        let (events, err) = run(&trees, ShutdownSignal::new());
        assert!(err.is_none());
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Done {
                copied_count: 1,
                skipped_count: 0,
            })
        );
        assert_eq!(fs::read_to_string(trees.remote.join("a.txt")).unwrap(), "real content");
    }
}
