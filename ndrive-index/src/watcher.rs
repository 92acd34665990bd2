//! Filesystem event source for a local sync root
//!
//! Wraps a notify watcher and turns its raw events into [`FsEvent`]s,
//! pairing the two halves of a rename into a single move.

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::errors::Result;

/// How long the first half of a rename waits for its second half.
pub const RENAME_TIMEOUT: Duration = Duration::from_millis(500);

/// A change under the watched root, with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
    /// The backend lost track of changes below this path
    Rescan(PathBuf),
}

impl FsEvent {
    /// Path the event leaves behind
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created(p) | FsEvent::Modified(p) | FsEvent::Deleted(p) | FsEvent::Rescan(p) => p,
            FsEvent::Moved { to, .. } => to,
        }
    }
}

#[derive(Debug)]
struct PendingRename {
    tracker: Option<usize>,
    from: PathBuf,
    to: Option<PathBuf>,
    at: Instant,
}

/// Pairs `From`/`To` rename halves reported by the backend.
#[derive(Debug, Default)]
pub(crate) struct RenameTracker {
    pending: Vec<PendingRename>,
}

impl RenameTracker {
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn take(&mut self, tracker: usize) -> Option<PendingRename> {
        let idx = self.pending.iter().position(|p| p.tracker == Some(tracker))?;
        Some(self.pending.remove(idx))
    }

    /// Translate one notify event.
    pub(crate) fn convert(&mut self, event: Event, now: Instant) -> Vec<FsEvent> {
        let tracker = event.attrs.tracker();
        let mut paths = event.paths;
        match event.kind {
            EventKind::Create(_) => paths.into_iter().map(FsEvent::Created).collect(),
            EventKind::Remove(_) => paths.into_iter().map(FsEvent::Deleted).collect(),
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                paths.into_iter().map(FsEvent::Modified).collect()
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for from in paths {
                        self.pending.push(PendingRename {
                            tracker,
                            from,
                            to: None,
                            at: now,
                        });
                    }
                    Vec::new()
                }
                RenameMode::To => {
                    let Some(to) = paths.pop() else {
                        return Vec::new();
                    };
                    if let Some(t) = tracker {
                        if let Some(p) = self.pending.iter_mut().find(|p| p.tracker == Some(t)) {
                            // Completed by the `Both` event that follows
                            p.to = Some(to);
                            return Vec::new();
                        }
                        return vec![FsEvent::Created(to)];
                    }
                    let untracked = self
                        .pending
                        .iter()
                        .rposition(|p| p.tracker.is_none() && p.to.is_none());
                    match untracked {
                        Some(idx) => {
                            let from = self.pending.remove(idx).from;
                            vec![FsEvent::Moved { from, to }]
                        }
                        None => vec![FsEvent::Created(to)],
                    }
                }
                RenameMode::Both if paths.len() >= 2 => {
                    if let Some(t) = tracker {
                        self.take(t);
                    }
                    let to = paths.swap_remove(1);
                    let from = paths.swap_remove(0);
                    vec![FsEvent::Moved { from, to }]
                }
                _ => paths
                    .into_iter()
                    .map(|p| {
                        if p.exists() {
                            FsEvent::Created(p)
                        } else {
                            FsEvent::Deleted(p)
                        }
                    })
                    .collect(),
            },
            EventKind::Modify(_) | EventKind::Access(_) => Vec::new(),
            EventKind::Any | EventKind::Other => paths.into_iter().map(FsEvent::Rescan).collect(),
        }
    }

    /// Resolve rename halves whose partner never came: a lone `From` is
    /// a move out of the tree.
    pub(crate) fn flush_expired(&mut self, now: Instant) -> Vec<FsEvent> {
        let mut expired = Vec::new();
        self.pending.retain_mut(|p| {
            if now.duration_since(p.at) < RENAME_TIMEOUT {
                return true;
            }
            let from = std::mem::take(&mut p.from);
            expired.push(match p.to.take() {
                Some(to) => FsEvent::Moved { from, to },
                None => FsEvent::Deleted(from),
            });
            false
        });
        expired
    }
}

/// Recursive watch on one sync root.
pub struct FsEventSource {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FsEvent>,
    renames: Arc<Mutex<RenameTracker>>,
    expired: VecDeque<FsEvent>,
}

impl FsEventSource {
    /// Start watching `root` recursively.
    pub fn watch(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();
        let renames = Arc::new(Mutex::new(RenameTracker::default()));

        let callback_renames = renames.clone();
        let callback_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    trace!("Raw event {:?}", event);
                    let events = callback_renames.lock().convert(event, Instant::now());
                    for event in events {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                    let _ = tx.send(FsEvent::Rescan(callback_root.clone()));
                }
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!("Watching {}", root.display());

        Ok(Self {
            root,
            _watcher: watcher,
            rx,
            renames,
            expired: VecDeque::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next event. `None` once the backend is gone.
    pub async fn next_event(&mut self) -> Option<FsEvent> {
        loop {
            if let Some(event) = self.expired.pop_front() {
                return Some(event);
            }
            let waiting_renames = self.renames.lock().has_pending();
            tokio::select! {
                event = self.rx.recv() => return event,
                _ = tokio::time::sleep(RENAME_TIMEOUT), if waiting_renames => {
                    let expired = self.renames.lock().flush_expired(Instant::now());
                    if !expired.is_empty() {
                        debug!("{} rename halves expired", expired.len());
                    }
                    self.expired.extend(expired);
                }
            }
        }
    }

    /// Everything already received, without waiting.
    pub fn drain_ready(&mut self) -> Vec<FsEvent> {
        let mut events: Vec<FsEvent> = self.expired.drain(..).collect();
        events.extend(self.renames.lock().flush_expired(Instant::now()));
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_basic_kinds() {
        let mut tracker = RenameTracker::default();
        let now = Instant::now();
        assert_eq!(
            tracker.convert(event(EventKind::Create(CreateKind::File), &["/r/a"]), now),
            vec![FsEvent::Created("/r/a".into())]
        );
        assert_eq!(
            tracker.convert(event(EventKind::Remove(RemoveKind::Any), &["/r/a"]), now),
            vec![FsEvent::Deleted("/r/a".into())]
        );
        assert_eq!(
            tracker.convert(
                event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/r/a"]),
                now
            ),
            vec![FsEvent::Modified("/r/a".into())]
        );
        assert!(tracker
            .convert(
                event(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)), &["/r/a"]),
                now
            )
            .is_empty());
        assert_eq!(
            tracker.convert(event(EventKind::Other, &["/r"]), now),
            vec![FsEvent::Rescan("/r".into())]
        );
    }

    #[test]
    fn test_tracked_rename_yields_one_move() {
        let mut tracker = RenameTracker::default();
        let now = Instant::now();
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/r/a"]).set_tracker(7);
        let to = event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/r/b"]).set_tracker(7);
        let both = event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/r/a", "/r/b"])
            .set_tracker(7);

        assert!(tracker.convert(from, now).is_empty());
        assert!(tracker.convert(to, now).is_empty());
        assert_eq!(
            tracker.convert(both, now),
            vec![FsEvent::Moved {
                from: "/r/a".into(),
                to: "/r/b".into()
            }]
        );
        assert!(!tracker.has_pending());
    }

    #[test]
    fn test_untracked_halves_pair_up() {
        let mut tracker = RenameTracker::default();
        let now = Instant::now();
        tracker.convert(event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/r/a"]), now);
        assert_eq!(
            tracker.convert(event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/r/b"]), now),
            vec![FsEvent::Moved {
                from: "/r/a".into(),
                to: "/r/b".into()
            }]
        );
        // A move into the tree has no first half
        assert_eq!(
            tracker.convert(event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/r/c"]), now),
            vec![FsEvent::Created("/r/c".into())]
        );
    }

    #[test]
    fn test_lone_from_expires_as_delete() {
        let mut tracker = RenameTracker::default();
        let start = Instant::now();
        let from = event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/r/a"]).set_tracker(3);
        tracker.convert(from, start);

        assert!(tracker.flush_expired(start).is_empty());
        assert_eq!(
            tracker.flush_expired(start + RENAME_TIMEOUT),
            vec![FsEvent::Deleted("/r/a".into())]
        );
        assert!(!tracker.has_pending());
    }

    #[tokio::test]
    async fn test_watch_reports_creation() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut source = FsEventSource::watch(&root).unwrap();
        assert_eq!(source.root(), root.as_path());

        let file = root.join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();

        let found = timeout(Duration::from_secs(5), async {
            while let Some(event) = source.next_event().await {
                if event == FsEvent::Created(file.clone()) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found);
    }
}
