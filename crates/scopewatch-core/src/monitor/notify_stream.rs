//! Native stream backed by the `notify` crate

use super::coalescer::Coalescer;
use super::delivery::DeliveryContext;
use super::resume::EventIdClock;
use super::stream::{EventCallback, ScheduledCallback, StreamFactory, StreamHandle};
use crate::error::{Error, MonitorError, Result};
use crate::types::{
    CreateFlags, EventFlags, FlushMode, MonitorConfig, RawEvent, ResumePoint, WatchScope,
};
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Creates [`NotifyStream`]s that share one event id clock
#[derive(Debug, Clone)]
pub struct NotifyStreamFactory {
    clock: Arc<EventIdClock>,
}

impl NotifyStreamFactory {
    pub fn new() -> Self {
        Self::with_clock(EventIdClock::shared())
    }

    pub fn with_clock(clock: Arc<EventIdClock>) -> Self {
        Self { clock }
    }
}

impl Default for NotifyStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFactory for NotifyStreamFactory {
    fn create(&self, config: &MonitorConfig, callback: EventCallback) -> Result<Box<dyn StreamHandle>> {
        let stream = NotifyStream::create(config, Arc::clone(&self.clock), callback)?;
        Ok(Box::new(stream))
    }
}

/// A watched path as configured and as resolved on disk
#[derive(Debug, Clone)]
struct Root {
    given: PathBuf,
    canonical: PathBuf,
}

enum StreamInput {
    Raw(notify::Result<notify::Event>),
    Flush(Option<mpsc::Sender<()>>),
    Pause,
    Resume,
    HistoryDone,
    Shutdown,
}

/// Event stream over a `notify` watcher.
///
/// A worker thread translates raw notifications into [`RawEvent`]s, applies
/// the latency window and posts batches to the scheduled delivery context.
/// While stopped the worker holds pending events and posts nothing; they go
/// out on the next start.
pub struct NotifyStream {
    roots: Vec<Root>,
    watch_root: bool,
    watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
    since_when: ResumePoint,
    history_pending: bool,
    control: mpsc::Sender<StreamInput>,
    worker: Option<JoinHandle<()>>,
    target: Arc<ScheduledCallback>,
}

impl NotifyStream {
    /// Create the subscription; fails if any path cannot be watched
    pub fn create(
        config: &MonitorConfig,
        clock: Arc<EventIdClock>,
        callback: EventCallback,
    ) -> Result<Self> {
        config.validate()?;

        let roots = config
            .paths()
            .iter()
            .map(|path| {
                let canonical = path.canonicalize().map_err(|e| {
                    Error::Monitor(MonitorError::PathNotWatchable(format!("{:?}: {}", path, e)))
                })?;
                Ok(Root {
                    given: path.clone(),
                    canonical,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        check_scope(config.scope(), &roots)?;

        let flags = config.flags();
        for (flag, name) in [
            (CreateFlags::IGNORE_SELF, "ignore-self"),
            (CreateFlags::MARK_SELF, "mark-self"),
            (CreateFlags::USE_EXTENDED_DATA, "use-extended-data"),
        ] {
            if flags.contains(flag) {
                debug!("Create flag {} is not supported by the notify backend", name);
            }
        }

        let since_when = clock.resolve(config.resume());

        let (control, inputs) = mpsc::channel();
        let raw_tx = control.clone();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(StreamInput::Raw(res));
            },
            Config::default(),
        )
        .map_err(|e| Error::Monitor(MonitorError::StreamCreation(e.to_string())))?;

        let target = ScheduledCallback::new(callback);
        let worker = Worker {
            roots: roots.clone(),
            file_events: flags.contains(CreateFlags::FILE_EVENTS),
            watch_root: flags.contains(CreateFlags::WATCH_ROOT),
            clock,
            coalescer: Coalescer::new(config.latency(), flags.contains(CreateFlags::NO_DEFER)),
            target: Arc::clone(&target),
            paused: true,
        };
        let worker = thread::Builder::new()
            .name("scopewatch-stream".to_string())
            .spawn(move || worker.run(inputs))
            .map_err(|e| Error::Monitor(MonitorError::StreamCreation(e.to_string())))?;

        info!("Created event stream for {} paths", roots.len());

        Ok(Self {
            roots,
            watch_root: flags.contains(CreateFlags::WATCH_ROOT),
            watcher,
            watched: Vec::new(),
            history_pending: matches!(since_when, ResumePoint::SequenceId(_)),
            since_when,
            control,
            worker: Some(worker),
            target,
        })
    }

    fn unwatch_all(&mut self) {
        for path in self.watched.drain(..) {
            if let Err(e) = self.watcher.unwatch(&path) {
                debug!("Failed to unwatch {:?}: {}", path, e);
            }
        }
    }

    /// Parents of the roots, watched non-recursively to see a root move
    fn root_parents(&self) -> Vec<PathBuf> {
        let mut parents: Vec<PathBuf> = Vec::new();
        for root in &self.roots {
            let Some(parent) = root.canonical.parent() else {
                continue;
            };
            let covered = self
                .roots
                .iter()
                .any(|other| parent.starts_with(&other.canonical));
            if !covered && !parents.iter().any(|p| p == parent) {
                parents.push(parent.to_path_buf());
            }
        }
        parents
    }
}

impl StreamHandle for NotifyStream {
    fn schedule(&mut self, context: &DeliveryContext) {
        self.target.schedule(context);
    }

    fn start(&mut self) -> Result<()> {
        if !self.watched.is_empty() {
            return Ok(());
        }

        for index in 0..self.roots.len() {
            let path = self.roots[index].canonical.clone();
            if let Err(e) = self.watcher.watch(&path, RecursiveMode::Recursive) {
                self.unwatch_all();
                return Err(Error::Monitor(MonitorError::StartFailed(format!(
                    "{:?}: {}",
                    path, e
                ))));
            }
            self.watched.push(path);
        }

        if self.watch_root {
            for parent in self.root_parents() {
                match self.watcher.watch(&parent, RecursiveMode::NonRecursive) {
                    Ok(()) => self.watched.push(parent),
                    Err(e) => warn!("Cannot watch root parent {:?}: {}", parent, e),
                }
            }
        }

        let _ = self.control.send(StreamInput::Resume);

        if self.history_pending {
            self.history_pending = false;
            let _ = self.control.send(StreamInput::HistoryDone);
        }

        debug!("Event stream started");
        Ok(())
    }

    fn stop(&mut self) {
        self.unwatch_all();
        let _ = self.control.send(StreamInput::Pause);
        debug!("Event stream stopped");
    }

    fn flush(&mut self, mode: FlushMode) {
        match mode {
            FlushMode::Async => {
                let _ = self.control.send(StreamInput::Flush(None));
            }
            FlushMode::Sync => {
                let (ack_tx, ack_rx) = mpsc::channel();
                if self.control.send(StreamInput::Flush(Some(ack_tx))).is_ok() {
                    let _ = ack_rx.recv();
                }
            }
        }
    }

    fn unschedule(&mut self) {
        self.target.unschedule();
    }

    fn invalidate(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.unwatch_all();
        let _ = self.control.send(StreamInput::Shutdown);
        if worker.join().is_err() {
            error!("Event stream worker panicked");
        }
        self.target.unschedule();
        debug!("Event stream invalidated");
    }

    fn since_when(&self) -> ResumePoint {
        self.since_when
    }
}

impl Drop for NotifyStream {
    fn drop(&mut self) {
        self.invalidate();
    }
}

#[cfg(unix)]
fn check_scope(scope: WatchScope, roots: &[Root]) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let WatchScope::Device(expected) = scope else {
        return Ok(());
    };
    for root in roots {
        let actual = std::fs::metadata(&root.canonical)?.dev();
        if actual != expected {
            return Err(Error::Monitor(MonitorError::DeviceMismatch {
                path: root.given.clone(),
                expected,
                actual,
            }));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_scope(scope: WatchScope, _roots: &[Root]) -> Result<()> {
    match scope {
        WatchScope::Host => Ok(()),
        WatchScope::Device(_) => Err(Error::Monitor(MonitorError::DeviceScopeUnsupported)),
    }
}

struct Worker {
    roots: Vec<Root>,
    file_events: bool,
    watch_root: bool,
    clock: Arc<EventIdClock>,
    coalescer: Coalescer,
    target: Arc<ScheduledCallback>,
    paused: bool,
}

impl Worker {
    fn run(mut self, inputs: mpsc::Receiver<StreamInput>) {
        loop {
            let deadline = if self.paused {
                None
            } else {
                self.coalescer.deadline()
            };
            let input = match deadline {
                Some(deadline) => {
                    match inputs.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(input) => input,
                        Err(RecvTimeoutError::Timeout) => {
                            self.deliver_due();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inputs.recv() {
                    Ok(input) => input,
                    Err(_) => break,
                },
            };

            match input {
                StreamInput::Raw(Ok(event)) => {
                    let events = self.translate(event);
                    self.push(events);
                }
                StreamInput::Raw(Err(err)) => {
                    warn!("Watch error: {}", err);
                    let events = self.dropped(err);
                    self.push(events);
                }
                StreamInput::Flush(ack) => {
                    if !self.paused {
                        if let Some(batch) = self.coalescer.drain(Instant::now()) {
                            self.target.post(batch);
                        }
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                StreamInput::Pause => self.paused = true,
                StreamInput::Resume => {
                    self.paused = false;
                    if let Some(batch) = self.coalescer.drain(Instant::now()) {
                        debug!("Posting {} events held while stopped", batch.len());
                        self.target.post(batch);
                    }
                }
                StreamInput::HistoryDone => {
                    if let Some(batch) = self.coalescer.drain(Instant::now()) {
                        self.target.post(batch);
                    }
                    let sentinel =
                        RawEvent::new(PathBuf::new(), EventFlags::HISTORY_DONE, self.clock.current());
                    self.target.post(vec![sentinel]);
                }
                StreamInput::Shutdown => break,
            }

            self.deliver_due();
        }
        debug!("Event stream worker exiting");
    }

    fn push(&mut self, events: Vec<RawEvent>) {
        if self.paused {
            self.coalescer.hold(events);
            return;
        }
        if let Some(batch) = self.coalescer.push(events, Instant::now()) {
            self.target.post(batch);
        }
    }

    fn deliver_due(&mut self) {
        if self.paused {
            return;
        }
        if let Some(batch) = self.coalescer.poll(Instant::now()) {
            self.target.post(batch);
        }
    }

    fn stamp(&self, path: PathBuf, mut flags: EventFlags) -> RawEvent {
        let (id, wrapped) = self.clock.next_id();
        if wrapped {
            flags |= EventFlags::EVENT_IDS_WRAPPED;
        }
        RawEvent::new(path, flags, id)
    }

    /// Map a path on disk back onto the root it was configured under
    fn report_path(&self, path: &Path) -> Option<PathBuf> {
        self.roots.iter().find_map(|root| {
            path.strip_prefix(&root.canonical).ok().map(|rest| {
                if rest.as_os_str().is_empty() {
                    root.given.clone()
                } else {
                    root.given.join(rest)
                }
            })
        })
    }

    fn is_root(&self, path: &Path) -> Option<&Root> {
        self.roots.iter().find(|root| root.canonical == path)
    }

    fn translate(&self, event: notify::Event) -> Vec<RawEvent> {
        if event.need_rescan() {
            return self.rescan_events(&event.paths, EventFlags::KERNEL_DROPPED);
        }

        let Some(kind_flags) = kind_flags(&event.kind) else {
            return Vec::new();
        };

        let root_lost = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
        );

        let mut out: Vec<RawEvent> = Vec::new();
        for path in &event.paths {
            if self.watch_root && root_lost {
                if let Some(root) = self.is_root(path) {
                    out.push(RawEvent::new(root.given.clone(), EventFlags::ROOT_CHANGED, 0));
                    continue;
                }
            }

            let Some(reported) = self.report_path(path) else {
                continue;
            };

            if self.file_events {
                let flags = kind_flags | item_type(&event.kind, path);
                out.push(self.stamp(reported, flags));
            } else {
                let directory = match self.is_root(path) {
                    Some(root) => root.given.clone(),
                    None => reported
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| reported.clone()),
                };
                if !out.iter().any(|e| e.path == directory) {
                    out.push(self.stamp(directory, EventFlags::NONE));
                }
            }
        }
        out
    }

    fn dropped(&self, err: notify::Error) -> Vec<RawEvent> {
        self.rescan_events(&err.paths, EventFlags::USER_DROPPED)
    }

    /// Rescan signals for `paths`, or for every root when none are known
    fn rescan_events(&self, paths: &[PathBuf], companion: EventFlags) -> Vec<RawEvent> {
        let flags = EventFlags::MUST_SCAN_SUB_DIRS | companion;
        let reported: Vec<PathBuf> = paths
            .iter()
            .filter_map(|path| self.report_path(path))
            .collect();
        let targets = if reported.is_empty() {
            self.roots.iter().map(|root| root.given.clone()).collect()
        } else {
            reported
        };
        targets
            .into_iter()
            .map(|path| self.stamp(path, flags))
            .collect()
    }
}

fn kind_flags(kind: &EventKind) -> Option<EventFlags> {
    let flags = match kind {
        EventKind::Create(_) => EventFlags::ITEM_CREATED,
        EventKind::Remove(_) => EventFlags::ITEM_REMOVED,
        EventKind::Modify(ModifyKind::Name(_)) => EventFlags::ITEM_RENAMED,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => {
            EventFlags::ITEM_CHANGE_OWNER
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => {
            EventFlags::ITEM_XATTR_MOD
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => EventFlags::ITEM_INODE_META_MOD,
        EventKind::Modify(_) => EventFlags::ITEM_MODIFIED,
        EventKind::Access(_) => return None,
        EventKind::Any | EventKind::Other => EventFlags::NONE,
    };
    Some(flags)
}

fn item_type(kind: &EventKind, path: &Path) -> EventFlags {
    match kind {
        EventKind::Create(CreateKind::File) | EventKind::Remove(RemoveKind::File) => {
            EventFlags::ITEM_IS_FILE
        }
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            EventFlags::ITEM_IS_DIR
        }
        _ => match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => EventFlags::ITEM_IS_SYMLINK,
            Ok(meta) if meta.is_dir() => EventFlags::ITEM_IS_DIR,
            Ok(_) => EventFlags::ITEM_IS_FILE,
            Err(_) => EventFlags::NONE,
        },
    }
}
