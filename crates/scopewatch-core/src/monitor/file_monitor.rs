//! File event monitor: lifecycle state machine and delivery bridge

use super::broadcast::{EventBroadcaster, MonitorNotification};
use super::delivery::DeliveryContext;
use super::notify_stream::NotifyStreamFactory;
use super::resume::ResumeTracker;
use super::stream::{EventCallback, StreamFactory, StreamHandle};
use crate::error::Result;
use crate::types::{
    CoalescedBatch, FlushMode, MonitorConfig, MonitorId, MonitorState, RawEvent, ResumePoint,
};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Receives every batch a monitor delivers, on its delivery context
pub type EventHandler = Arc<dyn Fn(&CoalescedBatch) + Send + Sync>;

/// What the dispatch gate does with an arriving batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Not started: keep the batch for the next start
    Held,
    Open,
    /// Invalidated: drop the batch
    Closed,
}

/// State reachable from the stream callback
struct MonitorShared {
    id: MonitorId,
    /// Locked for the whole of a dispatch and by every lifecycle transition
    gate: ReentrantMutex<Cell<Gate>>,
    held: Mutex<Vec<Vec<RawEvent>>>,
    handler: Mutex<Option<EventHandler>>,
    broadcaster: EventBroadcaster,
    resume: Mutex<ResumeTracker>,
}

impl MonitorShared {
    fn dispatch(&self, events: Vec<RawEvent>) {
        let gate = self.gate.lock();
        match gate.get() {
            Gate::Open => {}
            Gate::Held => {
                debug!("Holding {} events for stopped monitor {}", events.len(), self.id);
                self.held.lock().push(events);
                return;
            }
            Gate::Closed => {
                debug!("Discarding batch for invalidated monitor {}", self.id);
                return;
            }
        }

        let batch = Arc::new(CoalescedBatch::from(events));
        self.resume.lock().observe(&batch);

        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(&batch);
        }

        // The handler may have invalidated the monitor
        if gate.get() == Gate::Closed {
            return;
        }
        self.broadcaster.publish(MonitorNotification {
            monitor: self.id,
            events: batch,
        });
    }

    /// Re-post batches held while stopped, ahead of anything the stream sends next
    fn release_held(self: &Arc<Self>, context: &DeliveryContext) {
        let held = std::mem::take(&mut *self.held.lock());
        for events in held {
            let weak = Arc::downgrade(self);
            context.post(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.dispatch(events);
                }
            });
        }
    }
}

/// Watches a set of paths and delivers coalesced batches of changes.
///
/// Batches reach the registered handler, then the broadcaster, on one
/// delivery context. Dropping the monitor invalidates it.
pub struct FileEventMonitor {
    config: MonitorConfig,
    state: MonitorState,
    stream: Option<Box<dyn StreamHandle>>,
    context: DeliveryContext,
    shared: Arc<MonitorShared>,
}

impl FileEventMonitor {
    /// Create a monitor on the notify backend, scheduled on the main context
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_backend(
            config,
            &NotifyStreamFactory::default(),
            DeliveryContext::main()?,
            EventBroadcaster::shared(),
        )
    }

    pub fn with_backend(
        config: MonitorConfig,
        factory: &dyn StreamFactory,
        context: DeliveryContext,
        broadcaster: EventBroadcaster,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(MonitorShared {
            id: MonitorId::new(),
            gate: ReentrantMutex::new(Cell::new(Gate::Held)),
            held: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            broadcaster,
            resume: Mutex::new(ResumeTracker::new()),
        });

        let weak = Arc::downgrade(&shared);
        let callback: EventCallback = Arc::new(move |events: Vec<RawEvent>| {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(events);
            }
        });

        let mut stream = factory.create(&config, callback)?;
        *shared.resume.lock() = ResumeTracker::from_point(stream.since_when());
        stream.schedule(&context);

        info!(
            "Created monitor {} for {} paths on {}",
            shared.id,
            config.paths().len(),
            context.name()
        );

        Ok(Self {
            config,
            state: MonitorState::Created,
            stream: Some(stream),
            context,
            shared,
        })
    }

    pub fn id(&self) -> MonitorId {
        self.shared.id
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn is_monitoring(&self) -> bool {
        self.state == MonitorState::Started
    }

    pub fn is_valid(&self) -> bool {
        self.state != MonitorState::Invalidated
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn paths(&self) -> &[PathBuf] {
        self.config.paths()
    }

    /// Register the single handler, replacing any previous one
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(&CoalescedBatch) + Send + Sync + 'static,
    {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    /// Listen to the broadcaster this monitor publishes to.
    ///
    /// The receiver sees batches from every monitor sharing the broadcaster;
    /// filter on [`MonitorNotification::monitor`].
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorNotification> {
        self.shared.broadcaster.subscribe()
    }

    /// Where a replacement monitor should resume from
    pub fn resume_point(&self) -> ResumePoint {
        self.shared.resume.lock().resume_point()
    }

    /// Begin delivering events; only acts in `Created` or `Stopped`.
    ///
    /// Batches held back while stopped are delivered first.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, MonitorState::Created | MonitorState::Stopped) {
            return Ok(());
        }
        let gate = self.shared.gate.lock();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        gate.set(Gate::Open);
        self.shared.release_held(&self.context);
        if let Err(e) = stream.start() {
            gate.set(Gate::Held);
            return Err(e);
        }
        self.state = MonitorState::Started;
        info!("Started monitor {}", self.shared.id);
        Ok(())
    }

    /// Stop delivering events; only acts in `Started`.
    ///
    /// Batches already on their way are held until the next `start`.
    pub fn stop(&mut self) {
        if self.state != MonitorState::Started {
            return;
        }
        let gate = self.shared.gate.lock();
        if let Some(stream) = self.stream.as_mut() {
            stream.stop();
        }
        gate.set(Gate::Held);
        self.state = MonitorState::Stopped;
        info!("Stopped monitor {}", self.shared.id);
    }

    /// Push pending events through; only acts in `Started`.
    ///
    /// `Sync` returns once every event queued before the call has been
    /// handed to the handler. Called from the handler itself, it cannot wait
    /// for its own delivery and behaves like `Async`.
    pub fn flush(&mut self, mode: FlushMode) {
        if self.state != MonitorState::Started {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        stream.flush(mode);
        if mode == FlushMode::Sync {
            self.context.sync();
        }
    }

    /// Stop, unschedule and release the stream. Idempotent.
    ///
    /// No batch is dispatched to the handler or broadcaster after this returns.
    pub fn invalidate(&mut self) {
        if self.state == MonitorState::Invalidated {
            return;
        }

        let gate = self.shared.gate.lock();
        if let Some(mut stream) = self.stream.take() {
            if self.state == MonitorState::Started {
                stream.stop();
            }
            stream.unschedule();
            stream.invalidate();
        }
        gate.set(Gate::Closed);
        drop(gate);
        self.shared.held.lock().clear();

        self.state = MonitorState::Invalidated;
        info!("Invalidated monitor {}", self.shared.id);
    }
}

impl Drop for FileEventMonitor {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for FileEventMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventMonitor")
            .field("id", &self.shared.id)
            .field("state", &self.state)
            .field("paths", &self.config.paths())
            .finish()
    }
}
