//! Contract between a monitor and the native change-notification service

use super::delivery::DeliveryContext;
use crate::error::Result;
use crate::types::{FlushMode, MonitorConfig, RawEvent, ResumePoint};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Receives one batch, always on the context the stream is scheduled on
pub type EventCallback = Arc<dyn Fn(Vec<RawEvent>) + Send + Sync>;

/// A native subscription.
///
/// Lifecycle: created by a [`StreamFactory`], then `schedule`, `start`,
/// batches through the callback, `stop` (and possibly `start` again),
/// `unschedule`, `invalidate`, and finally release by dropping.
pub trait StreamHandle: Send {
    /// Route future batches onto `context`
    fn schedule(&mut self, context: &DeliveryContext);

    /// Ask the service to start sending events
    fn start(&mut self) -> Result<()>;

    /// Ask the service to stop sending events; a later `start` resumes
    fn stop(&mut self);

    /// Push pending events to the callback now.
    ///
    /// `Sync` returns only after they have been handed to the delivery context.
    fn flush(&mut self, mode: FlushMode);

    /// Stop routing batches to the delivery context
    fn unschedule(&mut self);

    /// Tear the subscription down; no batch is posted afterwards
    fn invalidate(&mut self);

    /// The resume point this stream actually started from
    fn since_when(&self) -> ResumePoint;
}

/// Creates native subscriptions
pub trait StreamFactory: Send + Sync {
    fn create(&self, config: &MonitorConfig, callback: EventCallback) -> Result<Box<dyn StreamHandle>>;
}

/// A callback plus the delivery context it is currently scheduled on.
///
/// Native threads call [`ScheduledCallback::post`]; the batch runs on the
/// context, or is dropped while unscheduled.
pub struct ScheduledCallback {
    callback: EventCallback,
    context: Mutex<Option<DeliveryContext>>,
}

impl ScheduledCallback {
    pub fn new(callback: EventCallback) -> Arc<Self> {
        Arc::new(Self {
            callback,
            context: Mutex::new(None),
        })
    }

    pub fn schedule(&self, context: &DeliveryContext) {
        debug!("Scheduling stream on {}", context.name());
        *self.context.lock() = Some(context.clone());
    }

    pub fn unschedule(&self) {
        *self.context.lock() = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.context.lock().is_some()
    }

    /// Hand `events` to the delivery context; returns false if dropped
    pub fn post(&self, events: Vec<RawEvent>) -> bool {
        if events.is_empty() {
            return false;
        }
        let Some(context) = self.context.lock().clone() else {
            trace!("Dropping {} events from unscheduled stream", events.len());
            return false;
        };
        let callback = Arc::clone(&self.callback);
        context.post(move || callback(events))
    }
}
