//! In-memory stream backend for exercising monitors without the OS

use super::delivery::DeliveryContext;
use super::stream::{EventCallback, ScheduledCallback, StreamFactory, StreamHandle};
use crate::error::{Error, MonitorError, Result};
use crate::types::{FlushMode, MonitorConfig, RawEvent, ResumePoint};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct ProbeInner {
    log: Mutex<Vec<&'static str>>,
    target: Mutex<Option<Arc<ScheduledCallback>>>,
    queued: Mutex<Vec<RawEvent>>,
    started: Mutex<bool>,
}

/// Test-side handle onto the streams a [`ManualStreamFactory`] created
#[derive(Clone, Default)]
pub struct ManualProbe {
    inner: Arc<ProbeInner>,
}

impl ManualProbe {
    /// Lifecycle calls received by the stream, in order
    pub fn log(&self) -> Vec<&'static str> {
        self.inner.log.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.inner.log.lock().iter().filter(|c| **c == call).count()
    }

    /// Post a batch as the native service would; ignored unless started
    pub fn emit(&self, events: Vec<RawEvent>) -> bool {
        if !*self.inner.started.lock() {
            return false;
        }
        match self.inner.target.lock().as_ref() {
            Some(target) => target.post(events),
            None => false,
        }
    }

    /// Hold events inside the stream until it is flushed
    pub fn queue(&self, events: Vec<RawEvent>) {
        self.inner.queued.lock().extend(events);
    }
}

pub struct ManualStreamFactory {
    probe: ManualProbe,
    fail: bool,
}

impl ManualStreamFactory {
    pub fn new() -> (Self, ManualProbe) {
        let probe = ManualProbe::default();
        (
            Self {
                probe: probe.clone(),
                fail: false,
            },
            probe,
        )
    }

    pub fn failing() -> Self {
        Self {
            probe: ManualProbe::default(),
            fail: true,
        }
    }
}

impl StreamFactory for ManualStreamFactory {
    fn create(&self, config: &MonitorConfig, callback: EventCallback) -> Result<Box<dyn StreamHandle>> {
        if self.fail {
            return Err(Error::Monitor(MonitorError::StreamCreation(
                "manual failure".to_string(),
            )));
        }
        let target = ScheduledCallback::new(callback);
        *self.probe.inner.target.lock() = Some(Arc::clone(&target));
        Ok(Box::new(ManualStream {
            probe: self.probe.clone(),
            target,
            since_when: config.resume(),
        }))
    }
}

struct ManualStream {
    probe: ManualProbe,
    target: Arc<ScheduledCallback>,
    since_when: ResumePoint,
}

impl ManualStream {
    fn record(&self, call: &'static str) {
        self.probe.inner.log.lock().push(call);
    }
}

impl StreamHandle for ManualStream {
    fn schedule(&mut self, context: &DeliveryContext) {
        self.record("schedule");
        self.target.schedule(context);
    }

    fn start(&mut self) -> Result<()> {
        self.record("start");
        *self.probe.inner.started.lock() = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.record("stop");
        *self.probe.inner.started.lock() = false;
    }

    fn flush(&mut self, _mode: FlushMode) {
        self.record("flush");
        let queued = std::mem::take(&mut *self.probe.inner.queued.lock());
        self.target.post(queued);
    }

    fn unschedule(&mut self) {
        self.record("unschedule");
        self.target.unschedule();
    }

    fn invalidate(&mut self) {
        self.record("invalidate");
    }

    fn since_when(&self) -> ResumePoint {
        self.since_when
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.record("release");
    }
}
