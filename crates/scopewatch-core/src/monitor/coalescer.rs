//! Latency window policy that groups raw events into batches

use crate::types::RawEvent;
use std::time::{Duration, Instant};

/// Groups incoming events into batches according to the latency window.
///
/// Deferred mode: the first event after a quiet period opens a window of
/// `latency`; everything arriving inside it is delivered together when it
/// closes. No-defer mode: the first event after a quiet period is delivered at
/// once, later ones wait until `latency` has passed since that delivery.
///
/// Events for a path already pending in the window are merged into the pending
/// entry (flags OR-ed, position and id kept).
#[derive(Debug)]
pub(crate) struct Coalescer {
    latency: Duration,
    no_defer: bool,
    pending: Vec<RawEvent>,
    deadline: Option<Instant>,
    last_flush: Option<Instant>,
}

impl Coalescer {
    pub fn new(latency: Duration, no_defer: bool) -> Self {
        Self {
            latency,
            no_defer,
            pending: Vec::new(),
            deadline: None,
            last_flush: None,
        }
    }

    /// When the pending window closes, if one is open
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Keep events pending without opening a window; used while paused
    pub fn hold(&mut self, events: Vec<RawEvent>) {
        for event in events {
            self.merge(event);
        }
        self.deadline = None;
    }

    /// Add events; returns a batch when it must be delivered immediately
    pub fn push(&mut self, events: Vec<RawEvent>, now: Instant) -> Option<Vec<RawEvent>> {
        if events.is_empty() {
            return None;
        }
        for event in events {
            self.merge(event);
        }

        if self.deadline.is_some() {
            return None;
        }

        if self.no_defer {
            let quiet = self
                .last_flush
                .map_or(true, |last| now.saturating_duration_since(last) >= self.latency);
            if quiet {
                return self.take(now);
            }
            self.deadline = self.last_flush.map(|last| last + self.latency);
        } else {
            self.deadline = Some(now + self.latency);
        }
        None
    }

    /// Deliver the pending batch if its window has closed
    pub fn poll(&mut self, now: Instant) -> Option<Vec<RawEvent>> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.take(now),
            _ => None,
        }
    }

    /// Deliver whatever is pending regardless of the window
    pub fn drain(&mut self, now: Instant) -> Option<Vec<RawEvent>> {
        self.take(now)
    }

    fn merge(&mut self, event: RawEvent) {
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|pending| pending.path == event.path && pending.id != 0 && event.id != 0)
        {
            existing.flags |= event.flags;
            return;
        }
        self.pending.push(event);
    }

    fn take(&mut self, now: Instant) -> Option<Vec<RawEvent>> {
        self.deadline = None;
        if self.pending.is_empty() {
            return None;
        }
        self.last_flush = Some(now);
        Some(std::mem::take(&mut self.pending))
    }
}
