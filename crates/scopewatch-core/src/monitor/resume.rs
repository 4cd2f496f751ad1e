//! Event id allocation and resume point tracking

use crate::types::{EventFlags, RawEvent, ResumePoint};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
struct ClockState {
    last: u64,
    wrapped: bool,
}

/// Monotonic source of event ids shared by every stream of a backend.
///
/// Id 0 is reserved for root-changed events. When the counter passes
/// `u64::MAX` it restarts at 1 and reports the wrap once.
#[derive(Debug)]
pub struct EventIdClock {
    state: Mutex<ClockState>,
}

static SHARED_CLOCK: Lazy<Arc<EventIdClock>> = Lazy::new(|| Arc::new(EventIdClock::new()));

impl EventIdClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A clock whose last issued id is `last`
    pub fn starting_at(last: u64) -> Self {
        Self {
            state: Mutex::new(ClockState {
                last,
                wrapped: false,
            }),
        }
    }

    pub fn shared() -> Arc<Self> {
        SHARED_CLOCK.clone()
    }

    /// Most recently issued id
    pub fn current(&self) -> u64 {
        self.state.lock().last
    }

    /// Whether the id space wrapped during this clock's lifetime
    pub fn has_wrapped(&self) -> bool {
        self.state.lock().wrapped
    }

    /// Issue the next id, and whether issuing it wrapped the id space
    pub fn next_id(&self) -> (u64, bool) {
        let mut state = self.state.lock();
        if state.last == u64::MAX {
            state.last = 1;
            state.wrapped = true;
            warn!("Event id space wrapped");
            (1, true)
        } else {
            state.last += 1;
            (state.last, false)
        }
    }

    /// Map a requested resume point onto this clock.
    ///
    /// An id newer than the clock advances it, unless the id space has wrapped
    /// since, in which case the id predates the wrap and resolves to `FromNow`.
    pub fn resolve(&self, requested: ResumePoint) -> ResumePoint {
        let ResumePoint::SequenceId(id) = requested else {
            return ResumePoint::FromNow;
        };

        let mut state = self.state.lock();
        if id > state.last {
            if state.wrapped {
                warn!(
                    "Resume id {} predates an id wraparound; resuming from now",
                    id
                );
                return ResumePoint::FromNow;
            }
            debug!("Advancing event id clock to {}", id);
            state.last = id;
        }
        ResumePoint::SequenceId(id)
    }
}

impl Default for EventIdClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Remembers where a consumer should resume after a restart.
///
/// A batch carrying the ids-wrapped flag discards the stored id.
#[derive(Debug, Clone, Default)]
pub struct ResumeTracker {
    last_id: Option<u64>,
}

impl ResumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker with a previously persisted resume point
    pub fn from_point(point: ResumePoint) -> Self {
        match point {
            ResumePoint::FromNow => Self::default(),
            ResumePoint::SequenceId(id) => Self { last_id: Some(id) },
        }
    }

    pub fn observe(&mut self, events: &[RawEvent]) {
        if events.iter().any(|e| e.flags.contains(EventFlags::EVENT_IDS_WRAPPED)) {
            debug!("Discarding stored resume id after wraparound");
            self.last_id = None;
            return;
        }

        // Root-changed events carry id 0 and say nothing about progress
        if let Some(max) = events.iter().map(|e| e.id).filter(|id| *id != 0).max() {
            self.last_id = Some(self.last_id.map_or(max, |last| last.max(max)));
        }
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.last_id
            .map(ResumePoint::SequenceId)
            .unwrap_or(ResumePoint::FromNow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clock_issues_increasing_ids() {
        let clock = EventIdClock::new();
        assert_eq!(clock.next_id(), (1, false));
        assert_eq!(clock.next_id(), (2, false));
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn test_clock_wraps_past_max() {
        let clock = EventIdClock::starting_at(u64::MAX - 1);
        assert_eq!(clock.next_id(), (u64::MAX, false));
        assert_eq!(clock.next_id(), (1, true));
        assert_eq!(clock.next_id(), (2, false));
        assert!(clock.has_wrapped());
    }

    #[test]
    fn test_resolve_advances_clock_before_wrap() {
        let clock = EventIdClock::new();
        assert_eq!(
            clock.resolve(ResumePoint::SequenceId(500)),
            ResumePoint::SequenceId(500)
        );
        assert_eq!(clock.next_id(), (501, false));
    }

    #[test]
    fn test_resolve_after_wrap_treats_newer_id_as_stale() {
        let clock = EventIdClock::starting_at(u64::MAX);
        clock.next_id();

        assert_eq!(
            clock.resolve(ResumePoint::SequenceId(u64::MAX - 10)),
            ResumePoint::FromNow
        );
        assert_eq!(clock.resolve(ResumePoint::SequenceId(1)), ResumePoint::SequenceId(1));
        assert_eq!(clock.resolve(ResumePoint::FromNow), ResumePoint::FromNow);
    }

    #[test]
    fn test_tracker_follows_latest_id() {
        let mut tracker = ResumeTracker::new();
        assert_eq!(tracker.resume_point(), ResumePoint::FromNow);

        tracker.observe(&[
            RawEvent::new("/a", EventFlags::ITEM_CREATED, 7),
            RawEvent::new("/a", EventFlags::ROOT_CHANGED, 0),
            RawEvent::new("/b", EventFlags::ITEM_CREATED, 9),
        ]);
        assert_eq!(tracker.resume_point(), ResumePoint::SequenceId(9));
    }

    #[test]
    fn test_tracker_forgets_id_on_wrap() {
        let mut tracker = ResumeTracker::from_point(ResumePoint::SequenceId(100));

        tracker.observe(&[RawEvent::new(
            "/a",
            EventFlags::ITEM_CREATED | EventFlags::EVENT_IDS_WRAPPED,
            1,
        )]);
        assert_eq!(tracker.resume_point(), ResumePoint::FromNow);

        tracker.observe(&[RawEvent::new("/a", EventFlags::ITEM_MODIFIED, 2)]);
        assert_eq!(tracker.resume_point(), ResumePoint::SequenceId(2));
    }
}
