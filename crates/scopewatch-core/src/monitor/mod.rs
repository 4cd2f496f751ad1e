//! File event monitoring
//!
//! This module provides:
//! - A monitor state machine over a native change-notification stream
//! - Latency-based coalescing of raw events into ordered batches
//! - Serialized delivery to one handler and a broadcast channel
//! - Event id tracking for resuming after a restart

mod broadcast;
mod coalescer;
mod delivery;
mod file_monitor;
mod notify_stream;
mod rescan;
mod resume;
mod stream;
#[cfg(test)]
mod testing;

pub use broadcast::{EventBroadcaster, MonitorNotification, DEFAULT_BROADCAST_CAPACITY};
pub use delivery::DeliveryContext;
pub use file_monitor::{EventHandler, FileEventMonitor};
pub use notify_stream::{NotifyStream, NotifyStreamFactory};
pub use rescan::rescan_subtree;
pub use resume::{EventIdClock, ResumeTracker};
pub use stream::{EventCallback, ScheduledCallback, StreamFactory, StreamHandle};
