//! Core type definitions for Scopewatch
//!
//! This module contains the shared types used by the bookmark store and the
//! file event monitor: capability tokens, event flags, raw events, batches and
//! monitor configuration.

mod bookmark_types;
mod event_types;
mod monitor_types;

pub use bookmark_types::*;
pub use event_types::*;
pub use monitor_types::*;
