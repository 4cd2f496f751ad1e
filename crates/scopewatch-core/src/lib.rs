//! Scopewatch Core Library
//!
//! This crate provides:
//! - Persisted capability grants with balanced access scopes
//! - File event monitoring with coalesced, ordered delivery
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     scopewatch-core                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  bookmark/     - Capability tokens, access scopes, store    │
//! │  monitor/      - Event streams, coalescing, delivery        │
//! │  types/        - Shared type definitions                    │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bookmark;
pub mod error;
pub mod monitor;
pub mod types;

// Re-export commonly used types
pub use error::{BookmarkError, Error, MonitorError, Result};
pub use types::*;

// Re-export bookmark components
pub use bookmark::{AccessScope, BookmarkStore, CapabilityProvider, PathCapabilityProvider};

// Re-export monitor components
pub use monitor::{
    DeliveryContext, EventBroadcaster, EventHandler, FileEventMonitor, MonitorNotification,
    NotifyStreamFactory, StreamFactory, StreamHandle,
};
