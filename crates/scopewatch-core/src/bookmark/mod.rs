//! Persisted capability grants
//!
//! This module provides:
//! - Capability token creation and resolution behind a provider trait
//! - Access scopes that are closed exactly once
//! - A bookmark store that restores grants across restarts

mod codec;
mod location;
pub mod provider;
mod store;

pub use codec::{StoredRecord, STORE_VERSION};
pub use location::canonical_location;
pub use provider::{AccessScope, CapabilityProvider, PathCapabilityProvider};
pub use store::{BookmarkStore, DEFAULT_STORE_FILE};
