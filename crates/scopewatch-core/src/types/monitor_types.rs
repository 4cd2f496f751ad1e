//! Monitor configuration and lifecycle types

use super::CreateFlags;
use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which event space a stream watches
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", content = "device", rename_all = "snake_case")]
pub enum WatchScope {
    /// Every volume on the host
    #[default]
    Host,
    /// Only the device with this id
    Device(u64),
}

/// Where event delivery continues from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ResumePoint {
    #[default]
    FromNow,
    SequenceId(u64),
}

/// Lifecycle state of a file event monitor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Created,
    Started,
    Stopped,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Block until queued events reach the handler
    Sync,
    Async,
}

/// Unique identity of a monitor instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MonitorId(uuid::Uuid);

impl MonitorId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MonitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default coalescing window
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(500);

/// Immutable description of what a monitor watches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    paths: Vec<PathBuf>,
    #[serde(default)]
    scope: WatchScope,
    #[serde(default)]
    flags: CreateFlags,
    #[serde(default = "default_latency")]
    latency: Duration,
    #[serde(default)]
    resume: ResumePoint,
}

fn default_latency() -> Duration {
    DEFAULT_LATENCY
}

impl MonitorConfig {
    /// Watch `paths` on the host, from now, with the default latency.
    ///
    /// Duplicate paths are dropped; the first occurrence keeps its position.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut ordered: Vec<PathBuf> = Vec::new();
        for path in paths {
            let path = path.into();
            if !ordered.contains(&path) {
                ordered.push(path);
            }
        }

        Self {
            paths: ordered,
            scope: WatchScope::Host,
            flags: CreateFlags::NONE,
            latency: DEFAULT_LATENCY,
            resume: ResumePoint::FromNow,
        }
    }

    pub fn with_scope(mut self, scope: WatchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_flags(mut self, flags: CreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn resuming_from(mut self, resume: ResumePoint) -> Self {
        self.resume = resume;
        self
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn scope(&self) -> WatchScope {
        self.scope
    }

    pub fn flags(&self) -> CreateFlags {
        self.flags
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn resume(&self) -> ResumePoint {
        self.resume
    }

    pub fn watches(&self, path: &Path) -> bool {
        self.paths.iter().any(|root| path.starts_with(root))
    }

    /// Check the configuration before a stream is created from it
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(MonitorError::NoPaths.into());
        }
        if let Some(empty) = self.paths.iter().find(|p| p.as_os_str().is_empty()) {
            return Err(MonitorError::PathNotWatchable(format!("{:?}", empty)).into());
        }
        Ok(())
    }
}
