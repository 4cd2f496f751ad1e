//! Capability-grant service: token creation, resolution and access scopes

use super::location::canonical_location;
use crate::error::{BookmarkError, Error, Result};
use crate::types::{CapabilityToken, ResolvedToken};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Platform service that grants and resolves capability tokens.
///
/// Every successful `start_access` must be balanced by one `stop_access`;
/// [`AccessScope`] enforces that pairing.
#[cfg_attr(test, mockall::automock)]
pub trait CapabilityProvider: Send + Sync {
    /// Create a token for `path`, failing if the platform would not grant one
    fn create_token(&self, path: &Path) -> Result<CapabilityToken>;

    /// Resolve a token back into the location it grants
    fn resolve_token(&self, token: &CapabilityToken) -> Result<ResolvedToken>;

    /// Open an access scope; returns false if access cannot be exercised
    fn start_access(&self, path: &Path) -> bool;

    /// Close an access scope opened by `start_access`
    fn stop_access(&self, path: &Path);
}

/// An open access scope, closed when dropped
pub struct AccessScope {
    path: PathBuf,
    provider: Arc<dyn CapabilityProvider>,
}

impl AccessScope {
    /// Open a scope for `path`, or `None` if the provider refuses
    pub fn open(provider: &Arc<dyn CapabilityProvider>, path: &Path) -> Option<Self> {
        if !provider.start_access(path) {
            return None;
        }
        debug!("Opened access scope: {:?}", path);
        Some(Self {
            path: path.to_path_buf(),
            provider: Arc::clone(provider),
        })
    }
}

impl Drop for AccessScope {
    fn drop(&mut self) {
        self.provider.stop_access(&self.path);
        debug!("Closed access scope: {:?}", self.path);
    }
}

impl std::fmt::Debug for AccessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessScope").field("path", &self.path).finish()
    }
}

const TOKEN_VERSION: u32 = 1;

/// What a token pins down about its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenPayload {
    version: u32,
    path: PathBuf,
    is_dir: bool,
    identity: Option<FileIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct FileIdentity {
    device: u64,
    inode: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    payload: TokenPayload,
    digest: String,
}

/// Filesystem-backed capability provider.
///
/// Tokens pin a canonical path plus the file identity behind it. A token whose
/// path now holds a different file resolves as stale; a token whose path is
/// gone does not resolve. Scopes are reference counted per path.
#[derive(Debug, Default)]
pub struct PathCapabilityProvider {
    /// Roots under which grants are allowed; empty means unrestricted
    allowed_roots: Vec<PathBuf>,
    open_scopes: Mutex<HashMap<PathBuf, usize>>,
}

impl PathCapabilityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict grants to locations inside `roots`
    pub fn with_allowed_roots<I, P>(roots: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let allowed_roots = roots
            .into_iter()
            .map(|root| canonical_location(root.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allowed_roots,
            open_scopes: Mutex::new(HashMap::new()),
        })
    }

    /// Number of scopes currently open across all paths
    pub fn active_scope_count(&self) -> usize {
        self.open_scopes.lock().values().sum()
    }

    /// Number of scopes currently open for `path`
    pub fn scope_count(&self, path: &Path) -> usize {
        self.open_scopes.lock().get(path).copied().unwrap_or(0)
    }

    fn is_path_granted(&self, path: &Path) -> bool {
        self.allowed_roots.is_empty() || self.allowed_roots.iter().any(|root| path.starts_with(root))
    }

    fn digest(payload: &TokenPayload) -> Result<String> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    #[cfg(unix)]
    fn identity(metadata: &std::fs::Metadata) -> Option<FileIdentity> {
        use std::os::unix::fs::MetadataExt;
        Some(FileIdentity {
            device: metadata.dev(),
            inode: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn identity(_metadata: &std::fs::Metadata) -> Option<FileIdentity> {
        None
    }
}

impl CapabilityProvider for PathCapabilityProvider {
    fn create_token(&self, path: &Path) -> Result<CapabilityToken> {
        let path = canonical_location(path)?;

        if !self.is_path_granted(&path) {
            return Err(Error::Bookmark(BookmarkError::NotGrantable(
                path.to_string_lossy().to_string(),
            )));
        }

        let metadata = std::fs::metadata(&path).map_err(|e| {
            Error::Bookmark(BookmarkError::TokenCreation {
                path: path.clone(),
                reason: e.to_string(),
            })
        })?;

        let payload = TokenPayload {
            version: TOKEN_VERSION,
            is_dir: metadata.is_dir(),
            identity: Self::identity(&metadata),
            path,
        };
        let envelope = TokenEnvelope {
            digest: Self::digest(&payload)?,
            payload,
        };

        Ok(CapabilityToken::from_bytes(serde_json::to_vec(&envelope)?))
    }

    fn resolve_token(&self, token: &CapabilityToken) -> Result<ResolvedToken> {
        let envelope: TokenEnvelope = serde_json::from_slice(token.as_bytes()).map_err(|e| {
            Error::Bookmark(BookmarkError::TokenResolution(format!(
                "Malformed token: {}",
                e
            )))
        })?;

        if Self::digest(&envelope.payload)? != envelope.digest {
            return Err(Error::Bookmark(BookmarkError::TokenResolution(
                "Token digest mismatch".to_string(),
            )));
        }

        let payload = envelope.payload;
        if payload.version != TOKEN_VERSION {
            return Err(Error::Bookmark(BookmarkError::TokenResolution(format!(
                "Unsupported token version {}",
                payload.version
            ))));
        }

        let metadata = std::fs::metadata(&payload.path).map_err(|e| {
            Error::Bookmark(BookmarkError::TokenResolution(format!(
                "Target {:?} unavailable: {}",
                payload.path, e
            )))
        })?;

        let is_stale =
            metadata.is_dir() != payload.is_dir || Self::identity(&metadata) != payload.identity;

        Ok(ResolvedToken {
            path: payload.path,
            is_stale,
        })
    }

    fn start_access(&self, path: &Path) -> bool {
        if !self.is_path_granted(path) || std::fs::metadata(path).is_err() {
            return false;
        }
        *self.open_scopes.lock().entry(path.to_path_buf()).or_insert(0) += 1;
        true
    }

    fn stop_access(&self, path: &Path) {
        let mut scopes = self.open_scopes.lock();
        match scopes.get_mut(path) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                scopes.remove(path);
            }
            None => warn!("Unbalanced stop_access for {:?}", path),
        }
    }
}
