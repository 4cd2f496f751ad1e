//! Persisted store of capability grants

use super::codec::{self, StoredRecord};
use super::location::canonical_location;
use super::provider::{AccessScope, CapabilityProvider, PathCapabilityProvider};
use crate::error::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name used by [`BookmarkStore::default_location`]
pub const DEFAULT_STORE_FILE: &str = "bookmarks.json";

/// An active grant: the persisted record plus its open scope
struct BookmarkRecord {
    stored: StoredRecord,
    _scope: AccessScope,
}

/// Store of user-granted locations that survives restarts.
///
/// Every record held in memory has an open access scope. Scopes are closed
/// when a record is removed or the store is dropped.
pub struct BookmarkStore {
    location: PathBuf,
    provider: Arc<dyn CapabilityProvider>,
    records: HashMap<PathBuf, BookmarkRecord>,
}

impl BookmarkStore {
    /// Open the store at `location` with the filesystem capability provider
    pub fn open(location: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_provider(location, Arc::new(PathCapabilityProvider::new()))
    }

    /// Open the store at `location`, creating an empty store file if absent.
    ///
    /// Records that fail to resolve, resolve as stale, or whose scope cannot be
    /// opened are dropped without failing the load.
    pub fn open_with_provider(
        location: impl AsRef<Path>,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        info!("Opening bookmark store: {:?}", location);

        let persisted = codec::load_or_create(&location)?;
        let total = persisted.len();

        let mut store = Self {
            location,
            provider,
            records: HashMap::new(),
        };

        for stored in persisted {
            store.restore(stored);
        }

        info!(
            "Restored {} of {} bookmarks from {:?}",
            store.records.len(),
            total,
            store.location
        );
        Ok(store)
    }

    /// Default store file under the user's data directory
    pub fn default_location() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("scopewatch").join(DEFAULT_STORE_FILE))
    }

    fn restore(&mut self, stored: StoredRecord) {
        let resolved = match self.provider.resolve_token(&stored.token) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Dropping unresolvable bookmark: {}", e);
                return;
            }
        };

        if resolved.is_stale {
            info!("Dropping stale bookmark: {:?}", resolved.path);
            return;
        }

        if self.records.contains_key(&resolved.path) {
            warn!("Dropping duplicate bookmark: {:?}", resolved.path);
            return;
        }

        let Some(scope) = AccessScope::open(&self.provider, &resolved.path) else {
            warn!("Dropping bookmark whose scope failed to open: {:?}", resolved.path);
            return;
        };

        debug!("Restored bookmark: {:?}", resolved.path);
        self.records.insert(
            resolved.path,
            BookmarkRecord {
                stored,
                _scope: scope,
            },
        );
    }

    /// Location of the store file
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Snapshot of the locations with an active grant
    pub fn urls(&self) -> BTreeSet<PathBuf> {
        self.records.keys().cloned().collect()
    }

    pub fn contains(&self, url: impl AsRef<Path>) -> bool {
        self.key_for(url.as_ref())
            .map(|key| self.records.contains_key(&key))
            .unwrap_or(false)
    }

    /// Number of access scopes this store holds open
    pub fn active_scope_count(&self) -> usize {
        self.records.len()
    }

    /// Whether the platform would currently grant a token for `url`.
    ///
    /// Nothing is stored or retained.
    pub fn probe_can_bookmark(&self, url: impl AsRef<Path>) -> bool {
        self.provider.create_token(url.as_ref()).is_ok()
    }

    /// Grant and persist access to `url`.
    ///
    /// Returns true without writing when an identical token is already held.
    /// On any failure the store is left exactly as it was.
    pub fn add_bookmark(&mut self, url: impl AsRef<Path>) -> bool {
        let url = url.as_ref();
        let key = match self.key_for(url) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot bookmark {:?}: {}", url, e);
                return false;
            }
        };

        let token = match self.provider.create_token(&key) {
            Ok(token) => token,
            Err(e) => {
                warn!("Failed to create bookmark for {:?}: {}", key, e);
                return false;
            }
        };

        if let Some(existing) = self.records.get_mut(&key) {
            if existing.stored.token == token {
                debug!("Bookmark already recorded: {:?}", key);
                return true;
            }

            // Replace the token; the scope for this location is already open
            let previous = std::mem::replace(&mut existing.stored, StoredRecord::new(token));
            if let Err(e) = self.persist() {
                warn!("Rolling back bookmark update for {:?}: {}", key, e);
                if let Some(existing) = self.records.get_mut(&key) {
                    existing.stored = previous;
                }
                return false;
            }
            info!("Updated bookmark: {:?}", key);
            return true;
        }

        let Some(scope) = AccessScope::open(&self.provider, &key) else {
            warn!("Failed to open access scope for {:?}", key);
            return false;
        };

        self.records.insert(
            key.clone(),
            BookmarkRecord {
                stored: StoredRecord::new(token),
                _scope: scope,
            },
        );

        if let Err(e) = self.persist() {
            warn!("Rolling back bookmark for {:?}: {}", key, e);
            // Dropping the record closes its scope
            self.records.remove(&key);
            return false;
        }

        info!("Added bookmark: {:?}", key);
        true
    }

    /// Revoke the grant for `url`.
    ///
    /// Returns `None` without touching the store file when `url` is unknown.
    /// The scope is released even if the removal cannot be persisted; in that
    /// case the record reappears on the next load if it still resolves.
    pub fn remove_bookmark(&mut self, url: impl AsRef<Path>) -> Option<PathBuf> {
        let url = url.as_ref();
        let key = self.key_for(url).unwrap_or_else(|_| url.to_path_buf());

        let record = self.records.remove(&key)?;
        drop(record);

        match self.persist() {
            Ok(()) => info!("Removed bookmark: {:?}", key),
            Err(e) => warn!(
                "Released bookmark {:?} but failed to record the removal: {}",
                key, e
            ),
        }

        Some(key)
    }

    fn key_for(&self, url: &Path) -> Result<PathBuf> {
        canonical_location(url)
    }

    fn persist(&self) -> Result<()> {
        codec::save(
            &self.location,
            self.records
                .iter()
                .map(|(path, record)| (path.as_path(), &record.stored)),
        )
    }
}

impl std::fmt::Debug for BookmarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookmarkStore")
            .field("location", &self.location)
            .field("urls", &self.urls())
            .finish()
    }
}

impl Drop for BookmarkStore {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            debug!(
                "Closing {} access scopes for {:?}",
                self.records.len(),
                self.location
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmark::provider::MockCapabilityProvider;
    use crate::types::{CapabilityToken, ResolvedToken};
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        location: PathBuf,
        provider: Arc<PathCapabilityProvider>,
        granted: Vec<PathBuf>,
    }

    impl Fixture {
        fn new(grants: usize) -> Self {
            let dir = tempdir().unwrap();
            let location = dir.path().join("state/bookmarks.json");
            let granted = (0..grants)
                .map(|i| {
                    let path = dir.path().join(format!("granted-{}", i));
                    std::fs::create_dir(&path).unwrap();
                    path.canonicalize().unwrap()
                })
                .collect();
            Self {
                _dir: dir,
                location,
                provider: Arc::new(PathCapabilityProvider::new()),
                granted,
            }
        }

        fn open(&self) -> BookmarkStore {
            BookmarkStore::open_with_provider(&self.location, self.provider.clone()).unwrap()
        }
    }

    #[test]
    fn test_open_creates_empty_store() {
        let fixture = Fixture::new(0);
        let store = fixture.open();

        assert!(store.urls().is_empty());
        assert!(fixture.location.exists());
        assert_eq!(store.location(), fixture.location.as_path());
    }

    #[test]
    fn test_bookmarks_survive_reopen() {
        let fixture = Fixture::new(2);
        {
            let mut store = fixture.open();
            assert!(store.add_bookmark(&fixture.granted[0]));
            assert!(store.add_bookmark(&fixture.granted[1]));
        }
        assert_eq!(fixture.provider.active_scope_count(), 0);

        let store = fixture.open();
        let expected: BTreeSet<PathBuf> = fixture.granted.iter().cloned().collect();
        assert_eq!(store.urls(), expected);
        assert_eq!(fixture.provider.active_scope_count(), 2);
    }

    #[test]
    fn test_add_twice_is_byte_identical() {
        let fixture = Fixture::new(1);
        let mut store = fixture.open();

        assert!(store.add_bookmark(&fixture.granted[0]));
        let once = std::fs::read(&fixture.location).unwrap();
        assert!(store.add_bookmark(&fixture.granted[0]));
        let twice = std::fs::read(&fixture.location).unwrap();

        assert_eq!(once, twice);
        assert_eq!(fixture.provider.scope_count(&fixture.granted[0]), 1);
    }

    #[test]
    fn test_add_then_remove_is_balanced() {
        let fixture = Fixture::new(2);
        let mut store = fixture.open();
        assert!(store.add_bookmark(&fixture.granted[0]));
        let before = fixture.provider.active_scope_count();

        assert!(store.add_bookmark(&fixture.granted[1]));
        assert_eq!(
            store.remove_bookmark(&fixture.granted[1]),
            Some(fixture.granted[1].clone())
        );

        assert_eq!(fixture.provider.active_scope_count(), before);
        assert_eq!(store.active_scope_count(), 1);
    }

    #[test]
    fn test_remove_unknown_does_not_write() {
        let fixture = Fixture::new(1);
        let mut store = fixture.open();
        std::fs::remove_file(&fixture.location).unwrap();

        assert_eq!(store.remove_bookmark(&fixture.granted[0]), None);
        assert!(!fixture.location.exists());
    }

    #[test]
    fn test_failed_token_creation_leaves_store_unchanged() {
        let fixture = Fixture::new(1);
        let mut store = fixture.open();
        let before = std::fs::read(&fixture.location).unwrap();

        let missing = fixture.granted[0].join("missing");
        assert!(!store.probe_can_bookmark(&missing));
        assert!(!store.add_bookmark(&missing));

        assert!(store.urls().is_empty());
        assert_eq!(std::fs::read(&fixture.location).unwrap(), before);
    }

    #[test]
    fn test_probe_does_not_mutate() {
        let fixture = Fixture::new(1);
        let store = fixture.open();

        assert!(store.probe_can_bookmark(&fixture.granted[0]));
        assert!(store.urls().is_empty());
        assert_eq!(fixture.provider.active_scope_count(), 0);
    }

    #[test]
    fn test_failed_persist_rolls_back_add() {
        let fixture = Fixture::new(1);
        let mut store = fixture.open();

        // A non-empty directory at the store location makes the rename fail
        std::fs::remove_file(&fixture.location).unwrap();
        std::fs::create_dir(&fixture.location).unwrap();
        std::fs::write(fixture.location.join("blocker"), "x").unwrap();

        assert!(!store.add_bookmark(&fixture.granted[0]));
        assert!(store.urls().is_empty());
        assert_eq!(fixture.provider.active_scope_count(), 0);
    }

    #[test]
    fn test_failed_persist_still_releases_on_remove() {
        let fixture = Fixture::new(1);
        let mut store = fixture.open();
        assert!(store.add_bookmark(&fixture.granted[0]));

        std::fs::remove_file(&fixture.location).unwrap();
        std::fs::create_dir(&fixture.location).unwrap();
        std::fs::write(fixture.location.join("blocker"), "x").unwrap();

        assert_eq!(
            store.remove_bookmark(&fixture.granted[0]),
            Some(fixture.granted[0].clone())
        );
        assert!(!store.contains(&fixture.granted[0]));
        assert_eq!(fixture.provider.active_scope_count(), 0);
    }

    #[test]
    fn test_corrupt_record_is_isolated() {
        let fixture = Fixture::new(2);
        {
            let mut store = fixture.open();
            assert!(store.add_bookmark(&fixture.granted[0]));
            assert!(store.add_bookmark(&fixture.granted[1]));
        }

        let mut document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&fixture.location).unwrap()).unwrap();
        document["bookmarks"]["/corrupt"] = serde_json::json!({
            "token": "Z2FyYmFnZQ==",
            "granted_at": "2024-01-01T00:00:00Z"
        });
        std::fs::write(&fixture.location, serde_json::to_vec(&document).unwrap()).unwrap();

        let store = fixture.open();
        assert_eq!(store.urls().len(), 2);
        assert_eq!(fixture.provider.active_scope_count(), 2);
    }

    #[test]
    fn test_moved_target_is_dropped_on_load() {
        let fixture = Fixture::new(2);
        {
            let mut store = fixture.open();
            assert!(store.add_bookmark(&fixture.granted[0]));
            assert!(store.add_bookmark(&fixture.granted[1]));
        }
        let moved = fixture.granted[1].with_file_name("moved");
        std::fs::rename(&fixture.granted[1], &moved).unwrap();

        let store = fixture.open();
        assert_eq!(
            store.urls().into_iter().collect::<Vec<_>>(),
            vec![fixture.granted[0].clone()]
        );
    }

    #[test]
    fn test_drop_closes_all_scopes() {
        let fixture = Fixture::new(2);
        let mut store = fixture.open();
        assert!(store.add_bookmark(&fixture.granted[0]));
        assert!(store.add_bookmark(&fixture.granted[1]));
        assert_eq!(fixture.provider.active_scope_count(), 2);

        drop(store);
        assert_eq!(fixture.provider.active_scope_count(), 0);
    }

    fn write_tokens(location: &Path, tokens: &[&[u8]]) {
        let records: Vec<(PathBuf, StoredRecord)> = tokens
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                (
                    PathBuf::from(format!("/record-{}", i)),
                    StoredRecord::new(CapabilityToken::from_bytes(bytes.to_vec())),
                )
            })
            .collect();
        codec::save(
            location,
            records.iter().map(|(path, record)| (path.as_path(), record)),
        )
        .unwrap();
    }

    #[test]
    fn test_stale_and_unopenable_records_are_dropped() {
        let dir = tempdir().unwrap();
        let location = dir.path().join("bookmarks.json");
        write_tokens(&location, &[b"live", b"stale", b"locked", b"broken"]);

        let mut provider = MockCapabilityProvider::new();
        provider.expect_resolve_token().returning(|token| {
            let name = String::from_utf8_lossy(token.as_bytes()).to_string();
            if name == "broken" {
                return Err(crate::error::Error::Internal("bad token".to_string()));
            }
            Ok(ResolvedToken {
                path: PathBuf::from(format!("/mock/{}", name)),
                is_stale: name == "stale",
            })
        });
        provider
            .expect_start_access()
            .returning(|path| path != Path::new("/mock/locked"));
        provider
            .expect_stop_access()
            .withf(|path| path == Path::new("/mock/live"))
            .times(1)
            .return_const(());

        let store = BookmarkStore::open_with_provider(&location, Arc::new(provider)).unwrap();

        assert_eq!(
            store.urls().into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("/mock/live")]
        );
    }

    #[test]
    fn test_replaced_token_keeps_single_scope() {
        let dir = tempdir().unwrap();
        let location = dir.path().join("bookmarks.json");
        let target = dir.path().canonicalize().unwrap().join("target");
        std::fs::create_dir(&target).unwrap();

        let mut provider = MockCapabilityProvider::new();
        let mut generation = 0u8;
        provider.expect_create_token().returning(move |_| {
            generation += 1;
            Ok(CapabilityToken::from_bytes(vec![generation]))
        });
        provider.expect_start_access().times(1).return_const(true);
        provider.expect_stop_access().times(1).return_const(());

        let mut store = BookmarkStore::open_with_provider(&location, Arc::new(provider)).unwrap();
        assert!(store.add_bookmark(&target));
        let first = std::fs::read(&location).unwrap();
        assert!(store.add_bookmark(&target));
        let second = std::fs::read(&location).unwrap();

        assert_ne!(first, second);
        assert_eq!(store.active_scope_count(), 1);
    }
}
