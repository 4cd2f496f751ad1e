//! On-disk format of the bookmark store file

use crate::error::{BookmarkError, Error, Result};
use crate::types::CapabilityToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STORE_VERSION: u32 = 1;

/// One persisted grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub token: CapabilityToken,
    pub granted_at: chrono::DateTime<chrono::Utc>,
}

impl StoredRecord {
    pub fn new(token: CapabilityToken) -> Self {
        Self {
            token,
            granted_at: chrono::Utc::now(),
        }
    }
}

#[derive(Serialize)]
struct StoreDocument<'a> {
    version: u32,
    bookmarks: BTreeMap<String, &'a StoredRecord>,
}

#[derive(Deserialize)]
struct RawStoreDocument {
    version: u32,
    #[serde(default)]
    bookmarks: BTreeMap<String, serde_json::Value>,
}

/// Load the store file, writing an empty one first if it does not exist.
///
/// Records that fail to decode are skipped individually.
pub fn load_or_create(location: &Path) -> Result<Vec<StoredRecord>> {
    if !location.exists() {
        debug!("Creating empty bookmark store at {:?}", location);
        save(location, std::iter::empty())?;
    }

    let bytes = std::fs::read(location)?;
    let document: RawStoreDocument = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Bookmark(BookmarkError::CorruptStore(format!(
            "{:?}: {}",
            location, e
        )))
    })?;

    if document.version != STORE_VERSION {
        return Err(Error::Bookmark(BookmarkError::UnsupportedVersion(
            document.version,
        )));
    }

    let mut records = Vec::with_capacity(document.bookmarks.len());
    for (key, value) in document.bookmarks {
        match serde_json::from_value::<StoredRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping undecodable bookmark {}: {}", key, e),
        }
    }

    Ok(records)
}

/// Overwrite the store file with `records`.
///
/// Writes a sibling temporary file and renames it over the target, so
/// readers see either the old or the new content.
pub fn save<'a, I>(location: &Path, records: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a Path, &'a StoredRecord)>,
{
    let document = StoreDocument {
        version: STORE_VERSION,
        bookmarks: records
            .into_iter()
            .map(|(path, record)| (path.to_string_lossy().to_string(), record))
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&document)?;

    if let Some(parent) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| persist_error(location, e))?;
    }

    let staging = staging_path(location);
    std::fs::write(&staging, &bytes).map_err(|e| persist_error(location, e))?;
    if let Err(e) = std::fs::rename(&staging, location) {
        let _ = std::fs::remove_file(&staging);
        return Err(persist_error(location, e));
    }

    debug!("Saved {} bookmarks to {:?}", document.bookmarks.len(), location);
    Ok(())
}

fn staging_path(location: &Path) -> PathBuf {
    let mut name = location
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    location.with_file_name(name)
}

fn persist_error(location: &Path, err: std::io::Error) -> Error {
    Error::Bookmark(BookmarkError::Persist(format!("{:?}: {}", location, err)))
}
