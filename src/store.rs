// src/store.rs
// =============================================================================
// Saved checks: the full result tree of a check, gzip-compressed, one file
// per check, named by an unguessable id.
//
// Lifecycle of a saved check:
// 1. reserve(): claim a fresh id by creating an empty placeholder file
// 2. save(): write the snapshot to a temp file in the same directory and
//    rename it over the placeholder, so readers never see half a file
// 3. load(): read it back; expired snapshots are still served, but flagged
// 4. touch(): push the expiry date out
//
// Saving is best-effort: a check that can't be saved still reports its
// results, so save() logs failures instead of returning them.
// =============================================================================

use crate::check::ResourceTree;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

// v4 collisions get a retry, up to this many
const RESERVE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("save directory {} is not usable: {source}", .path.display())]
    Unavailable { path: PathBuf, source: io::Error },
    #[error("could not allocate a new snapshot id")]
    IdsExhausted,
    #[error("snapshot {0} not found")]
    NotFound(String),
    #[error("snapshot {id} is corrupt: {problem}")]
    Corrupt { id: String, problem: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// What goes on disk, inside the gzip stream.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    tree: ResourceTree,
}

/// A snapshot read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tree: ResourceTree,
    pub is_expired: bool,
}

pub struct SnapshotStore {
    dir: PathBuf,
    lifetime: chrono::Duration,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, lifetime: chrono::Duration) -> Self {
        Self {
            dir: dir.into(),
            lifetime,
        }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claims a new id by creating its (empty) placeholder file.
    pub fn reserve(&self) -> Result<String, StoreError> {
        let metadata = fs::metadata(&self.dir).map_err(|source| StoreError::Unavailable {
            path: self.dir.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(StoreError::Unavailable {
                path: self.dir.clone(),
                source: io::Error::new(io::ErrorKind::Other, "not a directory"),
            });
        }

        for _ in 0..RESERVE_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.path_for(&id))
            {
                Ok(_) => {
                    debug!(id = %id, "reserved snapshot id");
                    return Ok(id);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(StoreError::Unavailable {
                        path: self.dir.clone(),
                        source,
                    })
                }
            }
        }
        Err(StoreError::IdsExhausted)
    }

    /// Saves `tree` under `id`. Failures are logged, not returned.
    pub fn save(&self, id: &str, tree: &ResourceTree) {
        let now = Utc::now();
        let envelope = Envelope {
            id: id.to_string(),
            created_at: now,
            expires_at: now + self.lifetime,
            tree: tree.clone(),
        };
        match self.write_envelope(&envelope) {
            Ok(()) => debug!(id = %id, resources = tree.len(), "saved snapshot"),
            Err(e) => warn!(id = %id, error = %e, "failed to save snapshot"),
        }
    }

    pub fn load(&self, id: &str) -> Result<Snapshot, StoreError> {
        let envelope = self.read_envelope(id)?;
        let is_expired = Utc::now() > envelope.expires_at;
        Ok(Snapshot {
            id: envelope.id,
            created_at: envelope.created_at,
            expires_at: envelope.expires_at,
            tree: envelope.tree,
            is_expired,
        })
    }

    /// Sets a new expiry time for a saved snapshot.
    pub fn touch(&self, id: &str, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut envelope = self.read_envelope(id)?;
        envelope.expires_at = expires_at;
        self.write_envelope(&envelope)
    }

    /// Default expiry for a snapshot touched now.
    pub fn next_expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.lifetime
    }

    /// Drops a reserved id that will never be saved.
    pub fn discard(&self, id: &str) {
        if !valid_id(id) {
            return;
        }
        if let Err(e) = fs::remove_file(self.path_for(id)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(id = %id, error = %e, "failed to discard snapshot placeholder");
            }
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn write_envelope(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let temp_file = NamedTempFile::new_in(&self.dir)?;
        let mut gz = GzBuilder::new()
            .filename(envelope.id.as_str())
            .write(BufWriter::new(temp_file), Compression::default());
        serde_json::to_writer(&mut gz, envelope)?;
        let mut writer = gz.finish()?;
        writer.flush()?;
        let temp_file = writer.into_inner().map_err(|e| e.into_error())?;
        temp_file.persist(self.path_for(&envelope.id))?;
        Ok(())
    }

    fn read_envelope(&self, id: &str) -> Result<Envelope, StoreError> {
        if !valid_id(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let path = self.path_for(id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        // reserved, never saved
        if file.metadata()?.len() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let corrupt = |problem: String| StoreError::Corrupt {
            id: id.to_string(),
            problem,
        };
        let envelope: Envelope = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))
            .map_err(|e| corrupt(e.to_string()))?;
        if envelope.id != id {
            return Err(corrupt(format!("holds snapshot {}", envelope.id)));
        }
        envelope.tree.validate().map_err(corrupt)?;
        Ok(envelope)
    }
}

// Ids are the 32 lowercase hex digits of a simple-form UUID.
fn valid_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
