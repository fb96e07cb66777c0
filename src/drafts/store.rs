//! Draft persistence
//!
//! All drafts live in a single JSON file. Writes go through a temporary file
//! in the same directory and are renamed into place, so a crash mid-write
//! never leaves a half-written collection behind.

use super::schema::Draft;
use crate::utils::fs::remove_file_blocking;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DRAFTS_FORMAT: &str = "drafts-v1";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Draft not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftFile {
    format: String,
    drafts: Vec<Draft>,
}

/// Why the collection could not be read
enum LoadFailure {
    Io(std::io::Error),
    Corrupted(serde_json::Error),
}

/// Persists draft records and owns their files
pub struct DraftStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl DraftStore {
    /// Open (or prepare) the drafts file at `path`
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tracing::debug!("Draft store at {:?}", path);
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All drafts. Unreadable or corrupted storage reads as empty.
    pub fn get_all(&self) -> Vec<Draft> {
        let _guard = self.lock.lock();
        match self.load() {
            Ok(drafts) => drafts,
            Err(LoadFailure::Corrupted(e)) => {
                tracing::warn!("Draft storage {:?} is corrupted, treating as empty: {}", self.path, e);
                Vec::new()
            }
            Err(LoadFailure::Io(e)) => {
                tracing::warn!("Draft storage {:?} unreadable, treating as empty: {}", self.path, e);
                Vec::new()
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Draft> {
        self.get_all().into_iter().find(|d| d.id == id)
    }

    /// Insert a new draft or overwrite the one with the same id
    pub fn save(&self, draft: &Draft) -> Result<Draft, StorageError> {
        let _guard = self.lock.lock();
        let mut drafts = self.load_for_write()?;

        let mut saved = draft.clone();
        saved.touch();

        match drafts.iter_mut().find(|d| d.id == saved.id) {
            Some(existing) => *existing = saved.clone(),
            None => drafts.push(saved.clone()),
        }

        self.write(&drafts)?;
        tracing::debug!("Saved draft {}", saved.id);
        Ok(saved)
    }

    /// Atomic read-modify-write of one draft. Nothing is written if `f` fails.
    pub(crate) fn update<E, F>(&self, id: &str, f: F) -> Result<Draft, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut Draft) -> Result<(), E>,
    {
        let _guard = self.lock.lock();
        let mut drafts = self.load_for_write()?;

        let draft = drafts
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        f(draft)?;
        draft.touch();
        let updated = draft.clone();

        self.write(&drafts)?;
        Ok(updated)
    }

    /// Remove a draft and delete its files (best-effort).
    ///
    /// Returns the removed draft, or `None` if the id was unknown.
    pub fn delete(&self, id: &str) -> Result<Option<Draft>, StorageError> {
        let removed = {
            let _guard = self.lock.lock();
            let mut drafts = self.load_for_write()?;
            let Some(index) = drafts.iter().position(|d| d.id == id) else {
                return Ok(None);
            };
            let removed = drafts.remove(index);
            self.write(&drafts)?;
            removed
        };

        for file in removed.files() {
            remove_file_blocking(file, "draft file");
        }
        tracing::info!("Deleted draft {}", id);
        Ok(Some(removed))
    }

    /// Remove every draft and delete all their files (best-effort per file)
    pub fn clear_all(&self) -> Result<usize, StorageError> {
        let removed = {
            let _guard = self.lock.lock();
            let drafts = self.load().unwrap_or_default();
            self.write(&[])?;
            drafts
        };

        for draft in &removed {
            for file in draft.files() {
                remove_file_blocking(file, "draft file");
            }
        }
        tracing::info!("Cleared {} drafts", removed.len());
        Ok(removed.len())
    }

    fn load(&self) -> Result<Vec<Draft>, LoadFailure> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LoadFailure::Io(e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: DraftFile = serde_json::from_str(&content).map_err(LoadFailure::Corrupted)?;
        Ok(file.drafts)
    }

    /// Load before a write. A corrupted collection is moved aside so the
    /// write starts fresh without destroying the evidence.
    fn load_for_write(&self) -> Result<Vec<Draft>, StorageError> {
        match self.load() {
            Ok(drafts) => Ok(drafts),
            Err(LoadFailure::Io(e)) => Err(StorageError::Io(e)),
            Err(LoadFailure::Corrupted(e)) => {
                let backup = self
                    .path
                    .with_extension(format!("corrupt-{}", Utc::now().timestamp_millis()));
                tracing::warn!(
                    "Draft storage corrupted ({}), moving it to {:?} and starting empty",
                    e,
                    backup
                );
                if let Err(e) = fs::rename(&self.path, &backup) {
                    tracing::warn!("Could not back up corrupted drafts: {}", e);
                }
                Ok(Vec::new())
            }
        }
    }

    fn write(&self, drafts: &[Draft]) -> Result<(), StorageError> {
        let file = DraftFile {
            format: DRAFTS_FORMAT.to_string(),
            drafts: drafts.to_vec(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}
