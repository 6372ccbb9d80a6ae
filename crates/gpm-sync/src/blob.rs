//! Blob store: ciphertext files named by opaque id under the output directory.

use gpm_core::{GpmError, GpmResult};
use gpm_crypto::staging::is_staging_name;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of candidate blob ids.
pub type IdGenerator = Box<dyn FnMut() -> String + Send>;

/// Ids that can never be handed out because the name is taken by the layout.
const RESERVED_IDS: &[&str] = &["meta"];

pub struct BlobStore {
    dir: PathBuf,
    extension: String,
    attempts: usize,
    generate: IdGenerator,
}

impl BlobStore {
    pub fn new(dir: &Path, extension: &str, attempts: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
            attempts: attempts.max(1),
            generate: Box::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Replace the id source (collision tests).
    pub fn with_generator(mut self, generate: IdGenerator) -> Self {
        self.generate = generate;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Pick a fresh id not in `existing`, giving up after the configured
    /// number of attempts.
    pub fn allocate(&mut self, existing: &HashSet<String>) -> GpmResult<String> {
        for attempt in 1..=self.attempts {
            let id = (self.generate)();
            if existing.contains(&id) || RESERVED_IDS.contains(&id.as_str()) {
                debug!(attempt, id = %id, "blob id collision, retrying");
                continue;
            }
            return Ok(id);
        }
        Err(GpmError::IdSpaceExhausted(self.attempts))
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{}", self.extension))
    }

    /// Remove a blob. Returns whether anything was deleted; an absent blob
    /// is not an error.
    pub fn delete(&self, id: &str) -> GpmResult<bool> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(id, "blob already absent");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every regular file in the store carrying the extension, the
    /// metadata blob excluded.
    pub fn list_ids(&self) -> GpmResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!(path = %path.display(), "skipping non-UTF-8 blob name");
                continue;
            };
            if RESERVED_IDS.contains(&stem) {
                continue;
            }
            ids.push(stem.to_string());
        }

        ids.sort();
        Ok(ids)
    }

    /// Delete staging files left behind by an interrupted blob write.
    pub fn sweep_partials(&self) -> GpmResult<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let is_partial = name.to_str().is_some_and(is_staging_name);
            if is_partial && entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
