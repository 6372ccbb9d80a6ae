//! Metadata store: the path → entry mapping, persisted as an encrypted blob.
//!
//! The plaintext JSON is staged in `<reserved>/metafile` and encrypted with
//! the metadata key into `<output>/meta.<ext>`. The staged copy holds every
//! blob key, so it only exists while the backend is reading or writing it.
//! Mutators mark the store dirty; `save` is a no-op while clean.

use gpm_core::{GpmError, GpmResult};
use gpm_crypto::{CipherBackend, KeyMaterial};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::layout::Layout;

/// One tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Blob id
    pub uuid: String,
    /// Content fingerprint at last encrypt
    pub checksum: String,
    /// Url-safe base64 blob key; absent means the metadata key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Entry {
    /// Key material that decrypts this entry's blob.
    pub fn key_material(&self, metadata_key: &KeyMaterial) -> GpmResult<KeyMaterial> {
        match &self.key {
            Some(encoded) => KeyMaterial::from_base64(encoded)
                .map_err(|e| GpmError::Metadata(format!("entry {}: {e}", self.uuid))),
            None => Ok(metadata_key.clone()),
        }
    }
}

pub struct MetadataStore {
    metafile: PathBuf,
    blob: PathBuf,
    entries: BTreeMap<String, Entry>,
    dirty: bool,
}

impl MetadataStore {
    /// An empty store for a tree that was never encrypted.
    pub fn empty(layout: &Layout, extension: &str) -> Self {
        Self {
            metafile: layout.metafile(),
            blob: layout.metadata_blob(extension),
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Decrypt and parse the metadata blob.
    ///
    /// `NoMetadata` if the blob does not exist; decrypt failures propagate.
    pub fn load(
        layout: &Layout,
        backend: &dyn CipherBackend,
        key: &KeyMaterial,
    ) -> GpmResult<Self> {
        let mut store = Self::empty(layout, backend.extension());
        remove_plaintext(&store.metafile)?;
        if !store.blob.is_file() {
            return Err(GpmError::NoMetadata(store.blob));
        }

        ensure_parent(&store.metafile)?;
        let decrypted = backend
            .decrypt_file(&store.blob, &store.metafile, key)
            .and_then(|()| Ok(std::fs::read(&store.metafile)?));
        remove_plaintext(&store.metafile)?;
        let content = decrypted?;
        store.entries = serde_json::from_slice(&content).map_err(|e| {
            GpmError::Metadata(format!("parsing {}: {e}", store.blob.display()))
        })?;

        tracing::debug!(entries = store.entries.len(), "loaded metadata");
        Ok(store)
    }

    /// Like `load`, but a tree without metadata yields an empty store.
    pub fn load_or_empty(
        layout: &Layout,
        backend: &dyn CipherBackend,
        key: &KeyMaterial,
    ) -> GpmResult<Self> {
        match Self::load(layout, backend, key) {
            Err(GpmError::NoMetadata(_)) => Ok(Self::empty(layout, backend.extension())),
            other => other,
        }
    }

    /// Write and encrypt the mapping if it changed. Returns whether a write
    /// happened.
    pub fn save(&mut self, backend: &dyn CipherBackend, key: &KeyMaterial) -> GpmResult<bool> {
        if !self.dirty {
            return Ok(false);
        }

        ensure_parent(&self.metafile)?;
        ensure_parent(&self.blob)?;
        let json = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| GpmError::Metadata(format!("serializing metadata: {e}")))?;
        let encrypted = std::fs::write(&self.metafile, json)
            .map_err(GpmError::from)
            .and_then(|()| backend.encrypt_file(&self.metafile, &self.blob, key));
        remove_plaintext(&self.metafile)?;
        encrypted?;

        self.dirty = false;
        tracing::debug!(entries = self.entries.len(), "saved metadata");
        Ok(true)
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Insert or replace the entry for `path`.
    pub fn insert(&mut self, path: &str, entry: Entry) {
        self.entries.insert(path.to_string(), entry);
        self.dirty = true;
    }

    /// Record new content for an existing entry.
    pub fn update(&mut self, path: &str, checksum: String, key: Option<String>) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.checksum = checksum;
                entry.key = key;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<Entry> {
        let removed = self.entries.remove(path);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Every blob id referenced by an entry.
    pub fn ids(&self) -> HashSet<String> {
        self.entries.values().map(|e| e.uuid.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn blob_path(&self) -> &Path {
        &self.blob
    }
}

/// Delete the staged plaintext, if any.
fn remove_plaintext(path: &Path) -> GpmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn ensure_parent(path: &Path) -> GpmResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpm_core::config::SyncConfig;
    use gpm_crypto::{generate_key, NativeBackend};
    use tempfile::TempDir;

    fn entry(id: &str) -> Entry {
        Entry {
            uuid: id.into(),
            checksum: "c0ffee".into(),
            key: None,
        }
    }

    fn setup() -> (TempDir, Layout, NativeBackend, KeyMaterial) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path(), None, &SyncConfig::default());
        (dir, layout, NativeBackend::default(), generate_key())
    }

    #[test]
    fn test_load_without_blob_is_no_metadata() {
        let (_dir, layout, backend, key) = setup();
        let err = MetadataStore::load(&layout, &backend, &key).err().unwrap();
        assert!(matches!(err, GpmError::NoMetadata(_)));

        let store = MetadataStore::load_or_empty(&layout, &backend, &key).unwrap();
        assert!(store.is_empty());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, layout, backend, key) = setup();
        let mut store = MetadataStore::empty(&layout, backend.extension());
        store.insert("a.txt", entry("id-a"));
        store.insert(
            "dir/b.txt",
            Entry {
                key: Some(generate_key().to_base64()),
                ..entry("id-b")
            },
        );

        assert!(store.save(&backend, &key).unwrap());
        assert!(!store.is_dirty());
        assert!(layout.metadata_blob("enc").is_file());

        let loaded = MetadataStore::load(&layout, &backend, &key).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("a.txt"), Some(&entry("id-a")));
        assert!(loaded.get("dir/b.txt").unwrap().key.is_some());
        assert_eq!(loaded.ids(), HashSet::from(["id-a".into(), "id-b".into()]));
    }

    #[test]
    fn test_plaintext_does_not_outlive_save_or_load() {
        let (_dir, layout, backend, key) = setup();
        let mut store = MetadataStore::empty(&layout, backend.extension());
        store.insert(
            "secret.txt",
            Entry {
                key: Some(generate_key().to_base64()),
                ..entry("id-s")
            },
        );
        store.save(&backend, &key).unwrap();
        assert!(!layout.metafile().exists());

        MetadataStore::load(&layout, &backend, &key).unwrap();
        assert!(!layout.metafile().exists());

        // A wrong key never produces plaintext, and a stale copy is cleared.
        std::fs::write(layout.metafile(), "stale").unwrap();
        assert!(MetadataStore::load(&layout, &backend, &generate_key()).is_err());
        assert!(!layout.metafile().exists());
    }

    #[test]
    fn test_save_when_clean_is_noop() {
        let (_dir, layout, backend, key) = setup();
        let mut store = MetadataStore::empty(&layout, backend.extension());
        assert!(!store.save(&backend, &key).unwrap());
        assert!(!layout.metadata_blob("enc").exists());
    }

    #[test]
    fn test_mutators_mark_dirty() {
        let (_dir, layout, backend, key) = setup();
        let mut store = MetadataStore::empty(&layout, backend.extension());
        store.insert("a", entry("1"));
        store.save(&backend, &key).unwrap();

        assert!(store.update("a", "new".into(), None));
        assert!(store.is_dirty());
        store.save(&backend, &key).unwrap();

        assert!(!store.update("missing", "x".into(), None));
        assert!(store.remove("missing").is_none());
        assert!(!store.is_dirty());

        assert_eq!(store.remove("a").unwrap().checksum, "new");
        assert!(store.is_dirty());
    }

    #[test]
    fn test_wrong_key_fails_to_load() {
        let (_dir, layout, backend, key) = setup();
        let mut store = MetadataStore::empty(&layout, backend.extension());
        store.insert("a", entry("1"));
        store.save(&backend, &key).unwrap();

        let err = MetadataStore::load(&layout, &backend, &generate_key())
            .err()
            .unwrap();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_reads_legacy_entries() {
        let (_dir, layout, backend, key) = setup();
        std::fs::create_dir_all(layout.reserved_dir()).unwrap();
        std::fs::create_dir_all(layout.output_dir()).unwrap();
        std::fs::write(
            layout.metafile(),
            r#"{"notes.txt": {"uuid": "1234", "checksum": "abcd"}}"#,
        )
        .unwrap();
        backend
            .encrypt_file(&layout.metafile(), &layout.metadata_blob("enc"), &key)
            .unwrap();

        let store = MetadataStore::load(&layout, &backend, &key).unwrap();
        let e = store.get("notes.txt").unwrap();
        assert_eq!(e.uuid, "1234");
        assert!(e.key.is_none());
        assert_eq!(e.key_material(&key).unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_corrupt_json_is_metadata_error() {
        let (_dir, layout, backend, key) = setup();
        std::fs::create_dir_all(layout.output_dir()).unwrap();
        let src = layout.root().join("garbage");
        std::fs::write(&src, b"not json").unwrap();
        backend
            .encrypt_file(&src, &layout.metadata_blob("enc"), &key)
            .unwrap();

        let err = MetadataStore::load(&layout, &backend, &key).err().unwrap();
        assert!(matches!(err, GpmError::Metadata(_)));
        assert!(!layout.metafile().exists());
    }
}
