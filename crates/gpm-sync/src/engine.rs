//! Reconciliation engine: encrypt / decrypt / status over one managed tree.
//!
//! `encrypt` mirrors the working directory into blobs plus encrypted metadata;
//! `decrypt` makes the working directory mirror the metadata again and
//! collects orphaned blobs. Both are idempotent.

use gpm_core::config::GpmConfig;
use gpm_core::{GpmError, GpmResult};
use gpm_crypto::staging::is_staging_name;
use gpm_crypto::{generate_key, Backend, CipherBackend, KeyMaterial};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, IdGenerator};
use crate::fingerprint::fingerprint_file;
use crate::layout::Layout;
use crate::metadata::{Entry, MetadataStore};

/// Progress callback: (done, total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Fresh random key per blob, stored in the metadata
    pub per_file_keys: bool,
    /// Blob id allocation attempts
    pub id_attempts: usize,
    /// Glob patterns matched against file names
    pub exclude_patterns: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            per_file_keys: true,
            id_attempts: 10,
            exclude_patterns: Vec::new(),
        }
    }
}

impl From<&GpmConfig> for EngineOptions {
    fn from(config: &GpmConfig) -> Self {
        Self {
            per_file_keys: config.crypto.per_file_keys,
            id_attempts: config.sync.id_attempts,
            exclude_patterns: config.sync.exclude_patterns.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptReport {
    pub added: usize,
    pub modified: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub blobs_written: usize,
    pub metadata_saved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptReport {
    pub restored: usize,
    pub unchanged: usize,
    pub removed_files: usize,
    /// Untracked directories removed, blocking or left empty
    pub removed_dirs: usize,
    pub collected_blobs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    Modified,
    /// Tracked but absent from the working directory
    Missing,
    /// Present but not tracked yet
    Untracked,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Unchanged => "unchanged",
            FileStatus::Modified => "modified",
            FileStatus::Missing => "missing",
            FileStatus::Untracked => "untracked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub status: FileStatus,
}

pub struct Engine<B = Backend> {
    layout: Layout,
    backend: B,
    metadata_key: KeyMaterial,
    blobs: BlobStore,
    per_file_keys: bool,
    excludes: Vec<glob::Pattern>,
}

impl<B: CipherBackend> Engine<B> {
    pub fn new(
        layout: Layout,
        backend: B,
        metadata_key: KeyMaterial,
        options: EngineOptions,
    ) -> GpmResult<Self> {
        let excludes = options
            .exclude_patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| GpmError::Config(format!("bad exclude pattern {p:?}: {e}")))
            })
            .collect::<GpmResult<Vec<_>>>()?;
        let blobs = BlobStore::new(
            layout.output_dir(),
            backend.extension(),
            options.id_attempts,
        );

        Ok(Self {
            layout,
            backend,
            metadata_key,
            blobs,
            per_file_keys: options.per_file_keys,
            excludes,
        })
    }

    /// Replace the blob id source.
    pub fn with_id_generator(mut self, generate: IdGenerator) -> Self {
        self.blobs = self.blobs.with_generator(generate);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Mirror the working directory into the output directory.
    ///
    /// Whatever was encrypted before a failure is still recorded in the
    /// metadata, so the next run only redoes the rest.
    pub fn encrypt(&mut self, progress: Option<&ProgressFn>) -> GpmResult<EncryptReport> {
        std::fs::create_dir_all(self.layout.output_dir())?;
        let (root, output) = self.canonical_dirs()?;
        let mut meta =
            MetadataStore::load_or_empty(&self.layout, &self.backend, &self.metadata_key)?;

        let mut report = EncryptReport::default();
        let outcome = self.encrypt_into(&root, output.as_deref(), &mut meta, &mut report, progress);

        match meta.save(&self.backend, &self.metadata_key) {
            Ok(saved) => report.metadata_saved = saved,
            Err(e) if outcome.is_err() => {
                warn!("failed to save metadata after an aborted encrypt: {e}");
            }
            Err(e) => return Err(e),
        }
        outcome?;

        info!(
            added = report.added,
            modified = report.modified,
            skipped = report.skipped,
            deleted = report.deleted,
            "encrypt complete"
        );
        Ok(report)
    }

    fn encrypt_into(
        &mut self,
        root: &Path,
        output: Option<&Path>,
        meta: &mut MetadataStore,
        report: &mut EncryptReport,
        progress: Option<&ProgressFn>,
    ) -> GpmResult<()> {
        let files = self.collect(root, output, true)?;

        let present: HashSet<&str> = files.iter().map(String::as_str).collect();
        let gone: Vec<String> = meta
            .paths()
            .filter(|p| !present.contains(p.as_str()))
            .cloned()
            .collect();
        for path in gone {
            let Some(id) = meta.get(&path).map(|e| e.uuid.clone()) else {
                continue;
            };
            self.blobs.delete(&id)?;
            meta.remove(&path);
            info!(path = %path, id = %id, "deleted");
            report.deleted += 1;
        }

        let mut ids = meta.ids();
        let total = files.len() as u64;
        for (i, rel) in files.iter().enumerate() {
            if let Some(cb) = progress {
                cb(i as u64, total, &format!("[{}/{}] {}", i + 1, total, rel));
            }

            let path = root.join(rel);
            let checksum = fingerprint_file(&path)?;
            match meta.get(rel) {
                None => {
                    let id = self.blobs.allocate(&ids)?;
                    let (stored, key) = self.fresh_key();
                    self.backend
                        .encrypt_file(&path, &self.blobs.path_for(&id), &key)?;
                    info!(path = %rel, id = %id, "new");
                    ids.insert(id.clone());
                    meta.insert(
                        rel,
                        Entry {
                            uuid: id,
                            checksum,
                            key: stored,
                        },
                    );
                    report.added += 1;
                }
                Some(entry) if entry.checksum != checksum => {
                    let id = entry.uuid.clone();
                    let (stored, key) = self.fresh_key();
                    self.backend
                        .encrypt_file(&path, &self.blobs.path_for(&id), &key)?;
                    info!(path = %rel, id = %id, "modified");
                    meta.update(rel, checksum, stored);
                    report.modified += 1;
                }
                Some(entry) if !self.blobs.path_for(&entry.uuid).is_file() => {
                    let id = entry.uuid.clone();
                    let (stored, key) = self.fresh_key();
                    warn!(path = %rel, id = %id, "blob missing, re-encrypting");
                    self.backend
                        .encrypt_file(&path, &self.blobs.path_for(&id), &key)?;
                    meta.update(rel, checksum, stored);
                    report.modified += 1;
                }
                Some(entry) => {
                    debug!(path = %rel, id = %entry.uuid, "skipped");
                    report.skipped += 1;
                }
            }
        }
        report.blobs_written = report.added + report.modified;

        if let Some(cb) = progress {
            cb(total, total, "encrypt complete");
        }
        Ok(())
    }

    /// Make the working directory mirror the metadata.
    ///
    /// Restores missing or changed files, removes untracked files and
    /// directories, and deletes unreferenced blobs. Untracked entries that
    /// sit where a tracked file or one of its parent directories belongs are
    /// removed before restoring. A blob that fails to decrypt aborts the run.
    pub fn decrypt(&mut self, progress: Option<&ProgressFn>) -> GpmResult<DecryptReport> {
        let meta = MetadataStore::load(&self.layout, &self.backend, &self.metadata_key)?;
        let targets = meta
            .iter()
            .map(|(rel, entry)| -> GpmResult<_> {
                let path = self.layout.working_path(rel)?;
                if let Some(parent) = tracked_ancestor(&meta, rel) {
                    return Err(GpmError::Metadata(format!(
                        "{rel} is tracked below the tracked file {parent}"
                    )));
                }
                Ok((rel.as_str(), path, entry))
            })
            .collect::<GpmResult<Vec<_>>>()?;
        let (root, output) = self.canonical_dirs()?;

        let mut report = DecryptReport::default();
        let total = targets.len() as u64;
        for (i, (rel, path, entry)) in targets.iter().enumerate() {
            if let Some(cb) = progress {
                cb(i as u64, total, &format!("[{}/{}] {}", i + 1, total, rel));
            }

            clear_obstructions(&root, rel, output.as_deref(), &mut report)?;
            if path.is_file() && fingerprint_file(path)? == entry.checksum {
                debug!(path = %rel, "unchanged");
                report.unchanged += 1;
                continue;
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let key = entry.key_material(&self.metadata_key)?;
            self.backend
                .decrypt_file(&self.blobs.path_for(&entry.uuid), path, &key)?;
            info!(path = %rel, id = %entry.uuid, "restored");
            report.restored += 1;
        }

        for rel in self.collect(&root, output.as_deref(), false)? {
            if meta.contains(&rel) {
                continue;
            }
            std::fs::remove_file(root.join(&rel))?;
            info!(path = %rel, "removed stray file");
            report.removed_files += 1;
        }
        let filter = self.filter(output.as_deref(), false);
        report.removed_dirs += prune_empty_dirs(&root, true, &filter)?;

        let partials = self.blobs.sweep_partials()?;
        if partials > 0 {
            info!(count = partials, "removed partial blobs");
        }
        let referenced = meta.ids();
        for id in self.blobs.list_ids()? {
            if !referenced.contains(&id) && self.blobs.delete(&id)? {
                info!(id = %id, "collected orphan blob");
                report.collected_blobs += 1;
            }
        }

        if let Some(cb) = progress {
            cb(total, total, "decrypt complete");
        }
        info!(
            restored = report.restored,
            unchanged = report.unchanged,
            removed = report.removed_files,
            removed_dirs = report.removed_dirs,
            collected = report.collected_blobs,
            "decrypt complete"
        );
        Ok(report)
    }

    /// Compare the working directory with the metadata without writing
    /// anything to the working directory.
    pub fn status(&self) -> GpmResult<Vec<StatusEntry>> {
        let meta = MetadataStore::load(&self.layout, &self.backend, &self.metadata_key)?;
        let (root, output) = self.canonical_dirs()?;

        let mut entries = Vec::with_capacity(meta.len());
        for (rel, entry) in meta.iter() {
            let path = self.layout.working_path(rel)?;
            let status = if !path.is_file() {
                FileStatus::Missing
            } else if fingerprint_file(&path)? != entry.checksum {
                FileStatus::Modified
            } else {
                FileStatus::Unchanged
            };
            entries.push(StatusEntry {
                path: rel.clone(),
                status,
            });
        }
        for rel in self.collect(&root, output.as_deref(), true)? {
            if !meta.contains(&rel) {
                entries.push(StatusEntry {
                    path: rel,
                    status: FileStatus::Untracked,
                });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn fresh_key(&self) -> (Option<String>, KeyMaterial) {
        if self.per_file_keys {
            let key = generate_key();
            (Some(key.to_base64()), key)
        } else {
            (None, self.metadata_key.clone())
        }
    }

    /// Canonical root, plus the canonical output directory if it exists.
    fn canonical_dirs(&self) -> GpmResult<(PathBuf, Option<PathBuf>)> {
        let root = std::fs::canonicalize(self.layout.root())?;
        let output = match std::fs::canonicalize(self.layout.output_dir()) {
            Ok(p) => Some(p),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if output.as_deref() == Some(root.as_path()) {
            return Err(GpmError::Config(
                "output directory must not be the working directory".into(),
            ));
        }
        Ok((root, output))
    }

    fn filter<'a>(&'a self, output: Option<&'a Path>, skip_staging: bool) -> WalkFilter<'a> {
        WalkFilter {
            reserved: self.layout.reserved_name(),
            output,
            excludes: &self.excludes,
            skip_staging,
        }
    }

    fn collect(
        &self,
        root: &Path,
        output: Option<&Path>,
        skip_staging: bool,
    ) -> GpmResult<Vec<String>> {
        collect_files(root, &self.filter(output, skip_staging))
    }
}

/// The first '/'-prefix of `rel` that is itself a tracked path.
fn tracked_ancestor<'a>(meta: &MetadataStore, rel: &'a str) -> Option<&'a str> {
    rel.match_indices('/')
        .map(|(i, _)| &rel[..i])
        .find(|prefix| meta.contains(prefix))
}

/// Make room for the tracked file `rel`: every parent must be a real
/// directory and the file itself must not be a directory or symlink.
///
/// Whatever is in the way is untracked, since tracked paths never nest
/// under one another.
fn clear_obstructions(
    root: &Path,
    rel: &str,
    output: Option<&Path>,
    report: &mut DecryptReport,
) -> GpmResult<()> {
    let parts: Vec<&str> = rel.split('/').collect();
    let mut current = root.to_path_buf();
    for (i, part) in parts.iter().enumerate() {
        current.push(part);
        let file_type = match std::fs::symlink_metadata(&current) {
            Ok(m) => m.file_type(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let is_target = i + 1 == parts.len();

        if file_type.is_dir() {
            if !is_target {
                continue;
            }
            if output.is_some_and(|o| o.starts_with(&current)) {
                return Err(GpmError::Config(format!(
                    "output directory is inside {}, where the tracked file {rel} belongs",
                    current.display()
                )));
            }
            std::fs::remove_dir_all(&current)?;
            info!(path = %rel, "removed directory in place of tracked file");
            report.removed_dirs += 1;
            return Ok(());
        }

        if is_target && !file_type.is_symlink() {
            return Ok(());
        }
        std::fs::remove_file(&current)?;
        info!(path = %current.display(), blocking = %rel, "removed untracked entry");
        report.removed_files += 1;
        return Ok(());
    }
    Ok(())
}

/// Remove directories under `dir` that hold nothing once strays are gone.
/// Returns how many were removed. The root itself is kept.
fn prune_empty_dirs(dir: &Path, top: bool, filter: &WalkFilter<'_>) -> GpmResult<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if (top && name == filter.reserved)
            || filter.output == Some(path.as_path())
            || filter.excludes.iter().any(|p| p.matches(name))
        {
            continue;
        }

        removed += prune_empty_dirs(&path, false, filter)?;
        if std::fs::read_dir(&path)?.next().is_none() {
            std::fs::remove_dir(&path)?;
            debug!(path = %path.display(), "removed empty directory");
            removed += 1;
        }
    }
    Ok(removed)
}

/// What the working-directory walk leaves out.
struct WalkFilter<'a> {
    /// Top-level reserved directory name
    reserved: &'a str,
    /// Output directory, when it lives inside the root
    output: Option<&'a Path>,
    excludes: &'a [glob::Pattern],
    skip_staging: bool,
}

/// Relative paths ('/'-separated, sorted) of every regular file under `root`.
fn collect_files(root: &Path, filter: &WalkFilter<'_>) -> GpmResult<Vec<String>> {
    let mut files = Vec::new();
    collect_files_inner(root, "", &mut files, filter)?;
    files.sort();
    Ok(files)
}

fn collect_files_inner(
    dir: &Path,
    prefix: &str,
    out: &mut Vec<String>,
    filter: &WalkFilter<'_>,
) -> GpmResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            warn!(path = %path.display(), "skipping non-UTF-8 file name");
            continue;
        };
        if file_type.is_symlink() {
            warn!(path = %path.display(), "skipping symlink");
            continue;
        }
        if filter.excludes.iter().any(|p| p.matches(name)) {
            continue;
        }

        let rel = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };

        if file_type.is_dir() {
            if prefix.is_empty() && name == filter.reserved {
                continue;
            }
            if filter.output == Some(path.as_path()) {
                continue;
            }
            collect_files_inner(&path, &rel, out, filter)?;
        } else if file_type.is_file() {
            if filter.skip_staging && is_staging_name(name) {
                continue;
            }
            out.push(rel);
        }
    }
    Ok(())
}
