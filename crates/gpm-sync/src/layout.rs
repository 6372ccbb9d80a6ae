//! On-disk layout of a managed tree.
//!
//! ```text
//! <root>/<reserved>/metafile     plaintext metadata, removed once encrypted or parsed
//! <output>/meta.<ext>            encrypted metadata (authoritative)
//! <output>/<blob-id>.<ext>       one blob per tracked path
//! ```

use gpm_core::config::SyncConfig;
use gpm_core::{GpmError, GpmResult};
use std::path::{Component, Path, PathBuf};

const METAFILE_NAME: &str = "metafile";
const METADATA_BLOB_STEM: &str = "meta";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    reserved_name: String,
    output: PathBuf,
}

impl Layout {
    /// `output` overrides the configured output directory. A relative
    /// configured `output_dir` lives under the reserved directory.
    pub fn new(root: &Path, output: Option<&Path>, sync: &SyncConfig) -> Self {
        let reserved = root.join(&sync.reserved_dir);
        let output = match output {
            Some(dir) => dir.to_path_buf(),
            None if sync.output_dir.is_absolute() => sync.output_dir.clone(),
            None => reserved.join(&sync.output_dir),
        };
        Self {
            root: root.to_path_buf(),
            reserved_name: sync.reserved_dir.clone(),
            output,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn reserved_name(&self) -> &str {
        &self.reserved_name
    }

    pub fn reserved_dir(&self) -> PathBuf {
        self.root.join(&self.reserved_name)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn metafile(&self) -> PathBuf {
        self.reserved_dir().join(METAFILE_NAME)
    }

    /// File name of the encrypted metadata blob for a backend extension.
    pub fn metadata_blob_name(extension: &str) -> String {
        format!("{METADATA_BLOB_STEM}.{extension}")
    }

    pub fn metadata_blob(&self, extension: &str) -> PathBuf {
        self.output.join(Self::metadata_blob_name(extension))
    }

    /// Working-directory path for a metadata key.
    ///
    /// Keys must be relative, made only of normal components, and must not
    /// point into the reserved subtree.
    pub fn working_path(&self, rel: &str) -> GpmResult<PathBuf> {
        let path = Path::new(rel);
        if rel.is_empty() || path.is_absolute() {
            return Err(GpmError::PathOutsideRoot(rel.to_string()));
        }

        let mut components = path.components().peekable();
        if let Some(Component::Normal(first)) = components.peek() {
            if *first == self.reserved_name.as_str() {
                return Err(GpmError::PathOutsideRoot(rel.to_string()));
            }
        }
        if !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(GpmError::PathOutsideRoot(rel.to_string()));
        }

        Ok(self.root.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new(Path::new("/work"), None, &SyncConfig::default())
    }

    #[test]
    fn test_default_paths() {
        let l = layout();
        assert_eq!(l.reserved_dir(), PathBuf::from("/work/.gpm"));
        assert_eq!(l.output_dir(), Path::new("/work/.gpm/data"));
        assert_eq!(l.metafile(), PathBuf::from("/work/.gpm/metafile"));
        assert_eq!(l.metadata_blob("enc"), PathBuf::from("/work/.gpm/data/meta.enc"));
    }

    #[test]
    fn test_output_override() {
        let l = Layout::new(
            Path::new("/work"),
            Some(Path::new("/elsewhere/out")),
            &SyncConfig::default(),
        );
        assert_eq!(l.output_dir(), Path::new("/elsewhere/out"));

        let sync = SyncConfig {
            output_dir: PathBuf::from("/abs/out"),
            ..SyncConfig::default()
        };
        let l = Layout::new(Path::new("/work"), None, &sync);
        assert_eq!(l.output_dir(), Path::new("/abs/out"));
    }

    #[test]
    fn test_working_path_accepts_nested() {
        let l = layout();
        assert_eq!(
            l.working_path("dir/sub/file.txt").unwrap(),
            PathBuf::from("/work/dir/sub/file.txt")
        );
        assert!(l.working_path(".gpmrc").is_ok());
        assert!(l.working_path("docs/.gpm").is_ok());
    }

    #[test]
    fn test_working_path_rejects_escapes() {
        let l = layout();
        for bad in [
            "",
            "/etc/passwd",
            "../outside",
            "a/../../b",
            "./a",
            ".gpm/metafile",
            ".gpm",
        ] {
            assert!(
                matches!(l.working_path(bad), Err(GpmError::PathOutsideRoot(_))),
                "{bad:?} was accepted"
            );
        }
    }
}
