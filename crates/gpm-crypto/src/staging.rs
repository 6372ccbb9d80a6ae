//! Write-then-rename staging for ciphertext and plaintext outputs.
//!
//! Outputs are produced next to their destination under a hidden
//! `.{name}.gpm-partial` name and only renamed into place once complete
//! (for decryption: once the tag has verified).

use std::path::{Path, PathBuf};

/// Suffix of in-flight output files.
pub const STAGING_SUFFIX: &str = ".gpm-partial";

/// Sibling staging path for `dst`.
pub fn staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!(".{name}{STAGING_SUFFIX}"))
}

/// True if `name` is a leftover staging file.
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

/// Move a finished staging file over its destination.
pub fn commit(staged: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::rename(staged, dst)
}

/// Best-effort removal of an abandoned staging file.
pub fn discard(staged: &Path) {
    if let Err(e) = std::fs::remove_file(staged) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %staged.display(), "failed to remove partial output: {e}");
        }
    }
}
