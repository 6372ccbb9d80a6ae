//! Content fingerprints for change detection (BLAKE3, hex-encoded).
//!
//! Only used to decide whether a file changed since the last encrypt; the
//! authentication tag on every blob is what protects integrity.

use gpm_core::GpmResult;
use std::io::Read;
use std::path::Path;

const READ_BLOCK: usize = 64 * 1024;

/// Fingerprint a file by streaming it in 64 KiB blocks.
pub fn fingerprint_file(path: &Path) -> GpmResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BLOCK];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

pub fn fingerprint_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_file_matches_bytes() {
        let data: Vec<u8> = (0..READ_BLOCK * 2 + 100).map(|i| (i % 251) as u8).collect();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let digest = fingerprint_file(tmp.path()).unwrap();
        assert_eq!(digest, fingerprint_bytes(&data));
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_empty_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(fingerprint_file(tmp.path()).unwrap(), fingerprint_bytes(b""));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fingerprint_file(&dir.path().join("absent")).is_err());
    }

    proptest! {
        #[test]
        fn any_single_byte_change_changes_digest(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            index in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let mut changed = data.clone();
            let i = index.index(changed.len());
            changed[i] = changed[i].wrapping_add(delta);
            prop_assert_ne!(fingerprint_bytes(&data), fingerprint_bytes(&changed));
        }
    }
}
