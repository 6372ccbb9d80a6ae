//! Cipher-backend contract and the in-process implementation.
//!
//! The reconciliation engine and metadata store only ever talk to a
//! [`CipherBackend`]; which one is used is a config decision.

use gpm_core::config::{BackendKind, GpmConfig};
use gpm_core::{GpmError, GpmResult};
use std::path::Path;

use crate::command::CommandBackend;
use crate::keys::KeyMaterial;
use crate::stream::StreamCipher;
use crate::DEFAULT_BLOCK_SIZE;

/// File-level symmetric encryption.
pub trait CipherBackend {
    /// Extension (without the dot) carried by every blob this backend writes.
    fn extension(&self) -> &str;

    /// Encrypt `plain` into `cipher`. Fails with `EncryptionFailed`.
    fn encrypt_file(&self, plain: &Path, cipher: &Path, key: &KeyMaterial) -> GpmResult<()>;

    /// Decrypt `cipher` into `plain`. A missing, corrupt, or wrongly keyed
    /// ciphertext fails with `InvalidToken` or `AuthenticationFailed`.
    fn decrypt_file(&self, cipher: &Path, plain: &Path, key: &KeyMaterial) -> GpmResult<()>;
}

/// In-process authenticated stream cipher.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    block_size: usize,
    ttl: Option<u64>,
}

impl NativeBackend {
    pub const EXTENSION: &'static str = "enc";

    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            ttl: None,
        }
    }

    /// Reject blobs older than `ttl` seconds on decrypt.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl CipherBackend for NativeBackend {
    fn extension(&self) -> &str {
        Self::EXTENSION
    }

    fn encrypt_file(&self, plain: &Path, cipher: &Path, key: &KeyMaterial) -> GpmResult<()> {
        StreamCipher::new(key.clone())
            .encrypt_file(plain, cipher, self.block_size)
            .map_err(|e| match e {
                GpmError::EncryptionFailed(_) => e,
                other => GpmError::EncryptionFailed(format!("{}: {other}", plain.display())),
            })
    }

    fn decrypt_file(&self, cipher: &Path, plain: &Path, key: &KeyMaterial) -> GpmResult<()> {
        if !cipher.is_file() {
            return Err(GpmError::invalid_token(format!(
                "ciphertext missing: {}",
                cipher.display()
            )));
        }
        StreamCipher::new(key.clone()).decrypt_file(cipher, plain, self.block_size, self.ttl)
    }
}

/// Backend selected at runtime from config.
#[derive(Debug, Clone)]
pub enum Backend {
    Native(NativeBackend),
    Command(CommandBackend),
}

impl Backend {
    pub fn from_config(config: &GpmConfig) -> Self {
        match config.crypto.backend {
            BackendKind::Native => {
                let native = NativeBackend::new(config.crypto.block_size);
                Backend::Native(match config.crypto.ttl_secs {
                    Some(ttl) => native.with_ttl(ttl),
                    None => native,
                })
            }
            BackendKind::Command => Backend::Command(CommandBackend::from_config(&config.command)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Native(_) => BackendKind::Native,
            Backend::Command(_) => BackendKind::Command,
        }
    }
}

impl CipherBackend for Backend {
    fn extension(&self) -> &str {
        match self {
            Backend::Native(b) => b.extension(),
            Backend::Command(b) => b.extension(),
        }
    }

    fn encrypt_file(&self, plain: &Path, cipher: &Path, key: &KeyMaterial) -> GpmResult<()> {
        match self {
            Backend::Native(b) => b.encrypt_file(plain, cipher, key),
            Backend::Command(b) => b.encrypt_file(plain, cipher, key),
        }
    }

    fn decrypt_file(&self, cipher: &Path, plain: &Path, key: &KeyMaterial) -> GpmResult<()> {
        match self {
            Backend::Native(b) => b.decrypt_file(cipher, plain, key),
            Backend::Command(b) => b.decrypt_file(cipher, plain, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use tempfile::TempDir;

    #[test]
    fn test_native_roundtrip() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::new(16);
        let key = generate_key();
        let plain = dir.path().join("a.txt");
        let blob = dir.path().join("blob.enc");
        let out = dir.path().join("out.txt");
        std::fs::write(&plain, b"hello backend, spanning several blocks").unwrap();

        backend.encrypt_file(&plain, &blob, &key).unwrap();
        backend.decrypt_file(&blob, &out, &key).unwrap();
        assert_eq!(
            std::fs::read(&out).unwrap(),
            b"hello backend, spanning several blocks"
        );
    }

    #[test]
    fn test_native_missing_ciphertext_is_invalid_token() {
        let dir = TempDir::new().unwrap();
        let err = NativeBackend::default()
            .decrypt_file(
                &dir.path().join("nope.enc"),
                &dir.path().join("out"),
                &generate_key(),
            )
            .unwrap_err();
        assert!(matches!(err, GpmError::InvalidToken(_)));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_native_missing_plaintext_is_encryption_failed() {
        let dir = TempDir::new().unwrap();
        let err = NativeBackend::default()
            .encrypt_file(
                &dir.path().join("absent.txt"),
                &dir.path().join("blob.enc"),
                &generate_key(),
            )
            .unwrap_err();
        assert!(matches!(err, GpmError::EncryptionFailed(_)));
    }

    #[test]
    fn test_native_wrong_key() {
        let dir = TempDir::new().unwrap();
        let backend = NativeBackend::default();
        let plain = dir.path().join("a.txt");
        let blob = dir.path().join("blob.enc");
        std::fs::write(&plain, b"secret").unwrap();
        backend.encrypt_file(&plain, &blob, &generate_key()).unwrap();

        let err = backend
            .decrypt_file(&blob, &dir.path().join("out"), &generate_key())
            .unwrap_err();
        assert!(err.is_authentication());
    }

    /// A blob stamped long ago.
    fn write_old_blob(path: &Path, key: &KeyMaterial) {
        let token: Vec<u8> = StreamCipher::new(key.clone())
            .encrypt_stream_at(std::iter::once(Ok(b"old".to_vec())), 1_000)
            .unwrap()
            .collect::<GpmResult<Vec<_>>>()
            .unwrap()
            .concat();
        std::fs::write(path, token).unwrap();
    }

    #[test]
    fn test_native_ttl_rejects_old_blob() {
        let dir = TempDir::new().unwrap();
        let key = generate_key();
        let blob = dir.path().join("old.enc");
        write_old_blob(&blob, &key);

        let strict = NativeBackend::default().with_ttl(60);
        assert!(strict
            .decrypt_file(&blob, &dir.path().join("out"), &key)
            .is_err());
        NativeBackend::default()
            .decrypt_file(&blob, &dir.path().join("out"), &key)
            .unwrap();
    }

    #[test]
    fn test_backend_from_config() {
        let mut config = GpmConfig::default();
        let native = Backend::from_config(&config);
        assert_eq!(native.kind(), BackendKind::Native);
        assert_eq!(native.extension(), "enc");

        config.crypto.backend = BackendKind::Command;
        let command = Backend::from_config(&config);
        assert_eq!(command.kind(), BackendKind::Command);
        assert_eq!(command.extension(), "gpg");
    }

    #[test]
    fn test_backend_from_config_applies_ttl() {
        let dir = TempDir::new().unwrap();
        let key = generate_key();
        let blob = dir.path().join("old.enc");
        write_old_blob(&blob, &key);

        let mut config = GpmConfig::default();
        let Backend::Native(unlimited) = Backend::from_config(&config) else {
            panic!("expected the native backend");
        };
        assert_eq!(unlimited.ttl(), None);

        config.crypto.ttl_secs = Some(3600);
        let limited = Backend::from_config(&config);
        let Backend::Native(native) = &limited else {
            panic!("expected the native backend");
        };
        assert_eq!(native.ttl(), Some(3600));

        let err = limited
            .decrypt_file(&blob, &dir.path().join("out"), &key)
            .unwrap_err();
        assert!(matches!(err, GpmError::InvalidToken(_)));
        assert!(!dir.path().join("out").exists());
    }
}
