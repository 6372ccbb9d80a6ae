//! Key material: 256-bit keys split into signing and encryption halves

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use gpm_core::{GpmError, GpmResult};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

/// A 256-bit key handed to a cipher backend. Zeroized on drop.
///
/// The first half signs (HMAC), the second half encrypts (AES-128-CTR).
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: [u8; KEY_SIZE],
}

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build from an arbitrary slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> GpmResult<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            GpmError::InvalidKey(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(arr))
    }

    /// Decode a url-safe base64 key (the form stored in metadata entries).
    pub fn from_base64(encoded: &str) -> GpmResult<Self> {
        let mut raw = URL_SAFE
            .decode(encoded.trim())
            .map_err(|e| GpmError::InvalidKey(format!("key is not url-safe base64: {e}")))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.bytes[..KEY_SIZE / 2]
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.bytes[KEY_SIZE / 2..]
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> KeyMaterial {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    KeyMaterial::from_bytes(bytes)
}

/// Derive the metadata encryption key from the master key via HKDF-SHA256.
pub fn derive_metadata_key(master: &MasterKey) -> GpmResult<KeyMaterial> {
    hkdf_derive(master.as_bytes(), b"gpm-metadata")
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> GpmResult<KeyMaterial> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| GpmError::InvalidKey(format!("HKDF expand failed: {e}")))?;
    Ok(KeyMaterial::from_bytes(okm))
}
