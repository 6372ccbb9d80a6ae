//! Key derivation: Argon2id passphrase → master key

use argon2::{Algorithm, Argon2, Params, Version};
use gpm_core::config::CryptoConfig;
use gpm_core::{GpmError, GpmResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::keys::KeyMaterial;
use crate::KEY_SIZE;

/// Salt for passphrase-derived master keys.
///
/// Fixed because the output directory must stay self-contained: a copy of the
/// blobs plus the metadata blob, and the passphrase, is all a second machine gets.
pub const MASTER_KEY_SALT: [u8; 16] = *b"gpm-metadata-v1\0";

/// A 256-bit master key, either derived from a passphrase via Argon2id or
/// supplied directly as a url-safe base64 key.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Accept a raw key as produced by `gpm keygen`.
    pub fn from_base64(encoded: &str) -> GpmResult<Self> {
        let key = KeyMaterial::from_base64(encoded)?;
        Ok(Self::from_bytes(*key.as_bytes()))
    }

    /// Derive from a passphrase with the fixed master salt.
    pub fn from_passphrase(passphrase: &SecretString, params: &KdfParams) -> GpmResult<Self> {
        derive_master_key(passphrase, &MASTER_KEY_SALT, params)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Derive a 256-bit master key from a passphrase and salt using Argon2id.
///
/// An empty passphrase is a configuration error, not a key.
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8; 16],
    params: &KdfParams,
) -> GpmResult<MasterKey> {
    if passphrase.expose_secret().is_empty() {
        return Err(GpmError::Config("passphrase is empty".into()));
    }

    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| GpmError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| GpmError::InvalidKey(format!("Argon2id KDF failed: {e}")))?;

    Ok(MasterKey::from_bytes(key))
}
