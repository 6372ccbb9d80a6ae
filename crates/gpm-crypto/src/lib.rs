//! gpm-crypto: authenticated stream cipher and cipher backends for gpm
//!
//! Token layout (one per blob, one for the metadata record):
//! ```text
//! magic (1) | timestamp (8, BE unix secs) | nonce (16) | ciphertext (N) | tag (32)
//! ```
//! The ciphertext is an AES-128-CTR keystream over the plaintext (no padding),
//! the tag is HMAC-SHA256 over everything before it.
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from passphrase, or a raw base64 key)
//!   ├── Metadata Key (HKDF from master key, info="gpm-metadata")
//!   └── Blob Keys (per entry, 256-bit random, stored in the encrypted metadata)
//! Each 256-bit key splits into signing (first 16 B) and encryption (last 16 B) halves.
//! ```

pub mod backend;
pub mod command;
pub mod kdf;
pub mod keys;
pub mod staging;
pub mod stream;

pub use backend::{Backend, CipherBackend, NativeBackend};
pub use command::CommandBackend;
pub use kdf::{derive_master_key, KdfParams, MasterKey};
pub use keys::{derive_metadata_key, generate_key, KeyMaterial};
pub use stream::{read_blocks, DecryptStream, EncryptStream, StreamCipher};

/// Size of every key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the random per-token nonce (AES-CTR initial counter block)
pub const NONCE_SIZE: usize = 16;

/// Size of the HMAC-SHA256 tag
pub const TAG_SIZE: usize = 32;

/// magic + timestamp + nonce
pub const HEADER_SIZE: usize = 1 + 8 + NONCE_SIZE;

/// Leading byte of every token
pub const MAGIC: u8 = 0x8a;

/// Tolerated clock skew for tokens stamped in the future (seconds)
pub const MAX_CLOCK_SKEW: u64 = 60;

/// Default read block size for file streaming
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
