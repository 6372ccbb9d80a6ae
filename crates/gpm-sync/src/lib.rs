//! gpm-sync: keeps a working directory, its encrypted metadata, and the blob
//! store mutually consistent across encrypt/decrypt cycles

pub mod blob;
pub mod engine;
pub mod fingerprint;
pub mod layout;
pub mod metadata;

pub use blob::BlobStore;
pub use engine::{
    DecryptReport, EncryptReport, Engine, EngineOptions, FileStatus, ProgressFn, StatusEntry,
};
pub use layout::Layout;
pub use metadata::{Entry, MetadataStore};
