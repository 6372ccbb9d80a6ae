use std::path::PathBuf;
use thiserror::Error;

pub type GpmResult<T> = Result<T, GpmError>;

#[derive(Debug, Error)]
pub enum GpmError {
    /// Bad or missing configuration, detected before any I/O.
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Decrypt requested but nothing was ever encrypted into the output directory.
    #[error("no encrypted metadata found at {}", .0.display())]
    NoMetadata(PathBuf),

    /// Format, authentication, or freshness failure of a ciphertext stream.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// External backend rejected the ciphertext (wrong key or corrupt input).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("failed to allocate a unique blob id after {0} attempts")]
    IdSpaceExhausted(usize),

    #[error("path escapes the working root: {0}")]
    PathOutsideRoot(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GpmError {
    /// Shorthand used by the cipher layer for every rejected token.
    pub fn invalid_token(reason: impl Into<String>) -> Self {
        GpmError::InvalidToken(reason.into())
    }

    /// True for errors that mean "the ciphertext or the key is wrong".
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            GpmError::InvalidToken(_) | GpmError::AuthenticationFailed(_)
        )
    }
}
