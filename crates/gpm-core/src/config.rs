use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GpmError, GpmResult};

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpmConfig {
    pub crypto: CryptoConfig,
    pub command: CommandConfig,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

/// Which cipher backend encrypts blobs and metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process authenticated stream cipher
    Native,
    /// External symmetric-cipher tool (see `[command]`)
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Cipher backend (default: native)
    pub backend: BackendKind,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Read block size for streaming file encryption (default: 64 KiB)
    pub block_size: usize,
    /// Generate a random key per blob and keep it in the encrypted metadata
    pub per_file_keys: bool,
    /// Refuse to decrypt native blobs older than this many seconds, the
    /// metadata blob included (default: unset, no age limit). Ignored by
    /// the command backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// External cipher tool invocation. `{input}` and `{output}` are substituted
/// in the argument lists; the key is written to the tool's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub encrypt_args: Vec<String>,
    pub decrypt_args: Vec<String>,
    /// File extension for blobs and the metadata blob
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Reserved metadata subtree under the working root
    pub reserved_dir: String,
    /// Output directory; relative paths are resolved against the reserved dir
    pub output_dir: PathBuf,
    /// Blob id allocation attempts before giving up
    pub id_attempts: usize,
    /// Glob patterns (matched against file names) to leave out of the mirror
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            block_size: 64 * 1024,
            per_file_keys: true,
            ttl_secs: None,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "gpg".into(),
            encrypt_args: gpg_args("--symmetric"),
            decrypt_args: gpg_args("--decrypt"),
            extension: "gpg".into(),
        }
    }
}

/// Non-interactive gpg invocation reading the passphrase from stdin.
fn gpg_args(mode: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "--batch",
        "--yes",
        "--quiet",
        "--pinentry-mode",
        "loopback",
        "--passphrase-fd",
        "0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(mode.to_string());
    args.extend(["--output", "{output}", "{input}"].map(String::from));
    args
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reserved_dir: ".gpm".into(),
            output_dir: PathBuf::from("data"),
            id_attempts: 10,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl GpmConfig {
    /// Parse a config file; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> GpmResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: GpmConfig = toml::from_str(&content)
            .map_err(|e| GpmError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, mid-run.
    pub fn validate(&self) -> GpmResult<()> {
        if self.crypto.block_size == 0 {
            return Err(GpmError::Config("crypto.block_size must be > 0".into()));
        }
        if self.crypto.ttl_secs == Some(0) {
            return Err(GpmError::Config("crypto.ttl_secs must be > 0".into()));
        }
        if self.sync.id_attempts == 0 {
            return Err(GpmError::Config("sync.id_attempts must be > 0".into()));
        }
        let reserved = Path::new(&self.sync.reserved_dir);
        if self.sync.reserved_dir.is_empty()
            || reserved.is_absolute()
            || reserved.components().count() != 1
        {
            return Err(GpmError::Config(format!(
                "sync.reserved_dir must be a single relative directory name, got {:?}",
                self.sync.reserved_dir
            )));
        }
        if self.crypto.backend == BackendKind::Command {
            if self.command.program.is_empty() {
                return Err(GpmError::Config("command.program is empty".into()));
            }
            if self.command.extension.is_empty() {
                return Err(GpmError::Config("command.extension is empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[crypto]
backend = "command"
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8
block_size = 4096
per_file_keys = false
ttl_secs = 86400

[command]
program = "age"
encrypt_args = ["-p", "-o", "{output}", "{input}"]
decrypt_args = ["-d", "-o", "{output}", "{input}"]
extension = "age"

[sync]
reserved_dir = ".vault"
output_dir = "/srv/mirror"
id_attempts = 3
exclude_patterns = ["*.swp", ".DS_Store"]

[log]
level = "debug"
format = "json"
"#;
        let config: GpmConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.crypto.backend, BackendKind::Command);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.block_size, 4096);
        assert!(!config.crypto.per_file_keys);
        assert_eq!(config.crypto.ttl_secs, Some(86400));
        assert_eq!(config.command.program, "age");
        assert_eq!(config.command.extension, "age");
        assert_eq!(config.sync.reserved_dir, ".vault");
        assert_eq!(config.sync.output_dir, PathBuf::from("/srv/mirror"));
        assert_eq!(config.sync.exclude_patterns.len(), 2);
        assert_eq!(config.log.format, "json");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: GpmConfig = toml::from_str("").unwrap();

        assert_eq!(config.crypto.backend, BackendKind::Native);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(config.crypto.block_size, 65536);
        assert!(config.crypto.per_file_keys);
        assert_eq!(config.crypto.ttl_secs, None);
        assert_eq!(config.command.program, "gpg");
        assert!(config.command.encrypt_args.contains(&"--symmetric".to_string()));
        assert!(config.command.decrypt_args.contains(&"--decrypt".to_string()));
        assert_eq!(config.sync.reserved_dir, ".gpm");
        assert_eq!(config.sync.output_dir, PathBuf::from("data"));
        assert_eq!(config.sync.id_attempts, 10);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[sync]
exclude_patterns = ["*.tmp"]
"#;
        let config: GpmConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.sync.exclude_patterns, vec!["*.tmp".to_string()]);
        // Defaults
        assert_eq!(config.sync.reserved_dir, ".gpm");
        assert_eq!(config.crypto.backend, BackendKind::Native);
    }

    #[test]
    fn test_validate_rejects_nested_reserved_dir() {
        let mut config = GpmConfig::default();
        config.sync.reserved_dir = "a/b".into();
        assert!(matches!(config.validate(), Err(GpmError::Config(_))));

        config.sync.reserved_dir = String::new();
        assert!(matches!(config.validate(), Err(GpmError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = GpmConfig::default();
        config.crypto.block_size = 0;
        assert!(config.validate().is_err());

        let mut config = GpmConfig::default();
        config.sync.id_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GpmConfig::default();
        config.crypto.ttl_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = GpmConfig::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.sync.id_attempts, 10);
    }

    #[test]
    fn test_load_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[crypto\nbackend = ").unwrap();
        assert!(matches!(
            GpmConfig::load_or_default(&path),
            Err(GpmError::Config(_))
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = GpmConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: GpmConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.sync.reserved_dir, parsed.sync.reserved_dir);
        assert_eq!(config.command.encrypt_args, parsed.command.encrypt_args);
        assert_eq!(config.crypto.backend, parsed.crypto.backend);
        assert!(!toml_str.contains("ttl_secs"));

        let mut limited = GpmConfig::default();
        limited.crypto.ttl_secs = Some(3600);
        let parsed: GpmConfig = toml::from_str(&toml::to_string(&limited).unwrap()).unwrap();
        assert_eq!(parsed.crypto.ttl_secs, Some(3600));
    }
}
