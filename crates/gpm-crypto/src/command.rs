//! External symmetric-cipher tool as a drop-in backend (gpg by default).

use gpm_core::config::CommandConfig;
use gpm_core::{GpmError, GpmResult};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use zeroize::Zeroizing;

use crate::backend::CipherBackend;
use crate::keys::KeyMaterial;
use crate::staging;

/// Runs `program` with templated arguments; `{input}` and `{output}` are
/// replaced by file paths and the key is written to the tool's stdin as
/// url-safe base64 followed by a newline.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    encrypt_args: Vec<String>,
    decrypt_args: Vec<String>,
    extension: String,
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

impl CommandBackend {
    pub fn from_config(config: &CommandConfig) -> Self {
        Self {
            program: config.program.clone(),
            encrypt_args: config.encrypt_args.clone(),
            decrypt_args: config.decrypt_args.clone(),
            extension: config.extension.clone(),
        }
    }

    fn run(&self, direction: Direction, src: &Path, dst: &Path, key: &KeyMaterial) -> GpmResult<()> {
        let template = match direction {
            Direction::Encrypt => &self.encrypt_args,
            Direction::Decrypt => &self.decrypt_args,
        };
        let staged = staging::staging_path(dst);
        let input = src.to_string_lossy();
        let output = staged.to_string_lossy();
        let args: Vec<String> = template
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect();

        tracing::debug!(program = %self.program, src = %src.display(), "running cipher tool");

        let result = self.spawn_and_wait(&args, key);
        match result {
            Ok(output) if output.status.success() && staged.exists() => {
                staging::commit(&staged, dst)?;
                Ok(())
            }
            Ok(output) => {
                staging::discard(&staged);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                );
                Err(match direction {
                    Direction::Encrypt => GpmError::EncryptionFailed(reason),
                    Direction::Decrypt => GpmError::AuthenticationFailed(reason),
                })
            }
            Err(e) => {
                staging::discard(&staged);
                Err(match direction {
                    Direction::Encrypt => {
                        GpmError::EncryptionFailed(format!("running {}: {e}", self.program))
                    }
                    Direction::Decrypt => e.into(),
                })
            }
        }
    }

    fn spawn_and_wait(
        &self,
        args: &[String],
        key: &KeyMaterial,
    ) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = Zeroizing::new(key.to_base64());
            line.push('\n');
            // Tools that never read stdin close it early.
            match stdin.write_all(line.as_bytes()) {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
        }

        child.wait_with_output()
    }
}

impl CipherBackend for CommandBackend {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn encrypt_file(&self, plain: &Path, cipher: &Path, key: &KeyMaterial) -> GpmResult<()> {
        if !plain.is_file() {
            return Err(GpmError::EncryptionFailed(format!(
                "plaintext missing: {}",
                plain.display()
            )));
        }
        self.run(Direction::Encrypt, plain, cipher, key)
    }

    fn decrypt_file(&self, cipher: &Path, plain: &Path, key: &KeyMaterial) -> GpmResult<()> {
        if !cipher.is_file() {
            return Err(GpmError::invalid_token(format!(
                "ciphertext missing: {}",
                cipher.display()
            )));
        }
        self.run(Direction::Decrypt, cipher, plain, key)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use tempfile::TempDir;

    /// A fake tool: "encryption" prefixes the key line, "decryption"
    /// checks it and strips it.
    fn fake_tool() -> CommandBackend {
        let sh = |script: &str| {
            vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{input}".to_string(),
                "{output}".to_string(),
            ]
        };
        CommandBackend::from_config(&CommandConfig {
            program: "sh".into(),
            encrypt_args: sh(r#"read -r k; { printf '%s\n' "$k"; cat "$1"; } > "$2""#),
            decrypt_args: sh(
                r#"read -r k; IFS= read -r stored < "$1"; [ "$k" = "$stored" ] || exit 2; tail -n +2 "$1" > "$2""#,
            ),
            extension: "fake".into(),
        })
    }

    #[test]
    fn test_command_roundtrip() {
        let dir = TempDir::new().unwrap();
        let backend = fake_tool();
        let key = generate_key();
        let plain = dir.path().join("a.txt");
        let blob = dir.path().join("blob.fake");
        let out = dir.path().join("out.txt");
        std::fs::write(&plain, "line one\nline two\n").unwrap();

        backend.encrypt_file(&plain, &blob, &key).unwrap();
        assert!(!staging::staging_path(&blob).exists());
        backend.decrypt_file(&blob, &out, &key).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "line one\nline two\n");
        assert_eq!(backend.extension(), "fake");
    }

    #[test]
    fn test_command_wrong_key_is_authentication_failure() {
        let dir = TempDir::new().unwrap();
        let backend = fake_tool();
        let plain = dir.path().join("a.txt");
        let blob = dir.path().join("blob.fake");
        let out = dir.path().join("out.txt");
        std::fs::write(&plain, "secret\n").unwrap();
        backend.encrypt_file(&plain, &blob, &generate_key()).unwrap();

        let err = backend
            .decrypt_file(&blob, &out, &generate_key())
            .unwrap_err();
        assert!(matches!(err, GpmError::AuthenticationFailed(_)));
        assert!(!out.exists());
        assert!(!staging::staging_path(&out).exists());
    }

    #[test]
    fn test_command_missing_ciphertext() {
        let dir = TempDir::new().unwrap();
        let err = fake_tool()
            .decrypt_file(
                &dir.path().join("gone.fake"),
                &dir.path().join("out"),
                &generate_key(),
            )
            .unwrap_err();
        assert!(matches!(err, GpmError::InvalidToken(_)));
    }

    #[test]
    fn test_command_failing_tool_is_encryption_failed() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("a.txt");
        std::fs::write(&plain, "x").unwrap();
        let backend = CommandBackend::from_config(&CommandConfig {
            program: "sh".into(),
            encrypt_args: vec!["-c".into(), "exit 3".into()],
            decrypt_args: vec![],
            extension: "x".into(),
        });

        let err = backend
            .encrypt_file(&plain, &dir.path().join("blob.x"), &generate_key())
            .unwrap_err();
        assert!(matches!(err, GpmError::EncryptionFailed(_)));
    }

    #[test]
    fn test_command_missing_program() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("a.txt");
        std::fs::write(&plain, "x").unwrap();
        let backend = CommandBackend::from_config(&CommandConfig {
            program: "/nonexistent/gpm-cipher-tool".into(),
            ..CommandConfig::default()
        });

        let err = backend
            .encrypt_file(&plain, &dir.path().join("blob.gpg"), &generate_key())
            .unwrap_err();
        assert!(matches!(err, GpmError::EncryptionFailed(_)));
    }
}
