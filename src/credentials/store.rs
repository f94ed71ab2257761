//! On-disk credential store

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{default_label, CredentialError, Identities, KeyMaterial, Keyring};
use crate::config::CredentialsConfig;

pub const PRIVATE_KEY_FILE: &str = "adbkey";
pub const PUBLIC_KEY_FILE: &str = "adbkey.pub";

/// Owns the single persisted identity under `key_dir`.
///
/// Built once at startup and shared (usually behind an `Arc`) with whatever
/// performs authentication.
#[derive(Debug)]
pub struct CredentialStore {
    key_dir: PathBuf,
    label: String,
    /// Serializes `generate_key` so two generations never interleave their writes
    generation: Mutex<()>,
}

impl CredentialStore {
    /// `label` is used for newly generated keys; `None` means `<user>@<host>`.
    pub fn new(key_dir: impl Into<PathBuf>, label: Option<String>) -> Self {
        Self {
            key_dir: key_dir.into(),
            label: label
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(default_label),
            generation: Mutex::new(()),
        }
    }

    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self::new(config.key_dir.clone(), config.label.clone())
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.key_dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.key_dir.join(PUBLIC_KEY_FILE)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Generate a new keypair and persist it, overwriting any existing one.
    ///
    /// This is irreversible: devices that trusted the previous key will prompt
    /// again. The key directory must already exist.
    pub async fn generate_key(&self) -> Result<KeyMaterial, CredentialError> {
        let _guard = self.generation.lock().await;

        let label = self.label.clone();
        let key = tokio::task::spawn_blocking(move || KeyMaterial::generate(label))
            .await
            .map_err(|e| CredentialError::Generate(e.to_string()))??;

        let pem = key.private_key_pem()?;
        write_file(&self.private_key_path(), pem.as_bytes(), true).await?;
        write_file(&self.public_key_path(), key.public_key_line().as_bytes(), false).await?;

        info!(
            label = %key.label(),
            fingerprint = %key.fingerprint(),
            path = %self.private_key_path().display(),
            "Generated new identity"
        );
        Ok(key)
    }

    /// Lazily read the stored identities. Each call starts a fresh pass.
    pub fn load_keys(&self) -> StoredKeys {
        StoredKeys {
            private_key_path: self.private_key_path(),
            public_key_path: self.public_key_path(),
            done: false,
        }
    }

    /// The stored identity, if any.
    pub fn load(&self) -> Result<KeyMaterial, CredentialError> {
        self.load_keys().next().unwrap_or_else(|| {
            Err(CredentialError::NotFound {
                path: self.private_key_path(),
            })
        })
    }
}

#[async_trait]
impl Keyring for CredentialStore {
    fn identities(&self) -> Identities {
        Box::new(self.load_keys())
    }

    async fn generate_key(&self) -> Result<KeyMaterial, CredentialError> {
        CredentialStore::generate_key(self).await
    }
}

/// Iterator over the identities found on disk.
///
/// Yields at most one item: the stored key, or the error that prevented
/// reading it (`NotFound` when no key has been generated yet). `next()` reads
/// the key files with blocking I/O; async callers pull it on the blocking pool.
#[derive(Debug)]
pub struct StoredKeys {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
    done: bool,
}

impl Iterator for StoredKeys {
    type Item = Result<KeyMaterial, CredentialError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(self.read())
    }
}

impl StoredKeys {
    fn read(&self) -> Result<KeyMaterial, CredentialError> {
        let path = &self.private_key_path;
        let pem = match std::fs::read_to_string(path) {
            Ok(content) => Zeroizing::new(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CredentialError::NotFound { path: path.clone() });
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(CredentialError::Parse {
                    path: path.clone(),
                    reason: "not a text file".to_string(),
                });
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };

        let der = decode_pem_body(&pem).map_err(|reason| CredentialError::Parse {
            path: path.clone(),
            reason,
        })?;
        let label = read_label(&self.public_key_path);

        let key = KeyMaterial::from_pkcs8_der(&der, label).map_err(|e| CredentialError::Parse {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!(label = %key.label(), fingerprint = %key.fingerprint(), "Loaded identity");
        Ok(key)
    }
}

/// Strip `-----` framing lines and base64-decode what is left.
fn decode_pem_body(pem: &str) -> Result<Zeroizing<Vec<u8>>, String> {
    if !pem.lines().any(|l| l.trim_start().starts_with("-----BEGIN")) {
        return Err("missing PEM header".to_string());
    }
    let body: Zeroizing<String> = Zeroizing::new(
        pem.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("-----"))
            .collect(),
    );
    if body.is_empty() {
        return Err("empty PEM body".to_string());
    }
    STANDARD
        .decode(body.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| format!("invalid base64: {}", e))
}

/// Label is everything after the first space of `adbkey.pub`.
/// Empty when the file is missing or has no label; the caller falls back.
fn read_label(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| {
            content
                .split_once(' ')
                .map(|(_, label)| label.trim().to_string())
        })
        .unwrap_or_default()
}

async fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<(), CredentialError> {
    let io_err = |source: std::io::Error| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path).await.map_err(io_err)?;
    // `mode` only applies on creation; tighten a pre-existing file too
    #[cfg(unix)]
    {
        if private {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(io_err)?;
        }
    }
    file.write_all(contents).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(())
}
