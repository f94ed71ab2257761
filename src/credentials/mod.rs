//! Host identity for device authentication
//!
//! A host proves itself to a device by signing the device's challenge with an
//! RSA key the device has previously been told to trust. This module owns that
//! key: generation, persistence under `~/.android`, and the derived public key
//! the device stores.
//!
//! ```text
//! ~/.android/
//! ├── adbkey        # PKCS#8 private key, PEM framed
//! └── adbkey.pub    # "<base64 device public key> <label>\n"
//! ```

use std::path::PathBuf;

use async_trait::async_trait;

mod key;
pub mod public_key;
mod store;

pub use key::{Challenge, KeyError, KeyMaterial, Signature, MODULUS_BITS, PUBLIC_EXPONENT};
pub use store::{CredentialStore, StoredKeys, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};

/// Credential errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No key has been generated yet. Benign: the caller generates one.
    #[error("No private key at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A key exists but cannot be used. Never repaired automatically since the
    /// device may already trust it.
    #[error("Unreadable private key at {} (remove or fix it manually): {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("Key generation failed: {0}")]
    Generate(String),

    #[error("Signing failed: {0}")]
    Sign(String),
}

impl CredentialError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CredentialError::NotFound { .. })
    }
}

/// Lazy, finite sequence of candidate identities.
pub type Identities = Box<dyn Iterator<Item = Result<KeyMaterial, CredentialError>> + Send>;

/// A source of identities for the authentication handshake.
///
/// `identities()` must be restartable: every call starts a fresh pass over
/// whatever is currently stored.
#[async_trait]
pub trait Keyring: Send + Sync {
    fn identities(&self) -> Identities;

    /// Mint and persist a new identity, replacing any stored one.
    async fn generate_key(&self) -> Result<KeyMaterial, CredentialError>;
}

/// `<user>@<host>` for the current process.
pub fn default_label() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_label_shape() {
        let label = default_label();
        let (user, host) = label.split_once('@').expect("user@host");
        assert!(!user.is_empty());
        assert!(!host.is_empty());
    }

    #[test]
    fn test_not_found_is_distinct_from_parse() {
        let missing = CredentialError::NotFound { path: "adbkey".into() };
        let broken = CredentialError::Parse {
            path: "adbkey".into(),
            reason: "bad base64".into(),
        };
        assert!(missing.is_not_found());
        assert!(!broken.is_not_found());
        assert!(broken.to_string().contains("manually"));
    }
}
