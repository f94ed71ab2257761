//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Directory holding `adbkey` and `adbkey.pub`
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Label written next to a freshly generated public key.
    /// Falls back to `<user>@<host>` when unset.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// How long to wait for the device to send a challenge
    #[serde(default = "default_challenge_timeout")]
    pub challenge_timeout_ms: u64,

    /// How long to wait for the device to accept or reject a response.
    /// Registering a new key needs the device user to confirm it.
    #[serde(default = "default_verdict_timeout")]
    pub verdict_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Largest chunk read from one side before it is written to the other
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// One `<local> -> <service>` forwarding rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardConfig {
    /// Local endpoint spec, e.g. `tcp:8899`
    pub local: String,

    /// Remote service name, e.g. `tcp:127.0.0.1:8899`
    pub service: String,
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

impl AuthConfig {
    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_millis(self.challenge_timeout_ms)
    }

    pub fn verdict_timeout(&self) -> Duration {
        Duration::from_millis(self.verdict_timeout_ms)
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            key_dir: default_key_dir(),
            label: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_timeout_ms: default_challenge_timeout(),
            verdict_timeout_ms: default_verdict_timeout(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: CredentialsConfig::default(),
            auth: AuthConfig::default(),
            relay: RelayConfig::default(),
            forward: vec![],
        }
    }
}

// Defaults
fn default_key_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".android")
}
fn default_challenge_timeout() -> u64 { 10_000 }
fn default_verdict_timeout() -> u64 { 60_000 }
fn default_chunk_size() -> usize { 64 * 1024 }
