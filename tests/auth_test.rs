//! Authentication handshake integration tests
//!
//! A simulated device issues random tokens, verifies signatures against the
//! public keys it trusts, and optionally lets its user accept a new key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adb_bridge::auth::{AuthError, AuthState, AuthTransport, AuthenticationParticipant, Verdict};
use adb_bridge::config::AuthConfig;
use adb_bridge::credentials::{
    public_key, Challenge, CredentialError, CredentialStore, Identities, KeyMaterial, Keyring,
    Signature,
};
use async_trait::async_trait;
use rand::RngCore;

// =============================================================================
// Test doubles
// =============================================================================

/// In-memory keyring holding pre-generated keys as PKCS#8 DER.
struct MemoryKeyring {
    keys: Vec<Vec<u8>>,
    broken: bool,
    generated: AtomicUsize,
}

impl MemoryKeyring {
    fn with_keys(count: usize) -> Self {
        let keys = (0..count)
            .map(|i| {
                KeyMaterial::generate(format!("key{}@test", i))
                    .unwrap()
                    .private_key_der()
                    .to_vec()
            })
            .collect();
        Self {
            keys,
            broken: false,
            generated: AtomicUsize::new(0),
        }
    }

    fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Keyring for MemoryKeyring {
    fn identities(&self) -> Identities {
        if self.broken {
            return Box::new(std::iter::once(Err(CredentialError::Parse {
                path: "adbkey".into(),
                reason: "corrupt".to_string(),
            })));
        }
        let keys = self.keys.clone();
        Box::new(keys.into_iter().enumerate().map(|(i, der)| {
            KeyMaterial::from_pkcs8_der(&der, format!("key{}@test", i)).map_err(|e| {
                CredentialError::Parse {
                    path: "memory".into(),
                    reason: e.to_string(),
                }
            })
        }))
    }

    async fn generate_key(&self) -> Result<KeyMaterial, CredentialError> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        tokio::task::spawn_blocking(|| KeyMaterial::generate("fresh@test"))
            .await
            .unwrap()
    }
}

#[derive(Default)]
struct DeviceLog {
    challenges: usize,
    signatures: usize,
    public_keys: Vec<(Vec<u8>, String)>,
}

/// Device that trusts a fixed set of public keys (device encoding).
struct SimulatedDevice {
    trusted: Vec<Vec<u8>>,
    accept_new_keys: bool,
    outstanding: Option<Vec<u8>>,
    next_verdict: Option<Verdict>,
    log: Arc<Mutex<DeviceLog>>,
}

impl SimulatedDevice {
    fn new(trusted: Vec<Vec<u8>>, accept_new_keys: bool) -> Self {
        Self {
            trusted,
            accept_new_keys,
            outstanding: None,
            next_verdict: None,
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }
}

#[async_trait]
impl AuthTransport for SimulatedDevice {
    async fn next_challenge(&mut self) -> Result<Challenge, AuthError> {
        let mut token = vec![0u8; 20];
        rand::thread_rng().fill_bytes(&mut token);
        self.outstanding = Some(token.clone());
        self.log.lock().unwrap().challenges += 1;
        Ok(Challenge::new(token))
    }

    async fn send_signature(&mut self, signature: Signature) -> Result<(), AuthError> {
        let token = self
            .outstanding
            .take()
            .ok_or_else(|| AuthError::Transport("signature without challenge".to_string()))?;
        self.log.lock().unwrap().signatures += 1;
        let accepted = self.trusted.iter().any(|encoded| {
            let key = public_key::decode(encoded).unwrap();
            signature.verify(&key, &token)
        });
        self.next_verdict = Some(if accepted { Verdict::Accepted } else { Verdict::Rejected });
        Ok(())
    }

    async fn send_public_key(&mut self, public_key: &[u8], label: &str) -> Result<(), AuthError> {
        self.outstanding
            .take()
            .ok_or_else(|| AuthError::Transport("public key without challenge".to_string()))?;
        self.log
            .lock()
            .unwrap()
            .public_keys
            .push((public_key.to_vec(), label.to_string()));
        self.next_verdict = Some(if self.accept_new_keys {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        });
        Ok(())
    }

    async fn verdict(&mut self) -> Result<Verdict, AuthError> {
        self.next_verdict
            .take()
            .ok_or_else(|| AuthError::Transport("nothing to judge".to_string()))
    }
}

/// Device that never speaks.
struct SilentDevice;

#[async_trait]
impl AuthTransport for SilentDevice {
    async fn next_challenge(&mut self) -> Result<Challenge, AuthError> {
        std::future::pending().await
    }

    async fn send_signature(&mut self, _signature: Signature) -> Result<(), AuthError> {
        Ok(())
    }

    async fn send_public_key(&mut self, _public_key: &[u8], _label: &str) -> Result<(), AuthError> {
        Ok(())
    }

    async fn verdict(&mut self) -> Result<Verdict, AuthError> {
        std::future::pending().await
    }
}

fn fast_config() -> AuthConfig {
    AuthConfig {
        challenge_timeout_ms: 200,
        verdict_timeout_ms: 200,
    }
}

fn public_key_of(keyring: &MemoryKeyring, index: usize) -> Vec<u8> {
    KeyMaterial::from_pkcs8_der(&keyring.keys[index], "x")
        .unwrap()
        .public_key()
        .to_vec()
}

// =============================================================================
// Handshake outcomes
// =============================================================================

#[tokio::test]
async fn test_first_trusted_identity_wins() {
    let keyring = Arc::new(MemoryKeyring::with_keys(1));
    let mut device = SimulatedDevice::new(vec![public_key_of(&keyring, 0)], false);
    let log = device.log.clone();

    let mut participant = AuthenticationParticipant::new(keyring.clone(), fast_config());
    let session = participant.authenticate(&mut device).await.unwrap();

    assert_eq!(session.identity.label(), "key0@test");
    assert_eq!(session.attempts, 1);
    assert!(!session.registered);
    assert_eq!(participant.state(), AuthState::Authenticated);
    assert_eq!(keyring.generated(), 0);
    assert_eq!(log.lock().unwrap().signatures, 1);
}

#[tokio::test]
async fn test_advances_to_next_candidate_on_rejection() {
    let keyring = Arc::new(MemoryKeyring::with_keys(2));
    let mut device = SimulatedDevice::new(vec![public_key_of(&keyring, 1)], false);
    let log = device.log.clone();

    let mut participant = AuthenticationParticipant::new(keyring.clone(), fast_config());
    let session = participant.authenticate(&mut device).await.unwrap();

    assert_eq!(session.identity.label(), "key1@test");
    assert_eq!(session.attempts, 2);
    // A fresh challenge for every attempt
    assert_eq!(log.lock().unwrap().challenges, 2);
    assert_eq!(keyring.generated(), 0);
}

#[tokio::test]
async fn test_registers_new_key_when_all_rejected() {
    let keyring = Arc::new(MemoryKeyring::with_keys(2));
    let mut device = SimulatedDevice::new(vec![], true);
    let log = device.log.clone();

    let mut participant = AuthenticationParticipant::new(keyring.clone(), fast_config());
    let session = participant.authenticate(&mut device).await.unwrap();

    assert!(session.registered);
    assert_eq!(session.attempts, 3);
    assert_eq!(keyring.generated(), 1);

    let log = log.lock().unwrap();
    // Two signatures and the key offer, each answering its own challenge
    assert_eq!(log.challenges, 3);
    assert_eq!(log.public_keys.len(), 1);
    assert_eq!(log.public_keys[0].0, session.identity.public_key());
    assert_eq!(log.public_keys[0].1, "fresh@test");
}

#[tokio::test]
async fn test_exhaustion_generates_exactly_one_identity() {
    let keyring = Arc::new(MemoryKeyring::with_keys(2));
    let mut device = SimulatedDevice::new(vec![], false);
    let log = device.log.clone();

    let mut participant = AuthenticationParticipant::new(keyring.clone(), fast_config());
    let err = participant.authenticate(&mut device).await.unwrap_err();

    assert!(matches!(err, AuthError::AuthenticationFailed { attempts: 3 }), "got {:?}", err);
    assert!(err.is_retryable());
    assert_eq!(keyring.generated(), 1);
    assert_eq!(log.lock().unwrap().public_keys.len(), 1);
    assert_eq!(log.lock().unwrap().signatures, 2);
    assert_eq!(participant.state(), AuthState::Rejected);
}

#[tokio::test]
async fn test_empty_store_goes_straight_to_registration() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(CredentialStore::new(dir.path(), Some("host@test".to_string())));
    let mut device = SimulatedDevice::new(vec![], true);
    let log = device.log.clone();

    let mut participant = AuthenticationParticipant::new(store.clone(), fast_config());
    let session = participant.authenticate(&mut device).await.unwrap();

    assert!(session.registered);
    assert_eq!(session.attempts, 1);
    assert_eq!(log.lock().unwrap().challenges, 1);
    assert_eq!(log.lock().unwrap().signatures, 0);

    // The registered key is now the stored one and signs on the next connection
    let mut device = SimulatedDevice::new(vec![session.identity.public_key().to_vec()], false);
    let mut participant = AuthenticationParticipant::new(store, fast_config());
    let again = participant.authenticate(&mut device).await.unwrap();
    assert!(!again.registered);
    assert_eq!(again.identity.label(), "host@test");
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unreadable_key_aborts_before_device_interaction() {
    let mut keyring = MemoryKeyring::with_keys(0);
    keyring.broken = true;
    let keyring = Arc::new(keyring);
    let mut device = SimulatedDevice::new(vec![], true);
    let log = device.log.clone();

    let mut participant = AuthenticationParticipant::new(keyring.clone(), fast_config());
    let err = participant.authenticate(&mut device).await.unwrap_err();

    assert!(matches!(err, AuthError::Credential(CredentialError::Parse { .. })));
    assert!(!err.is_retryable());
    assert_eq!(keyring.generated(), 0);
    assert_eq!(log.lock().unwrap().challenges, 0);
}

#[tokio::test]
async fn test_challenge_timeout() {
    let keyring = Arc::new(MemoryKeyring::with_keys(1));
    let mut participant = AuthenticationParticipant::new(keyring, fast_config());

    let started = std::time::Instant::now();
    let err = participant.authenticate(&mut SilentDevice).await.unwrap_err();

    assert!(matches!(
        err,
        AuthError::AuthenticationTimeout { stage: "challenge", .. }
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(participant.state(), AuthState::AwaitingChallenge);
}

#[tokio::test]
async fn test_registration_waits_for_challenge() {
    let keyring = Arc::new(MemoryKeyring::with_keys(0));
    let mut participant = AuthenticationParticipant::new(keyring.clone(), fast_config());

    let err = participant.authenticate(&mut SilentDevice).await.unwrap_err();

    assert!(matches!(
        err,
        AuthError::AuthenticationTimeout { stage: "challenge", .. }
    ));
    assert_eq!(keyring.generated(), 0);
}
