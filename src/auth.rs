//! Host side of the device authentication handshake
//!
//! The device drives the exchange:
//!
//! 1. Device sends a challenge token
//! 2. Host answers with a signature from one of its identities
//! 3. Device accepts (session starts) or rejects and sends a new challenge
//! 4. Once every stored identity has been rejected, the host mints a new key
//!    and answers the next challenge with its public key; the device user
//!    confirms or denies it
//!
//! The participant never talks to the wire directly. The transport layer
//! implements [`AuthTransport`] and reports the device's verdicts back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::credentials::{
    Challenge, CredentialError, Identities, KeyMaterial, Keyring, Signature,
};

/// Device response to a signature or public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitingChallenge,
    Signing,
    AwaitingVerdict,
    Authenticated,
    Rejected,
}

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Every identity, including a freshly generated one, was rejected.
    #[error("Device rejected all {attempts} identities")]
    AuthenticationFailed { attempts: usize },

    #[error("Timed out after {timeout:?} waiting for {stage}")]
    AuthenticationTimeout {
        stage: &'static str,
        timeout: Duration,
    },

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Identity lookup task failed: {0}")]
    Lookup(#[from] tokio::task::JoinError),
}

impl AuthError {
    /// Whether retrying the whole handshake later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::Credential(_) | AuthError::Lookup(_))
    }
}

/// What the transport layer provides to the handshake.
#[async_trait]
pub trait AuthTransport: Send {
    /// Wait for the next challenge token from the device.
    async fn next_challenge(&mut self) -> Result<Challenge, AuthError>;

    async fn send_signature(&mut self, signature: Signature) -> Result<(), AuthError>;

    /// Offer a new public key (device encoding) for the device user to trust.
    async fn send_public_key(&mut self, public_key: &[u8], label: &str) -> Result<(), AuthError>;

    /// Wait for the device to accept or reject the last response.
    async fn verdict(&mut self) -> Result<Verdict, AuthError>;
}

/// Outcome of a successful handshake
#[derive(Debug)]
pub struct Authenticated {
    /// The identity the device accepted; used to label the session
    pub identity: KeyMaterial,
    /// Signatures and key offers sent, including the accepted one
    pub attempts: usize,
    /// True when a newly generated key was registered
    pub registered: bool,
}

/// Drives one handshake over the identities supplied by a [`Keyring`].
pub struct AuthenticationParticipant {
    keyring: Arc<dyn Keyring>,
    config: AuthConfig,
    state: AuthState,
}

impl AuthenticationParticipant {
    pub fn new(keyring: Arc<dyn Keyring>, config: AuthConfig) -> Self {
        Self {
            keyring,
            config,
            state: AuthState::AwaitingChallenge,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Run the handshake to completion.
    ///
    /// Stored identities are tried in order. A missing key file just means
    /// there are no candidates; an unreadable one aborts before anything is
    /// sent. When all candidates are rejected, exactly one new key is
    /// generated and its public key is offered in reply to the next
    /// challenge.
    pub async fn authenticate<T>(&mut self, transport: &mut T) -> Result<Authenticated, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        self.state = AuthState::AwaitingChallenge;
        let mut attempts = 0;
        let mut pending: Option<Challenge> = None;

        let mut identities = self.keyring.identities();
        loop {
            let (candidate, rest) = next_identity(identities).await?;
            identities = rest;
            let Some(candidate) = candidate else {
                break;
            };
            let identity = match candidate {
                Ok(identity) => identity,
                Err(e) if e.is_not_found() => {
                    info!("No stored identity yet");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let challenge = match pending.take() {
                Some(challenge) => challenge,
                None => self.await_challenge(transport).await?,
            };

            self.state = AuthState::Signing;
            let signature = match identity.sign(&challenge) {
                Ok(signature) => signature,
                Err(e) => {
                    // The challenge is still unanswered; hand it to the next candidate
                    warn!(label = %identity.label(), error = %e, "Signing failed, skipping identity");
                    pending = Some(challenge);
                    continue;
                }
            };

            attempts += 1;
            debug!(label = %identity.label(), fingerprint = %identity.fingerprint(), "Sending signature");
            transport.send_signature(signature).await?;

            if self.await_verdict(transport).await? == Verdict::Accepted {
                info!(label = %identity.label(), attempts, "Device accepted identity");
                return Ok(Authenticated {
                    identity,
                    attempts,
                    registered: false,
                });
            }
            debug!(label = %identity.label(), "Device rejected identity");
        }

        // The offered key answers a challenge like a signature does
        let challenge = match pending.take() {
            Some(challenge) => challenge,
            None => self.await_challenge(transport).await?,
        };

        info!("No accepted identity, generating a new key");
        let identity = self.keyring.generate_key().await?;

        attempts += 1;
        debug!(
            label = %identity.label(),
            challenge_len = challenge.as_bytes().len(),
            "Offering public key"
        );
        transport
            .send_public_key(identity.public_key(), identity.label())
            .await?;

        match self.await_verdict(transport).await? {
            Verdict::Accepted => {
                info!(label = %identity.label(), fingerprint = %identity.fingerprint(), "Device trusted new identity");
                Ok(Authenticated {
                    identity,
                    attempts,
                    registered: true,
                })
            }
            Verdict::Rejected => {
                warn!(attempts, "Device rejected every identity");
                Err(AuthError::AuthenticationFailed { attempts })
            }
        }
    }

    async fn await_challenge<T>(&mut self, transport: &mut T) -> Result<Challenge, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        self.state = AuthState::AwaitingChallenge;
        bounded(
            "challenge",
            self.config.challenge_timeout(),
            transport.next_challenge(),
        )
        .await
    }

    async fn await_verdict<T>(&mut self, transport: &mut T) -> Result<Verdict, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        self.state = AuthState::AwaitingVerdict;
        let verdict = bounded("verdict", self.config.verdict_timeout(), transport.verdict()).await?;
        self.state = match verdict {
            Verdict::Accepted => AuthState::Authenticated,
            Verdict::Rejected => AuthState::Rejected,
        };
        Ok(verdict)
    }
}

/// Advance the candidate sequence on the blocking pool, since stored
/// identities are read from disk as they are pulled.
async fn next_identity(
    mut identities: Identities,
) -> Result<(Option<Result<KeyMaterial, CredentialError>>, Identities), AuthError> {
    let next = tokio::task::spawn_blocking(move || {
        let candidate = identities.next();
        (candidate, identities)
    })
    .await?;
    Ok(next)
}

async fn bounded<F, O>(stage: &'static str, timeout: Duration, fut: F) -> Result<O, AuthError>
where
    F: Future<Output = Result<O, AuthError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| AuthError::AuthenticationTimeout { stage, timeout })?
}
