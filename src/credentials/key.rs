//! RSA key material and challenge signing

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroizing;

use super::public_key::{self, PublicKeyError};
use super::{default_label, CredentialError};

/// RSA modulus size expected by devices
pub const MODULUS_BITS: usize = 2048;

/// Fixed public exponent (F4)
pub const PUBLIC_EXPONENT: u32 = 65537;

/// Opaque token issued by the device. Answered by exactly one signature.
///
/// Devices treat the token as an already computed SHA-1 digest: it goes into
/// the PKCS#1 v1.5 `DigestInfo` as is, without hashing it again.
#[derive(Debug, PartialEq, Eq)]
pub struct Challenge(Vec<u8>);

impl Challenge {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// RSASSA-PKCS1-v1_5 / SHA-1 signature over one challenge token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Check this signature over `token` against `public_key`, the way a
    /// device does.
    pub fn verify(&self, public_key: &RsaPublicKey, token: &[u8]) -> bool {
        public_key.verify(token_scheme(), token, &self.0).is_ok()
    }
}

/// Reasons a private key cannot be turned into [`KeyMaterial`]
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("not a PKCS#8 RSA private key: {0}")]
    Pkcs8(String),

    #[error("public exponent is not {PUBLIC_EXPONENT}")]
    Exponent,

    #[error("cannot derive public key: {0}")]
    PublicKey(#[from] PublicKeyError),
}

/// One RSA signing identity plus the label shown to the device user.
pub struct KeyMaterial {
    der: Zeroizing<Vec<u8>>,
    private_key: RsaPrivateKey,
    public_key: Vec<u8>,
    label: String,
}

impl KeyMaterial {
    /// Generate a fresh 2048-bit key. CPU bound; call from a blocking context.
    pub fn generate(label: impl Into<String>) -> Result<Self, CredentialError> {
        let exponent = BigUint::from(PUBLIC_EXPONENT);
        let key = RsaPrivateKey::new_with_exp(&mut OsRng, MODULUS_BITS, &exponent)
            .map_err(|e| CredentialError::Generate(e.to_string()))?;
        let der = key
            .to_pkcs8_der()
            .map_err(|e| CredentialError::Generate(e.to_string()))?;
        Self::from_pkcs8_der(der.as_bytes(), label)
            .map_err(|e| CredentialError::Generate(e.to_string()))
    }

    /// Rebuild from PKCS#8 DER bytes. An empty label falls back to `<user>@<host>`.
    pub fn from_pkcs8_der(der: &[u8], label: impl Into<String>) -> Result<Self, KeyError> {
        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| KeyError::Pkcs8(e.to_string()))?;
        if *key.e() != BigUint::from(PUBLIC_EXPONENT) {
            return Err(KeyError::Exponent);
        }
        let public_key = public_key::encode(&key.to_public_key())?;

        let label = label.into().trim().to_string();
        let label = if label.is_empty() { default_label() } else { label };

        Ok(Self {
            der: Zeroizing::new(der.to_vec()),
            private_key: key,
            public_key,
            label,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// PKCS#8 DER of the private key
    pub fn private_key_der(&self) -> &[u8] {
        &self.der
    }

    /// PEM framed PKCS#8, as written to `adbkey`
    pub fn private_key_pem(&self) -> Result<Zeroizing<String>, CredentialError> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CredentialError::Generate(e.to_string()))
    }

    /// Device encoding of the public key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(&self.public_key)
    }

    /// `"<base64> <label>\n"`, as written to `adbkey.pub`
    pub fn public_key_line(&self) -> String {
        format!("{} {}\n", self.public_key_base64(), self.label)
    }

    pub fn fingerprint(&self) -> String {
        public_key::fingerprint(&self.public_key)
    }

    pub fn rsa_public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Sign a challenge token.
    pub fn sign(&self, challenge: &Challenge) -> Result<Signature, CredentialError> {
        let signature = self
            .private_key
            .sign(token_scheme(), challenge.as_bytes())
            .map_err(|e| CredentialError::Sign(e.to_string()))?;
        Ok(Signature(signature))
    }
}

/// SHA-1 `DigestInfo` prefix with the token used as the digest. The length
/// check is lifted so tokens of any size, including empty, can be signed.
fn token_scheme() -> Pkcs1v15Sign {
    let mut scheme = Pkcs1v15Sign::new::<Sha1>();
    scheme.hash_len = None;
    scheme
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
