//! Security provider for the tunnel handshake
//!
//! The tunnel core only talks to three pluggable seams:
//! - [`Cryptor`]: symmetric encryption of block payloads
//! - [`KeyGenerator`]: turns exchanged password material into key/IV bytes
//! - [`Authenticator`]: challenge/response proof of the shared secret
//!
//! Concrete implementations are picked by name through [`SecurityProvider`].

mod aead;
mod auth;
mod kdf;

pub use aead::{AeadCryptor, PlainCryptor};
pub use auth::HmacAuthenticator;
pub use kdf::{Hkdf, HkdfKeyGenerator, Pbkdf2KeyGenerator};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Cryptor used before a key was installed")]
    NotInitialized,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unknown {kind}: {name}")]
    UnknownAlgorithm { kind: &'static str, name: String },

    #[error("Random number generation failed")]
    Random,
}

/// Key and IV sizes a cryptor needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySizes {
    pub key: usize,
    pub iv: usize,
}

/// Key material produced by a [`KeyGenerator`]
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"[REDACTED]")
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
        self.iv.iter_mut().for_each(|b| *b = 0);
    }
}

/// Symmetric payload cipher
pub trait Cryptor: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Sizes of the key material [`Cryptor::init`] expects
    fn key_sizes(&self) -> KeySizes;

    /// Install key material
    fn init(&mut self, material: &KeyMaterial) -> Result<(), CryptoError>;

    /// Encrypt one block payload
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt one block payload
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Derives key material from password material exchanged during the handshake
pub trait KeyGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, password: &[u8], sizes: KeySizes) -> Result<KeyMaterial, CryptoError>;
}

/// Challenge/response authenticator
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a fresh challenge (accepting side)
    fn generate_challenge(&self) -> Result<Vec<u8>, CryptoError>;

    /// Check a received challenge and answer it (relay side)
    fn validate_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Check the relay's answer to the challenge we sent (accepting side)
    fn validate_challenge_response(
        &self,
        challenge: &[u8],
        response: &[u8],
    ) -> Result<(), CryptoError>;

    /// Produce password material the key generator will expand on both ends
    fn generate_encoded_password(&self) -> Result<Vec<u8>, CryptoError>;
}

/// Supported cryptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptorKind {
    ChaCha20Poly1305,
    Aes256Gcm,
    Plain,
}

impl CryptorKind {
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20" => Ok(Self::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            "plain" | "none" => Ok(Self::Plain),
            _ => Err(CryptoError::UnknownAlgorithm {
                kind: "cryptor",
                name: name.to_string(),
            }),
        }
    }

    /// Create a fresh, uninitialized cryptor
    pub fn build(self) -> Box<dyn Cryptor> {
        match self {
            Self::ChaCha20Poly1305 => Box::new(AeadCryptor::chacha20_poly1305()),
            Self::Aes256Gcm => Box::new(AeadCryptor::aes_256_gcm()),
            Self::Plain => Box::new(PlainCryptor),
        }
    }
}

/// Build a key generator by name, bound to the shared secret
pub fn key_generator_by_name(
    name: &str,
    secret: &[u8],
) -> Result<Arc<dyn KeyGenerator>, CryptoError> {
    match name.to_lowercase().as_str() {
        "hkdf-sha256" | "hkdf" => Ok(Arc::new(HkdfKeyGenerator::new(secret))),
        "pbkdf2-sha256" | "pbkdf2" => Ok(Arc::new(Pbkdf2KeyGenerator::new(secret))),
        _ => Err(CryptoError::UnknownAlgorithm {
            kind: "key generator",
            name: name.to_string(),
        }),
    }
}

/// Build an authenticator by name, bound to the shared secret
pub fn authenticator_by_name(
    name: &str,
    secret: &[u8],
) -> Result<Arc<dyn Authenticator>, CryptoError> {
    match name.to_lowercase().as_str() {
        "hmac-sha256" | "hmac" => Ok(Arc::new(HmacAuthenticator::new(secret))),
        _ => Err(CryptoError::UnknownAlgorithm {
            kind: "authenticator",
            name: name.to_string(),
        }),
    }
}

/// The set of security collaborators a tunnel endpoint is configured with
#[derive(Clone)]
pub struct SecurityProvider {
    cryptor: CryptorKind,
    key_generator: Arc<dyn KeyGenerator>,
    authenticator: Arc<dyn Authenticator>,
}

impl SecurityProvider {
    /// Resolve all three collaborators from their configured names
    pub fn from_names(
        cryptor: &str,
        key_generator: &str,
        authenticator: &str,
        secret: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            cryptor: CryptorKind::from_name(cryptor)?,
            key_generator: key_generator_by_name(key_generator, secret)?,
            authenticator: authenticator_by_name(authenticator, secret)?,
        })
    }

    pub fn new(
        cryptor: CryptorKind,
        key_generator: Arc<dyn KeyGenerator>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            cryptor,
            key_generator,
            authenticator,
        }
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn key_generator(&self) -> &dyn KeyGenerator {
        self.key_generator.as_ref()
    }

    /// Derive a ready-to-use cryptor from exchanged password material
    pub fn derive_cryptor(&self, password: &[u8]) -> Result<Box<dyn Cryptor>, CryptoError> {
        let mut cryptor = self.cryptor.build();
        let material = self.key_generator.generate(password, cryptor.key_sizes())?;
        cryptor.init(&material)?;
        Ok(cryptor)
    }
}

impl fmt::Debug for SecurityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityProvider")
            .field("cryptor", &self.cryptor)
            .field("key_generator", &self.key_generator.name())
            .field("authenticator", &self.authenticator.name())
            .finish()
    }
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Random)
}
