//! Key Derivation Functions
//!
//! Both generators mix the configured shared secret into the derivation, so
//! password material seen on the wire is useless without the secret.

use super::{CryptoError, KeyGenerator, KeyMaterial, KeySizes, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use ring::pbkdf2;
use std::num::NonZeroU32;

const KEY_INFO: &[u8] = b"shroud tunnel key";
const IV_INFO: &[u8] = b"shroud tunnel iv";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Fill `output` with key bytes bound to `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        if output.is_empty() {
            return Ok(());
        }

        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// `hkdf-sha256`: salt = shared secret, IKM = password material
pub struct HkdfKeyGenerator {
    secret: Vec<u8>,
}

impl HkdfKeyGenerator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }
}

impl KeyGenerator for HkdfKeyGenerator {
    fn name(&self) -> &'static str {
        "hkdf-sha256"
    }

    fn generate(&self, password: &[u8], sizes: KeySizes) -> Result<KeyMaterial, CryptoError> {
        let hkdf = Hkdf::new(Some(&self.secret), password);

        let mut material = KeyMaterial {
            key: vec![0u8; sizes.key],
            iv: vec![0u8; sizes.iv],
        };
        hkdf.expand(KEY_INFO, &mut material.key)?;
        hkdf.expand(IV_INFO, &mut material.iv)?;

        Ok(material)
    }
}

/// `pbkdf2-sha256`: salt = password material, secret = shared secret
pub struct Pbkdf2KeyGenerator {
    secret: Vec<u8>,
    iterations: NonZeroU32,
}

impl Pbkdf2KeyGenerator {
    /// Iteration count; a handshake runs this once per tunnel on each side
    pub const DEFAULT_ITERATIONS: u32 = 4096;

    pub fn new(secret: &[u8]) -> Self {
        Self::with_iterations(secret, Self::DEFAULT_ITERATIONS)
    }

    pub fn with_iterations(secret: &[u8], iterations: u32) -> Self {
        Self {
            secret: secret.to_vec(),
            iterations: NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN),
        }
    }
}

impl KeyGenerator for Pbkdf2KeyGenerator {
    fn name(&self) -> &'static str {
        "pbkdf2-sha256"
    }

    fn generate(&self, password: &[u8], sizes: KeySizes) -> Result<KeyMaterial, CryptoError> {
        let mut out = vec![0u8; sizes.key + sizes.iv];
        if !out.is_empty() {
            pbkdf2::derive(
                pbkdf2::PBKDF2_HMAC_SHA256,
                self.iterations,
                password,
                &self.secret,
                &mut out,
            );
        }

        let iv = out.split_off(sizes.key);
        Ok(KeyMaterial { key: out, iv })
    }
}
