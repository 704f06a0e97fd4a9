//! AEAD payload cryptors
//!
//! Every encrypted payload is laid out as `nonce (12B) || ciphertext || tag (16B)`.
//! Nonces are random per message, so a cryptor can be shared between the
//! reading and writing halves of a tunnel without coordinating counters.

use super::{random_bytes, CryptoError, Cryptor, KeyMaterial, KeySizes, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// AEAD cipher for encrypting/decrypting block payloads
pub struct AeadCryptor {
    name: &'static str,
    algorithm: &'static aead::Algorithm,
    key: Option<LessSafeKey>,
}

impl AeadCryptor {
    pub fn chacha20_poly1305() -> Self {
        Self {
            name: "chacha20-poly1305",
            algorithm: &CHACHA20_POLY1305,
            key: None,
        }
    }

    pub fn aes_256_gcm() -> Self {
        Self {
            name: "aes-256-gcm",
            algorithm: &AES_256_GCM,
            key: None,
        }
    }

    fn key(&self) -> Result<&LessSafeKey, CryptoError> {
        self.key.as_ref().ok_or(CryptoError::NotInitialized)
    }
}

impl Cryptor for AeadCryptor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn key_sizes(&self) -> KeySizes {
        KeySizes { key: KEY_LEN, iv: 0 }
    }

    fn init(&mut self, material: &KeyMaterial) -> Result<(), CryptoError> {
        if material.key.len() != self.algorithm.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: self.algorithm.key_len(),
                actual: material.key.len(),
            });
        }

        let unbound = UnboundKey::new(self.algorithm, &material.key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: self.algorithm.key_len(),
                actual: material.key.len(),
            }
        })?;
        self.key = Some(LessSafeKey::new(unbound));
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.key()?;

        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;

        let mut buffer = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(plaintext);

        let tag = key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut buffer[NONCE_LEN..],
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        buffer.extend_from_slice(tag.as_ref());

        Ok(buffer)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.key()?;

        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&ciphertext[..NONCE_LEN]);
        let mut buffer = ciphertext[NONCE_LEN..].to_vec();

        let plaintext_len = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?
            .len();
        buffer.truncate(plaintext_len);

        Ok(buffer)
    }
}

/// Pass-through cryptor; only useful for debugging the wire format
pub struct PlainCryptor;

impl Cryptor for PlainCryptor {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn key_sizes(&self) -> KeySizes {
        KeySizes { key: 0, iv: 0 }
    }

    fn init(&mut self, _material: &KeyMaterial) -> Result<(), CryptoError> {
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}
