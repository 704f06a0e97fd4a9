//! Shared-secret challenge/response authenticator
//!
//! Challenge:  `nonce (16B) || HMAC(secret, "challenge" || nonce)`
//! Response:   `HMAC(secret, "response" || nonce)`

use super::{random_bytes, Authenticator, CryptoError};
use ring::hmac;

const NONCE_LEN: usize = 16;
const CHALLENGE_LABEL: &[u8] = b"challenge";
const RESPONSE_LABEL: &[u8] = b"response";

/// Length of encoded password material
pub const PASSWORD_LEN: usize = 32;

/// HMAC-SHA256 authenticator
pub struct HmacAuthenticator {
    key: hmac::Key,
}

impl HmacAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    fn sign(&self, label: &[u8], nonce: &[u8]) -> hmac::Tag {
        let mut ctx = hmac::Context::with_key(&self.key);
        ctx.update(label);
        ctx.update(nonce);
        ctx.sign()
    }

    fn verify(&self, label: &[u8], nonce: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let mut message = Vec::with_capacity(label.len() + nonce.len());
        message.extend_from_slice(label);
        message.extend_from_slice(nonce);
        hmac::verify(&self.key, &message, tag).map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl Authenticator for HmacAuthenticator {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn generate_challenge(&self) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;

        let mut challenge = nonce.to_vec();
        challenge.extend_from_slice(self.sign(CHALLENGE_LABEL, &nonce).as_ref());
        Ok(challenge)
    }

    fn validate_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if challenge.len() <= NONCE_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }

        let (nonce, tag) = challenge.split_at(NONCE_LEN);
        self.verify(CHALLENGE_LABEL, nonce, tag)?;

        Ok(self.sign(RESPONSE_LABEL, nonce).as_ref().to_vec())
    }

    fn validate_challenge_response(
        &self,
        challenge: &[u8],
        response: &[u8],
    ) -> Result<(), CryptoError> {
        if challenge.len() < NONCE_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        self.verify(RESPONSE_LABEL, &challenge[..NONCE_LEN], response)
    }

    fn generate_encoded_password(&self) -> Result<Vec<u8>, CryptoError> {
        let mut password = vec![0u8; PASSWORD_LEN];
        random_bytes(&mut password)?;
        Ok(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_response_roundtrip() {
        let client = HmacAuthenticator::new(b"secret");
        let relay = HmacAuthenticator::new(b"secret");

        let challenge = client.generate_challenge().unwrap();
        let response = relay.validate_challenge(&challenge).unwrap();
        client
            .validate_challenge_response(&challenge, &response)
            .unwrap();
    }

    #[test]
    fn test_tampered_challenge_rejected() {
        let client = HmacAuthenticator::new(b"secret");
        let relay = HmacAuthenticator::new(b"secret");

        let mut challenge = client.generate_challenge().unwrap();
        challenge[3] ^= 0x01;
        assert!(matches!(
            relay.validate_challenge(&challenge),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let client = HmacAuthenticator::new(b"secret");
        let relay = HmacAuthenticator::new(b"not the secret");

        let challenge = client.generate_challenge().unwrap();
        assert!(relay.validate_challenge(&challenge).is_err());
    }

    #[test]
    fn test_response_bound_to_challenge() {
        let auth = HmacAuthenticator::new(b"secret");

        let first = auth.generate_challenge().unwrap();
        let second = auth.generate_challenge().unwrap();
        let response = auth.validate_challenge(&first).unwrap();

        assert!(auth.validate_challenge_response(&second, &response).is_err());
    }
}
