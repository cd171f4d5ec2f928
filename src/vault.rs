//! Secret vault for custodial signing keys.
//!
//! Keys are sealed with AES-256-GCM under a single process-wide key. The wire
//! form is hex of `nonce || ciphertext || tag`, which is what the `wallets`
//! table stores.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::fmt;
use thiserror::Error;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// A wrong key and a corrupt ciphertext both surface as `DecryptFailed`.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault key must be 32 bytes of hex")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
}

/// Plaintext key material, alive only for the signing call that needs it.
pub struct SecretKey(String);

impl SecretKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    pub fn new(key: &[u8; KEY_LENGTH]) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Builds the vault from the hex key held in process configuration.
    pub fn from_hex(hex_key: &str) -> Result<Self, VaultError> {
        let bytes: [u8; KEY_LENGTH] = hex::decode(hex_key.trim())
            .map_err(|_| VaultError::InvalidKey)?
            .try_into()
            .map_err(|_| VaultError::InvalidKey)?;
        Self::new(&bytes)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<SecretKey, VaultError> {
        let data = hex::decode(sealed.trim()).map_err(|_| VaultError::DecryptFailed)?;
        if data.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(VaultError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::DecryptFailed)?;

        String::from_utf8(plaintext)
            .map(SecretKey)
            .map_err(|_| VaultError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(&[7u8; KEY_LENGTH]).unwrap()
    }

    #[test]
    fn test_round_trip_printable_ascii() {
        let vault = vault();
        let printable: String = (0x20u8..=0x7e).map(char::from).collect();
        let long = printable.repeat(64);

        for secret in ["", "a", printable.as_str(), long.as_str()] {
            let sealed = vault.encrypt(secret).unwrap();
            assert_eq!(vault.decrypt(&sealed).unwrap().expose(), secret);
        }
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let vault = vault();
        let a = vault.encrypt("same secret").unwrap();
        let b = vault.encrypt("same secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = Vault::new(&[8u8; KEY_LENGTH]).unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(VaultError::DecryptFailed)
        ));
    }

    #[test]
    fn test_tampered_or_truncated_ciphertext_fails() {
        let vault = vault();
        let mut sealed = hex::decode(vault.encrypt("secret").unwrap()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(vault.decrypt(&hex::encode(&sealed)).is_err());
        assert!(vault.decrypt("abcd").is_err());
        assert!(vault.decrypt("not hex").is_err());
    }

    #[test]
    fn test_from_hex_validates_length() {
        assert!(Vault::from_hex(&"11".repeat(32)).is_ok());
        assert!(matches!(
            Vault::from_hex("1122"),
            Err(VaultError::InvalidKey)
        ));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let sealed = vault().encrypt("super secret").unwrap();
        let secret = vault().decrypt(&sealed).unwrap();
        assert_eq!(format!("{:?}", secret), "SecretKey(***)");
    }
}
