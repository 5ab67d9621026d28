use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};

use crate::models::account::Credential;

/// AES-256-GCM cipher for account credentials at rest. Session cookies are
/// bearer tokens for the remote site, so they never touch the database in
/// plaintext. The wire format is the 12-byte nonce prepended to the
/// ciphertext.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        use base64::Engine;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Serialize and encrypt a credential for storage.
    pub fn seal(&self, credential: &Credential) -> Result<Vec<u8>, EncryptionError> {
        let plaintext =
            serde_json::to_vec(credential).map_err(|_| EncryptionError::EncryptFailed)?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut output = nonce.to_vec();
        output.extend(ciphertext);
        Ok(output)
    }

    /// Decrypt and deserialize a stored credential blob.
    pub fn open(&self, blob: &[u8]) -> Result<Credential, EncryptionError> {
        if blob.len() < 12 {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)?;

        serde_json::from_slice(&plaintext).map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("credential encryption failed")]
    EncryptFailed,

    #[error("credential decryption failed")]
    DecryptFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    pub(crate) fn test_key() -> String {
        base64::engine::general_purpose::STANDARD.encode([7u8; 32])
    }

    fn sample_credential() -> Credential {
        Credential {
            email: "robot@example.com".to_string(),
            password: "hunter2".to_string(),
            cookies: serde_json::json!([{"name": "sessionid", "value": "s3cr3t"}]),
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let blob = cipher.seal(&sample_credential()).unwrap();
        let opened = cipher.open(&blob).unwrap();
        assert_eq!(opened.email, "robot@example.com");
        assert_eq!(opened.cookies[0]["value"], "s3cr3t");
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let cipher = CredentialCipher::new(&test_key()).unwrap();
        let mut blob = cipher.seal(&sample_credential()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(
            cipher.open(&blob),
            Err(EncryptionError::DecryptFailed)
        ));
    }

    #[test]
    fn rejects_short_keys() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            CredentialCipher::new(&short),
            Err(EncryptionError::InvalidKey)
        ));
    }
}
