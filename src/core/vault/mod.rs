use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::Result;
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;

type HmacSha256 = hmac::Hmac<Sha256>;

const KEY_CONTEXT: &[u8] = b"agent-forge-snapshots-v1";

/// Encrypts full generation payloads so that only an explicit, audited
/// unmask can read them back.
pub struct PayloadVault {
    cipher: Aes256Gcm,
}

fn derive_key(material: &str) -> [u8; 32] {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(KEY_CONTEXT) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any size"),
    };
    mac.update(material.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    key
}

impl PayloadVault {
    /// Key derived from an operator-supplied secret.
    pub fn from_secret(secret: &str) -> Self {
        Self::with_key(derive_key(secret))
    }

    /// Key derived from machine-specific identifiers (hostname + username),
    /// stable across restarts but tied to the local machine/user.
    pub fn machine_bound() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let username = whoami::username();
        Self::with_key(derive_key(&format!("{}{}", hostname, username)))
    }

    fn with_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) value. Returns plaintext.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("Base64 decode failed: {}", e))?;

        if combined.len() < 13 {
            return Err(anyhow::anyhow!("Encrypted value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("UTF-8 decode failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = PayloadVault::from_secret("s3cret");
        let plaintext = r#"{"input":[{"role":"user","content":"call me at 0812345678"}]}"#;
        let encrypted = vault.encrypt(plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert_eq!(vault.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn encrypt_produces_different_ciphertext_each_time() {
        let vault = PayloadVault::from_secret("s3cret");
        let a = vault.encrypt("same-input").unwrap();
        let b = vault.encrypt("same-input").unwrap();
        assert_ne!(a, b, "random nonce should produce different ciphertext");
    }

    #[test]
    fn different_secret_cannot_decrypt() {
        let a = PayloadVault::from_secret("one");
        let b = PayloadVault::from_secret("two");
        let encrypted = a.encrypt("payload").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
    }

    #[test]
    fn decrypt_rejects_short_input() {
        let vault = PayloadVault::from_secret("s3cret");
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(vault.decrypt(&short).is_err());
    }

    #[test]
    fn decrypt_rejects_invalid_base64() {
        let vault = PayloadVault::from_secret("s3cret");
        assert!(vault.decrypt("not-valid-base64!!!").is_err());
    }
}
