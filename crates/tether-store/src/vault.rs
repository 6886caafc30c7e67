//! At-rest sealing of protocol identity material.

use std::path::Path;

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use secrecy::{ExposeSecret, SecretBox};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 key used to seal identity material.
pub struct Vault {
    key: SecretBox<[u8; KEY_LEN]>,
}

impl Vault {
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// Random key that lives only as long as the process.
    pub fn ephemeral() -> Self {
        Self::from_key(generate_key())
    }

    /// Load the key file, creating it (mode 0600) on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|_| StoreError::Vault(format!("{}: invalid key encoding", path.display())))?;
            let key: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| StoreError::Vault(format!("{}: invalid key length", path.display())))?;
            return Ok(Self::from_key(key));
        }

        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        std::fs::write(path, STANDARD.encode(key)).map_err(|e| StoreError::Io(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        tracing::info!(path = %path.display(), "created identity vault key");
        Ok(Self::from_key(key))
    }

    /// Encrypt `plaintext`; returns base64 of nonce + ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        let cipher = ChaCha20Poly1305::new(self.key.expose_secret().into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| StoreError::Vault("encryption failed".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, StoreError> {
        let combined = STANDARD
            .decode(sealed)
            .map_err(|_| StoreError::Vault("invalid sealed encoding".into()))?;
        if combined.len() < NONCE_LEN {
            return Err(StoreError::Vault("sealed value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(self.key.expose_secret().into());
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::Vault("decryption failed".into()))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Vault([REDACTED])")
    }
}

const STANDARD: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
