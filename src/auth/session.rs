//! Session data and its encrypted at-rest persistence.
//!
//! The vault seals the session to disk as `salt || nonce || ciphertext`.
//! The cipher key is derived from the keychain-held secret with Argon2id,
//! so the file alone is useless without the keychain entry.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::credentials::CredentialStore;

/// Session file name inside the data directory.
const SESSION_FILE: &str = "session.bin";

/// Sessions expire a full workday after sign-in.
const SESSION_EXPIRY_MINUTES: i64 = 480;

/// Buffer before expiry during which a resume should re-authenticate.
const SESSION_REFRESH_BUFFER_MINUTES: i64 = 30;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub token: String,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn is_expired(&self) -> bool {
        let expiry = self.created_at + Duration::minutes(SESSION_EXPIRY_MINUTES);
        Utc::now() > expiry
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        let refresh_at = self.created_at
            + Duration::minutes(SESSION_EXPIRY_MINUTES - SESSION_REFRESH_BUFFER_MINUTES);
        Utc::now() > refresh_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        let expiry = self.created_at + Duration::minutes(SESSION_EXPIRY_MINUTES);
        expiry - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

/// Encrypted persistence for the signed-in session.
pub struct SessionVault {
    path: PathBuf,
    secret: Vec<u8>,
}

impl SessionVault {
    pub fn new(data_dir: PathBuf, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
            secret: secret.into(),
        }
    }

    /// Vault keyed from the OS keychain, creating the sealing secret on
    /// first use.
    pub fn from_keyring(data_dir: PathBuf) -> Result<Self> {
        let secret = CredentialStore::sealing_secret()?;
        Ok(Self::new(data_dir, secret.into_bytes()))
    }

    /// Seal the session to disk
    pub fn seal(&self, session: &SessionData) -> Result<()> {
        let plaintext =
            serde_json::to_vec(session).context("Failed to serialize session")?;
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher(&salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| anyhow!("Failed to encrypt session"))?;

        let mut contents = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        contents.extend_from_slice(&salt);
        contents.extend_from_slice(&nonce);
        contents.extend_from_slice(&ciphertext);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create session directory")?;
        }
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }

    /// Read back the sealed session, or `None` when no file exists.
    /// Expiry is the caller's concern.
    pub fn open(&self) -> Result<Option<SessionData>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read(&self.path).context("Failed to read session file")?;
        if contents.len() <= SALT_LEN + NONCE_LEN {
            return Err(anyhow!("Session file is truncated"));
        }
        let (salt, rest) = contents.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let plaintext = self
            .cipher(salt)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt session file"))?;
        let session =
            serde_json::from_slice(&plaintext).context("Failed to parse session data")?;
        Ok(Some(session))
    }

    /// Clear the persisted session
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove session file")?;
        }
        Ok(())
    }

    fn cipher(&self, salt: &[u8]) -> Result<ChaCha20Poly1305> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(&self.secret, salt, &mut key)
            .map_err(|_| anyhow!("Failed to derive session key"))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }
}
