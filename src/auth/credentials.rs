use anyhow::{Context, Result};
use keyring::Entry;
use rand::{distributions::Alphanumeric, Rng};

const SERVICE_NAME: &str = "shopsync";

/// Account name for the session vault sealing secret.
const VAULT_ACCOUNT: &str = "session-vault";

/// Length of a freshly generated sealing secret.
const SECRET_LEN: usize = 48;

pub struct CredentialStore;

impl CredentialStore {
    /// Store username and password in the OS keychain
    pub fn store(username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Retrieve password for a username from the OS keychain
    pub fn get_password(username: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    /// Delete stored credentials for a username
    pub fn delete(username: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }

    /// Check if credentials exist for a username
    pub fn has_credentials(username: &str) -> bool {
        if let Ok(entry) = Entry::new(SERVICE_NAME, username) {
            entry.get_password().is_ok()
        } else {
            false
        }
    }

    /// Sealing secret for the session vault, created and persisted on
    /// first use.
    pub fn sealing_secret() -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, VAULT_ACCOUNT)
            .context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => {
                let secret: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(SECRET_LEN)
                    .map(char::from)
                    .collect();
                entry
                    .set_password(&secret)
                    .context("Failed to store vault secret in keychain")?;
                Ok(secret)
            }
            Err(error) => Err(error).context("Failed to read vault secret from keychain"),
        }
    }
}
