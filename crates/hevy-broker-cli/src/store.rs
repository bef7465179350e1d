use anyhow::{Context, Result};
use hevy_broker_core::BearerCredential;
use keyring::Entry;

const SERVICE_NAME: &str = "hevy-broker";

/// Keychain account the token pair is stored under.
const SESSION_ACCOUNT: &str = "session";

/// The operator's token pair, kept in the OS keychain as JSON.
pub struct SessionStore;

impl SessionStore {
    fn entry() -> Result<Entry> {
        Entry::new(SERVICE_NAME, SESSION_ACCOUNT).context("Failed to create keyring entry")
    }

    /// Store the pair, replacing any previous one
    pub fn save(credential: &BearerCredential) -> Result<()> {
        Self::entry()?
            .set_password(&encode(credential)?)
            .context("Failed to store session in keychain")
    }

    /// Load the stored pair, `None` when nothing is stored
    pub fn load() -> Result<Option<BearerCredential>> {
        match Self::entry()?.get_password() {
            Ok(raw) => decode(&raw).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read session from keychain"),
        }
    }

    /// Delete the stored pair. Returns false when there was none.
    pub fn delete() -> Result<bool> {
        match Self::entry()?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e).context("Failed to delete session from keychain"),
        }
    }
}

fn encode(credential: &BearerCredential) -> Result<String> {
    serde_json::to_string(credential).context("Failed to serialize session")
}

fn decode(raw: &str) -> Result<BearerCredential> {
    serde_json::from_str(raw).context("Stored session is corrupt; run `hevy-broker login` again")
}
