//! Driver session vault backed by the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The vault holds the dispatch server
//! URL, the driver's bearer token, and device identity. It is defined as a
//! trait so the sync engine and API client can be constructed against an
//! in-memory vault in tests and embedded hosts.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::TerminalError;

const SERVICE_NAME: &str = "dispatch-terminal";

// Credential keys
pub const KEY_SERVER_URL: &str = "dispatch_server_url";
pub const KEY_BEARER_TOKEN: &str = "driver_bearer_token";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_DRIVER_ID: &str = "driver_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SERVER_URL, KEY_BEARER_TOKEN, KEY_DEVICE_ID, KEY_DRIVER_ID];

// ---------------------------------------------------------------------------
// Vault trait
// ---------------------------------------------------------------------------

/// Key/value store for session credentials.
///
/// Implementations must be safe to share across the sync engine, the network
/// observer, and the driver action facade.
pub trait SessionVault: Send + Sync {
    /// Retrieve a credential. Returns `None` when the entry does not exist.
    fn get(&self, key: &str) -> Option<String>;

    /// Store a credential.
    fn set(&self, key: &str, value: &str) -> Result<(), TerminalError>;

    /// Delete a credential. Silently succeeds if the entry does not exist.
    fn delete(&self, key: &str) -> Result<(), TerminalError>;
}

/// The terminal is considered paired when server URL, bearer token, and
/// device id are all present.
pub fn is_paired(vault: &dyn SessionVault) -> bool {
    vault.get(KEY_SERVER_URL).is_some()
        && vault.get(KEY_BEARER_TOKEN).is_some()
        && vault.get(KEY_DEVICE_ID).is_some()
}

/// Fetch the bearer token wrapped so the plaintext is wiped from memory
/// when dropped.
pub fn bearer_token(vault: &dyn SessionVault) -> Option<Zeroizing<String>> {
    vault.get(KEY_BEARER_TOKEN).map(Zeroizing::new)
}

/// Delete every stored credential (sign-out / unpair).
pub fn clear_session(vault: &dyn SessionVault) -> Result<(), TerminalError> {
    info!("clearing driver session: deleting all credentials");
    for key in ALL_KEYS {
        vault.delete(key)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// OS keyring implementation
// ---------------------------------------------------------------------------

/// Production vault storing entries under the `dispatch-terminal` service in
/// the platform credential store.
#[derive(Debug, Default, Clone)]
pub struct KeyringVault;

impl KeyringVault {
    pub fn new() -> Self {
        Self
    }
}

impl SessionVault for KeyringVault {
    fn get(&self, key: &str) -> Option<String> {
        let entry = match Entry::new(SERVICE_NAME, key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) => Some(pw),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TerminalError> {
        let entry =
            Entry::new(SERVICE_NAME, key).map_err(|e| TerminalError::Vault(e.to_string()))?;
        entry
            .set_password(value)
            .map_err(|e| TerminalError::Vault(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), TerminalError> {
        let entry =
            Entry::new(SERVICE_NAME, key).map_err(|e| TerminalError::Vault(e.to_string()))?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(TerminalError::Vault(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory vault for tests and hosts without a platform keyring.
#[derive(Debug, Default)]
pub struct MemoryVault {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionVault for MemoryVault {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TerminalError> {
        self.entries
            .lock()
            .map_err(|e| TerminalError::Internal(e.to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), TerminalError> {
        self.entries
            .lock()
            .map_err(|e| TerminalError::Internal(e.to_string()))?
            .remove(key);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
