//! Forge token storage through the host platform secret store.
//!
//! Tokens go to the OS keychain via `keyring`. When no platform store is
//! usable the keeper degrades to process memory for the session; tokens
//! are never written to disk in plaintext.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

const KEYRING_USER: &str = "api-token";

#[derive(Clone)]
pub struct SecretKeeper {
    /// Session-only fallback for hosts without a usable secret store.
    memory: Arc<Mutex<HashMap<String, String>>>,
}

fn is_backend_unavailable(err: &keyring::Error) -> bool {
    matches!(
        err,
        keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_)
    )
}

impl SecretKeeper {
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn get_token(&self, service: &str) -> Result<Option<String>> {
        let keeper = self.clone();
        let service = service.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = match keyring::Entry::new(&service, KEYRING_USER) {
                Ok(entry) => entry,
                Err(e) if is_backend_unavailable(&e) => {
                    return Ok(keeper.memory().get(&service).cloned());
                }
                Err(e) => return Err(Error::Secrets(e.to_string())),
            };

            match entry.get_password() {
                Ok(token) => Ok(Some(token)),
                Err(keyring::Error::NoEntry) => Ok(keeper.memory().get(&service).cloned()),
                Err(e) if is_backend_unavailable(&e) => {
                    Ok(keeper.memory().get(&service).cloned())
                }
                Err(e) => Err(Error::Secrets(e.to_string())),
            }
        })
        .await
        .map_err(|e| Error::Secrets(format!("secret task panicked: {e}")))?
    }

    pub async fn set_token(&self, service: &str, token: &str) -> Result<()> {
        let keeper = self.clone();
        let service = service.to_string();
        let token = token.to_string();

        tokio::task::spawn_blocking(move || {
            let stored = keyring::Entry::new(&service, KEYRING_USER)
                .and_then(|entry| entry.set_password(&token));

            match stored {
                Ok(()) => Ok(()),
                Err(e) if is_backend_unavailable(&e) => {
                    tracing::warn!(
                        "No usable platform secret store; keeping token in memory for this session"
                    );
                    keeper.memory().insert(service, token);
                    Ok(())
                }
                Err(e) => Err(Error::Secrets(e.to_string())),
            }
        })
        .await
        .map_err(|e| Error::Secrets(format!("secret task panicked: {e}")))?
    }

    pub async fn erase_token(&self, service: &str) -> Result<()> {
        let keeper = self.clone();
        let service = service.to_string();

        tokio::task::spawn_blocking(move || {
            keeper.memory().remove(&service);

            let erased = keyring::Entry::new(&service, KEYRING_USER)
                .and_then(|entry| entry.delete_credential());

            match erased {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) if is_backend_unavailable(&e) => Ok(()),
                Err(e) => Err(Error::Secrets(e.to_string())),
            }
        })
        .await
        .map_err(|e| Error::Secrets(format!("secret task panicked: {e}")))?
    }
}

impl Default for SecretKeeper {
    fn default() -> Self {
        Self::new()
    }
}
