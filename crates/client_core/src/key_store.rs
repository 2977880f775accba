use std::sync::Arc;

use anyhow::{Context, Result};
use rsa::RsaPrivateKey;
use shared::domain::UserId;
use storage::KeyValueStore;
use tracing::{debug, info, warn};

use crate::{
    crypto::{ParsedKeyCache, PrivateKeyPem},
    error::KeyError,
};

pub const PRIVATE_KEY_PREFIX: &str = "private-key:";

pub fn private_key_entry(user_id: &UserId) -> String {
    format!("{PRIVATE_KEY_PREFIX}{user_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl KeyValidation {
    fn from_result(result: Result<(), KeyError>) -> Self {
        match result {
            Ok(()) => Self {
                valid: true,
                reason: None,
            },
            Err(KeyError::Malformed { reason }) => Self {
                valid: false,
                reason: Some(reason),
            },
        }
    }
}

/// Per-user private key persistence. The primary store is authoritative;
/// the optional secondary store is a durable backup that is written on a
/// best-effort basis and consulted when the primary has nothing.
#[derive(Clone)]
pub struct KeyStore {
    primary: Arc<dyn KeyValueStore>,
    secondary: Option<Arc<dyn KeyValueStore>>,
    parse_cache: Arc<ParsedKeyCache>,
}

impl KeyStore {
    pub fn new(primary: Arc<dyn KeyValueStore>, parse_cache: Arc<ParsedKeyCache>) -> Self {
        Self {
            primary,
            secondary: None,
            parse_cache,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn KeyValueStore>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub async fn store(&self, user_id: &UserId, key: &PrivateKeyPem) -> Result<()> {
        let entry = private_key_entry(user_id);
        self.primary
            .put(&entry, key.as_str())
            .await
            .with_context(|| format!("failed to persist private key for user {user_id}"))?;

        if let Some(secondary) = &self.secondary {
            if let Err(err) = secondary.put(&entry, key.as_str()).await {
                warn!(user_id = %user_id, error = %err, "keys: secondary key write failed");
            }
        }
        debug!(user_id = %user_id, "keys: private key stored");
        Ok(())
    }

    pub async fn get(&self, user_id: &UserId) -> Result<Option<PrivateKeyPem>> {
        let value = self
            .primary
            .get(&private_key_entry(user_id))
            .await
            .with_context(|| format!("failed to read private key for user {user_id}"))?;
        Ok(value.map(PrivateKeyPem::new))
    }

    pub async fn clear(&self, user_id: &UserId) -> Result<()> {
        let entry = private_key_entry(user_id);
        self.primary
            .delete(&entry)
            .await
            .with_context(|| format!("failed to clear private key for user {user_id}"))?;
        if let Some(secondary) = &self.secondary {
            if let Err(err) = secondary.delete(&entry).await {
                warn!(user_id = %user_id, error = %err, "keys: secondary key delete failed");
            }
        }
        info!(user_id = %user_id, "keys: private key cleared");
        Ok(())
    }

    /// Removes every stored private key (sign-out). Returns how many primary
    /// entries were removed.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self
            .primary
            .keys_with_prefix(PRIVATE_KEY_PREFIX)
            .await
            .context("failed to list stored private keys")?
        {
            if self.primary.delete(&entry).await? {
                removed += 1;
            }
        }

        if let Some(secondary) = &self.secondary {
            match secondary.keys_with_prefix(PRIVATE_KEY_PREFIX).await {
                Ok(entries) => {
                    for entry in entries {
                        if let Err(err) = secondary.delete(&entry).await {
                            warn!(entry = %entry, error = %err, "keys: secondary key delete failed");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "keys: failed to list secondary keys"),
            }
        }
        self.parse_cache.clear();
        info!(removed, "keys: all private keys cleared");
        Ok(removed)
    }

    /// Reads the backup copy and, when it is well formed, writes it back to
    /// the primary store. Malformed backups are ignored.
    pub async fn restore_from_secondary(&self, user_id: &UserId) -> Result<Option<PrivateKeyPem>> {
        let Some(secondary) = &self.secondary else {
            return Ok(None);
        };

        let entry = private_key_entry(user_id);
        let Some(value) = secondary
            .get(&entry)
            .await
            .with_context(|| format!("failed to read backup key for user {user_id}"))?
        else {
            return Ok(None);
        };

        let key = PrivateKeyPem::new(value);
        let validation = self.validate(&key);
        if !validation.valid {
            warn!(
                user_id = %user_id,
                reason = validation.reason.as_deref().unwrap_or_default(),
                "keys: ignoring malformed backup key"
            );
            return Ok(None);
        }

        self.primary
            .put(&entry, key.as_str())
            .await
            .with_context(|| format!("failed to sync backup key for user {user_id}"))?;
        info!(user_id = %user_id, "keys: restored private key from backup store");
        Ok(Some(key))
    }

    /// Structural check plus a full parse; a key that passes here can be used
    /// for decryption.
    pub fn validate(&self, key: &PrivateKeyPem) -> KeyValidation {
        KeyValidation::from_result(self.parse(key).map(|_| ()))
    }

    pub fn parse(&self, key: &PrivateKeyPem) -> Result<Arc<RsaPrivateKey>, KeyError> {
        self.parse_cache.get_or_parse(key)
    }
}

#[cfg(test)]
#[path = "tests/key_store_tests.rs"]
mod tests;
