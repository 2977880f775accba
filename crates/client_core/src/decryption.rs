use parking_lot::Mutex;
use shared::{
    domain::UserId,
    protocol::{EncryptionEnvelope, MessagePayload},
};
use tracing::{debug, info, warn};

use crate::{
    crypto::{open_envelope, PrivateKeyPem},
    error::DecryptError,
    key_refresh::{KeyRefreshCoordinator, RefreshOptions},
    key_store::KeyStore,
};

pub const UNABLE_TO_DECRYPT: &str = "[Unable to decrypt message]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Refresh-and-retry rounds allowed per failure streak.
    pub max_refresh_retries: u32,
    /// Re-check the stored key after this many consecutive failures. Zero
    /// disables the check.
    pub revalidate_after_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_refresh_retries: 1,
            revalidate_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextSource {
    Unencrypted,
    Decrypted,
    Fallback,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlaintext {
    pub text: String,
    pub source: PlaintextSource,
}

impl ResolvedPlaintext {
    fn new(text: impl Into<String>, source: PlaintextSource) -> Self {
        Self {
            text: text.into(),
            source,
        }
    }
}

#[derive(Debug, Default)]
struct FailureState {
    consecutive_failures: u32,
    refresh_attempts: u32,
}

/// Turns any message payload into displayable text. Never fails: the worst
/// case is [`UNABLE_TO_DECRYPT`].
pub struct DecryptionPipeline {
    user_id: UserId,
    key_store: KeyStore,
    refresher: KeyRefreshCoordinator,
    policy: RetryPolicy,
    failures: Mutex<FailureState>,
}

impl DecryptionPipeline {
    pub fn new(
        user_id: UserId,
        key_store: KeyStore,
        refresher: KeyRefreshCoordinator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            user_id,
            key_store,
            refresher,
            policy,
            failures: Mutex::new(FailureState::default()),
        }
    }

    pub async fn resolve_plaintext(&self, message: &MessagePayload) -> String {
        self.resolve(message).await.text
    }

    pub async fn resolve(&self, message: &MessagePayload) -> ResolvedPlaintext {
        if !message.encrypted {
            return ResolvedPlaintext::new(
                message.body.clone().unwrap_or_default(),
                PlaintextSource::Unencrypted,
            );
        }

        let envelopes = self.candidate_envelopes(message);
        if envelopes.is_empty() {
            debug!(message_id = ?message.id, "decrypt: no complete envelope on message");
        } else if let Some(key) = self.ensure_key().await {
            match self.open_any(&key, &envelopes) {
                Ok(text) => {
                    self.reset_failures();
                    return ResolvedPlaintext::new(text, PlaintextSource::Decrypted);
                }
                Err(err) => {
                    debug!(message_id = ?message.id, error = %err, "decrypt: envelope did not open");
                }
            }
        }

        if let Some(text) = message.fallback_text() {
            self.reset_failures();
            return ResolvedPlaintext::new(text, PlaintextSource::Fallback);
        }

        if envelopes.is_empty() {
            self.record_failure().await;
            return ResolvedPlaintext::new(UNABLE_TO_DECRYPT, PlaintextSource::Placeholder);
        }
        self.retry_after_refresh(message, &envelopes).await
    }

    /// Recipient copy first, except when the viewer sent the message.
    fn candidate_envelopes<'a>(&self, message: &'a MessagePayload) -> Vec<&'a EncryptionEnvelope> {
        let recipient = message.encryption_envelope.as_ref();
        let sender = message.sender_envelope.as_ref();
        let ordered = if message.sender_id == self.user_id {
            [sender, recipient]
        } else {
            [recipient, sender]
        };
        ordered
            .into_iter()
            .flatten()
            .filter(|envelope| envelope.is_complete())
            .collect()
    }

    async fn ensure_key(&self) -> Option<PrivateKeyPem> {
        match self.key_store.get(&self.user_id).await {
            Ok(Some(key)) => {
                let validation = self.key_store.validate(&key);
                if validation.valid {
                    return Some(key);
                }
                warn!(
                    user_id = %self.user_id,
                    reason = validation.reason.as_deref().unwrap_or_default(),
                    "decrypt: stored key is malformed, regenerating"
                );
                if let Err(err) = self.key_store.clear(&self.user_id).await {
                    warn!(error = %err, "decrypt: failed to clear malformed key");
                }
                return self
                    .refresher
                    .refresh(
                        &self.user_id,
                        RefreshOptions {
                            force_regenerate: true,
                            silent: true,
                        },
                    )
                    .await;
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "decrypt: key store read failed"),
        }

        match self.key_store.restore_from_secondary(&self.user_id).await {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "decrypt: backup key store read failed"),
        }

        self.refresher
            .refresh(&self.user_id, RefreshOptions::silent())
            .await
    }

    fn open_any(
        &self,
        key: &PrivateKeyPem,
        envelopes: &[&EncryptionEnvelope],
    ) -> Result<String, DecryptError> {
        let parsed = self.key_store.parse(key)?;
        let mut last_err = DecryptError::EnvelopeIncomplete;
        for envelope in envelopes {
            match open_envelope(&parsed, envelope) {
                Ok(text) => return Ok(text),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn retry_after_refresh(
        &self,
        message: &MessagePayload,
        envelopes: &[&EncryptionEnvelope],
    ) -> ResolvedPlaintext {
        self.record_failure().await;

        while self.take_refresh_attempt() {
            info!(message_id = ?message.id, "decrypt: refreshing key and retrying");
            let Some(key) = self
                .refresher
                .refresh(
                    &self.user_id,
                    RefreshOptions {
                        force_regenerate: true,
                        silent: true,
                    },
                )
                .await
            else {
                break;
            };
            match self.open_any(&key, envelopes) {
                Ok(text) => {
                    self.reset_failures();
                    return ResolvedPlaintext::new(text, PlaintextSource::Decrypted);
                }
                Err(err) => {
                    debug!(message_id = ?message.id, error = %err, "decrypt: retry failed");
                }
            }
        }

        ResolvedPlaintext::new(UNABLE_TO_DECRYPT, PlaintextSource::Placeholder)
    }

    fn take_refresh_attempt(&self) -> bool {
        let mut failures = self.failures.lock();
        if failures.refresh_attempts < self.policy.max_refresh_retries {
            failures.refresh_attempts += 1;
            true
        } else {
            false
        }
    }

    async fn record_failure(&self) {
        let streak = {
            let mut failures = self.failures.lock();
            failures.consecutive_failures += 1;
            failures.consecutive_failures
        };

        let every = self.policy.revalidate_after_failures;
        if every == 0 || streak % every != 0 {
            return;
        }

        debug!(streak, "decrypt: revalidating stored key after repeated failures");
        let Ok(Some(key)) = self.key_store.get(&self.user_id).await else {
            return;
        };
        let validation = self.key_store.validate(&key);
        if !validation.valid {
            warn!(
                user_id = %self.user_id,
                reason = validation.reason.as_deref().unwrap_or_default(),
                "decrypt: stored key failed revalidation, clearing"
            );
            if let Err(err) = self.key_store.clear(&self.user_id).await {
                warn!(error = %err, "decrypt: failed to clear stale key");
            }
        }
    }

    fn reset_failures(&self) {
        *self.failures.lock() = FailureState::default();
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.lock().consecutive_failures
    }
}

#[cfg(test)]
#[path = "tests/decryption_tests.rs"]
mod tests;
