use std::time::Duration;

use shared::domain::{ClientKey, MessageId, ThreadId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed private key: {reason}")]
    Malformed { reason: String },
}

impl KeyError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Reasons a single decryption attempt failed. These never leave the
/// decryption pipeline; callers only ever see plaintext or a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("encryption envelope is incomplete")]
    EnvelopeIncomplete,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("envelope field {field} is not valid base64")]
    InvalidEncoding { field: &'static str },
    #[error("failed to unwrap symmetric key")]
    KeyUnwrap,
    #[error("unwrapped symmetric key has {actual} bytes, expected {expected}")]
    SymmetricKeyLength { expected: usize, actual: usize },
    #[error("initialization vector has {actual} bytes, expected {expected}")]
    IvLength { expected: usize, actual: usize },
    #[error("cipher finish reported failure")]
    Cipher,
    #[error("decrypted body is not valid utf-8")]
    InvalidUtf8,
    #[error("decrypted body is empty")]
    EmptyPlaintext,
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error("invalid recipient public key: {0}")]
    PublicKey(String),
    #[error("failed to encrypt message body")]
    Cipher,
    #[error("failed to wrap symmetric key: {0}")]
    Wrap(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("server issued no private key")]
    Unavailable,
    #[error("key refresh timed out after {0:?}")]
    TimedOut(Duration),
    #[error("issued private key rejected: {0}")]
    Malformed(#[from] KeyError),
    #[error("key issuer request failed: {0}")]
    Issuer(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("message {client_key} was not sent: {reason}")]
    SendFailed {
        client_key: ClientKey,
        reason: String,
    },
    #[error("failed to load messages for thread {thread_id}: {reason}")]
    LoadFailed { thread_id: ThreadId, reason: String },
    /// A user action other than sending failed. `target` names what it was
    /// applied to, e.g. `message m1` or `user bob`.
    #[error("{action} failed for {target}: {reason}")]
    ActionFailed {
        action: &'static str,
        target: String,
        reason: String,
    },
    #[error("message has neither text nor attachments")]
    EmptyMessage,
    #[error("thread {0} is not open")]
    NotReady(ThreadId),
    #[error("no signed-in user")]
    NotSignedIn,
}

impl SyncError {
    pub fn message_action(action: &'static str, message_id: &MessageId, reason: String) -> Self {
        Self::ActionFailed {
            action,
            target: format!("message {message_id}"),
            reason,
        }
    }
}
