use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientKey, DeleteScope, MessageId, PresenceStatus, ThreadId, UserId, UserRef},
    error::ApiError,
};

/// Hybrid-encryption bundle for one recipient: AES body, RSA-wrapped AES key
/// and the CBC initialization vector, all base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    #[serde(default, rename = "encryptedMessage", alias = "ciphertextBody")]
    pub ciphertext_body: String,
    #[serde(default, rename = "encryptedAESKey", alias = "wrappedSymmetricKey")]
    pub wrapped_symmetric_key: String,
    #[serde(default, rename = "iv", alias = "initializationVector")]
    pub initialization_vector: String,
}

impl EncryptionEnvelope {
    pub fn is_complete(&self) -> bool {
        !self.ciphertext_body.trim().is_empty()
            && !self.wrapped_symmetric_key.trim().is_empty()
            && !self.initialization_vector.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatus {
    #[serde(default)]
    pub delivered_to: Vec<Receipt>,
    #[serde(default)]
    pub read_by: Vec<Receipt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl MediaAttachment {
    /// Attachment for an uploaded file, classified by its content type the
    /// way the message list renders it: `image`, `video` or `file`.
    pub fn uploaded(
        url: impl Into<String>,
        filename: impl Into<String>,
        content_type: &str,
        size: u64,
    ) -> Self {
        let kind = if content_type.starts_with("image/") {
            "image"
        } else if content_type.starts_with("video/") {
            "video"
        } else {
            "file"
        };
        Self {
            url: url.into(),
            kind: kind.to_string(),
            filename: Some(filename.into()),
            size,
            mime_type: Some(content_type.to_string()).filter(|mime| !mime.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Server id. Absent only on optimistic local copies.
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub thread_id: ThreadId,
    pub sender_id: UserId,
    #[serde(default, alias = "content", alias = "text", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_content: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, alias = "encryptionData", skip_serializing_if = "Option::is_none")]
    pub encryption_envelope: Option<EncryptionEnvelope>,
    #[serde(default, alias = "senderEncryptionData", skip_serializing_if = "Option::is_none")]
    pub sender_envelope: Option<EncryptionEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<ClientKey>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
}

impl MessagePayload {
    /// True when either the server id or the client idempotency key matches.
    pub fn is_same_message(&self, other: &MessagePayload) -> bool {
        let same_id = matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b);
        let same_client_key =
            matches!((&self.client_key, &other.client_key), (Some(a), Some(b)) if a == b);
        same_id || same_client_key
    }

    /// First non-blank plaintext copy retained alongside the ciphertext.
    pub fn fallback_text(&self) -> Option<&str> {
        [self.body.as_deref(), self.fallback_content.as_deref()]
            .into_iter()
            .flatten()
            .find(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    #[serde(alias = "_id")]
    pub id: ThreadId,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<MediaAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    pub client_key: ClientKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub up_to_message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_reaction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadRequest {
    pub filename: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadTicket {
    pub upload_url: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_keys: Option<EncryptionKeys>,
}

/// Events pushed by the realtime channel, framed as
/// `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum RealtimeEvent {
    #[serde(rename = "message:new")]
    MessageNew(MessagePayload),
    #[serde(rename = "message:updated")]
    MessageUpdated(MessagePayload),
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        #[serde(alias = "messageId")]
        id: MessageId,
        scope: DeleteScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        message_id: MessageId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "messages:read")]
    MessagesRead {
        user_id: UserId,
        up_to_message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<ThreadId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "typing:start")]
    TypingStart { user_id: UserId, thread_id: ThreadId },
    #[serde(rename = "typing:stop")]
    TypingStop { user_id: UserId, thread_id: ThreadId },
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
    },
    #[serde(rename = "error")]
    Error(ApiError),
}

impl RealtimeEvent {
    /// Thread the event is scoped to, when the event carries one.
    pub fn thread_id(&self) -> Option<&ThreadId> {
        match self {
            Self::MessageNew(message) | Self::MessageUpdated(message) => Some(&message.thread_id),
            Self::MessageDeleted { thread_id, .. }
            | Self::MessageDelivered { thread_id, .. }
            | Self::MessagesRead { thread_id, .. } => thread_id.as_ref(),
            Self::TypingStart { thread_id, .. } | Self::TypingStop { thread_id, .. } => {
                Some(thread_id)
            }
            Self::PresenceUpdate { .. } | Self::Error(_) => None,
        }
    }
}

/// Events the client publishes on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    #[serde(rename = "thread:join")]
    JoinThread { thread_id: ThreadId },
    #[serde(rename = "thread:leave")]
    LeaveThread { thread_id: ThreadId },
    #[serde(rename = "typing:start")]
    TypingStart { thread_id: ThreadId },
    #[serde(rename = "typing:stop")]
    TypingStop { thread_id: ThreadId },
    #[serde(rename = "message:delivered")]
    MessageDelivered { message_id: MessageId },
}
