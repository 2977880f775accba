use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use shared::{
    domain::{ClientKey, DeleteScope, MessageId, ThreadId, UserId},
    protocol::{
        MediaAttachment, MessagePayload, MessageStatus, OutboundEvent, RealtimeEvent, Receipt, SendMessageRequest,
        UpdateMessageRequest,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::MessagingApi,
    decryption::DecryptionPipeline,
    error::SyncError,
    realtime::RealtimePublisher,
    receipts::{delivery_state, DeliveryReceiptReconciler, DeliveryState},
};

pub const DEFAULT_PAGE_SIZE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    LoadingInitial,
    Ready,
    LoadingOlder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Confirmed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Appended,
    /// A pending optimistic entry was upgraded to its server copy.
    Reconciled,
    Duplicate,
    Updated,
    Removed,
    ReceiptsChanged,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub message: MessagePayload,
    pub lifecycle: Lifecycle,
    pub plaintext: String,
}

impl ThreadEntry {
    pub fn delivery_state(&self) -> DeliveryState {
        delivery_state(&self.message)
    }

    fn matches(&self, other: &MessagePayload) -> bool {
        self.message.is_same_message(other)
    }
}

#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub state: SyncState,
    pub has_more: bool,
    pub before_cursor: Option<MessageId>,
    pub entries: Vec<ThreadEntry>,
}

struct ThreadState {
    state: SyncState,
    entries: Vec<ThreadEntry>,
    failed_sends: Vec<ThreadEntry>,
    before_cursor: Option<MessageId>,
    has_more: bool,
}

impl ThreadState {
    fn position_of(&self, message: &MessagePayload) -> Option<usize> {
        self.entries.iter().position(|entry| entry.matches(message))
    }

    fn position_of_id(&self, message_id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.id.as_ref() == Some(message_id))
    }

    fn position_of_client_key(&self, client_key: &ClientKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.client_key.as_ref() == Some(client_key))
    }

    /// Upgrades a pending entry in place when `message` is its server copy.
    fn reconcile_existing(&mut self, message: &MessagePayload) -> Option<ApplyOutcome> {
        let index = self.position_of(message)?;
        let entry = &mut self.entries[index];
        if entry.lifecycle == Lifecycle::Pending && message.id.is_some() {
            let plaintext = std::mem::take(&mut entry.plaintext);
            *entry = confirmed_entry(message.clone(), plaintext);
            return Some(ApplyOutcome::Reconciled);
        }
        Some(ApplyOutcome::Duplicate)
    }
}

/// Local view of one conversation: paginated history, optimistic sends and
/// realtime updates merged into a single ordered, duplicate-free list.
pub struct ThreadSyncEngine {
    thread_id: ThreadId,
    current_user: UserId,
    page_size: u32,
    api: Arc<dyn MessagingApi>,
    realtime: Arc<dyn RealtimePublisher>,
    pipeline: Arc<DecryptionPipeline>,
    receipts: DeliveryReceiptReconciler,
    inner: Mutex<ThreadState>,
}

impl ThreadSyncEngine {
    pub fn new(
        thread_id: ThreadId,
        current_user: UserId,
        page_size: u32,
        api: Arc<dyn MessagingApi>,
        realtime: Arc<dyn RealtimePublisher>,
        pipeline: Arc<DecryptionPipeline>,
    ) -> Self {
        Self {
            receipts: DeliveryReceiptReconciler::new(current_user.clone()),
            thread_id,
            current_user,
            page_size: page_size.max(1),
            api,
            realtime,
            pipeline,
            inner: Mutex::new(ThreadState {
                state: SyncState::Idle,
                entries: Vec::new(),
                failed_sends: Vec::new(),
                before_cursor: None,
                has_more: false,
            }),
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Fetches the newest page, replacing loaded history, then marks the
    /// thread read up to the newest message. Pending sends are kept.
    pub async fn load_initial(&self) -> Result<usize, SyncError> {
        let previous_state = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state,
                SyncState::LoadingInitial | SyncState::LoadingOlder
            ) {
                debug!(thread_id = %self.thread_id, "sync: load already in flight");
                return Ok(0);
            }
            std::mem::replace(&mut inner.state, SyncState::LoadingInitial)
        };

        let page = match self
            .api
            .fetch_messages(&self.thread_id, None, self.page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                self.inner.lock().await.state = previous_state;
                warn!(thread_id = %self.thread_id, error = %err, "sync: initial load failed");
                return Err(SyncError::LoadFailed {
                    thread_id: self.thread_id.clone(),
                    reason: format!("{err:#}"),
                });
            }
        };

        let fetched = page.len();
        let page_entries = self.resolve_page(page).await;
        let newest = {
            let mut inner = self.inner.lock().await;
            // Pending sends and anything newer than the page (realtime
            // arrivals during the fetch) survive the reload.
            let newest_fetched = page_entries.last().map(|entry| entry.message.created_at);
            let carried: Vec<ThreadEntry> = inner
                .entries
                .drain(..)
                .filter(|entry| {
                    entry.lifecycle == Lifecycle::Pending
                        || newest_fetched.map_or(true, |newest| entry.message.created_at >= newest)
                })
                .collect();
            let mut entries: Vec<ThreadEntry> = Vec::with_capacity(page_entries.len());
            for entry in page_entries {
                if !entries.iter().any(|known| known.matches(&entry.message)) {
                    entries.push(entry);
                }
            }
            for entry in carried {
                if !entries.iter().any(|known| known.matches(&entry.message)) {
                    entries.push(entry);
                }
            }
            inner.before_cursor = entries.iter().find_map(|entry| entry.message.id.clone());
            inner.has_more = fetched == self.page_size as usize;
            inner.entries = entries;
            inner.state = SyncState::Ready;
            inner
                .entries
                .iter()
                .rev()
                .find_map(|entry| entry.message.id.clone())
        };
        info!(thread_id = %self.thread_id, fetched, "sync: initial page loaded");

        if let Some(newest) = newest {
            if let Err(err) = self.api.mark_read(&self.thread_id, &newest).await {
                warn!(thread_id = %self.thread_id, error = %err, "sync: mark read failed");
            }
        }
        Ok(fetched)
    }

    /// Prepends the page before the oldest loaded message. A no-op when the
    /// history is exhausted or another load is running.
    pub async fn load_older(&self) -> Result<usize, SyncError> {
        let cursor = {
            let mut inner = self.inner.lock().await;
            if inner.state != SyncState::Ready || !inner.has_more {
                debug!(
                    thread_id = %self.thread_id,
                    state = ?inner.state,
                    has_more = inner.has_more,
                    "sync: load older skipped"
                );
                return Ok(0);
            }
            inner.state = SyncState::LoadingOlder;
            inner.before_cursor.clone()
        };

        let page = match self
            .api
            .fetch_messages(&self.thread_id, cursor.as_ref(), self.page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                self.inner.lock().await.state = SyncState::Ready;
                warn!(thread_id = %self.thread_id, error = %err, "sync: load older failed");
                return Err(SyncError::LoadFailed {
                    thread_id: self.thread_id.clone(),
                    reason: format!("{err:#}"),
                });
            }
        };

        let fetched = page.len();
        let page_entries = self.resolve_page(page).await;
        let mut inner = self.inner.lock().await;
        let mut older: Vec<ThreadEntry> = Vec::with_capacity(page_entries.len());
        for entry in page_entries {
            let known = inner.position_of(&entry.message).is_some()
                || older.iter().any(|o| o.matches(&entry.message));
            if !known {
                older.push(entry);
            }
        }
        let added = older.len();
        if let Some(first) = older.iter().find_map(|entry| entry.message.id.clone()) {
            inner.before_cursor = Some(first);
        }
        inner.has_more = fetched == self.page_size as usize;
        older.append(&mut inner.entries);
        inner.entries = older;
        inner.state = SyncState::Ready;
        debug!(
            thread_id = %self.thread_id,
            fetched,
            added,
            has_more = inner.has_more,
            "sync: older page loaded"
        );
        Ok(added)
    }

    /// Optimistic send: the message is visible immediately as `Pending` and
    /// rolled back if the server rejects it.
    pub async fn send_message(
        &self,
        text: &str,
        reply_to_id: Option<MessageId>,
    ) -> Result<MessagePayload, SyncError> {
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.send_outgoing(text, Vec::new(), reply_to_id).await
    }

    /// Sends already uploaded attachments as one message, with the same
    /// optimistic lifecycle as a text send.
    pub async fn send_files(
        &self,
        files: Vec<MediaAttachment>,
    ) -> Result<MessagePayload, SyncError> {
        if files.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.send_outgoing("", files, None).await
    }

    async fn send_outgoing(
        &self,
        text: &str,
        files: Vec<MediaAttachment>,
        reply_to_id: Option<MessageId>,
    ) -> Result<MessagePayload, SyncError> {
        let client_key = generate_client_key(&self.current_user);
        let optimistic = MessagePayload {
            id: None,
            thread_id: self.thread_id.clone(),
            sender_id: self.current_user.clone(),
            body: Some(text.to_string()).filter(|text| !text.is_empty()),
            fallback_content: None,
            encrypted: false,
            encryption_envelope: None,
            sender_envelope: None,
            reply_to_id: reply_to_id.clone(),
            client_key: Some(client_key.clone()),
            created_at: Utc::now(),
            edited_at: None,
            status: MessageStatus::default(),
            reactions: Vec::new(),
            media: files.clone(),
        };
        self.inner.lock().await.entries.push(ThreadEntry {
            message: optimistic,
            lifecycle: Lifecycle::Pending,
            plaintext: text.to_string(),
        });
        debug!(thread_id = %self.thread_id, client_key = %client_key, "sync: optimistic message queued");

        if let Err(err) = self
            .realtime
            .publish(OutboundEvent::TypingStop {
                thread_id: self.thread_id.clone(),
            })
            .await
        {
            debug!(error = %err, "sync: typing stop not published");
        }

        let request = SendMessageRequest {
            text: text.to_string(),
            files,
            reply_to_id,
            client_key: client_key.clone(),
        };
        match self.api.send_message(&self.thread_id, &request).await {
            Ok(created) => {
                let mut inner = self.inner.lock().await;
                match inner.position_of_client_key(&client_key) {
                    Some(index) if inner.entries[index].lifecycle == Lifecycle::Pending => {
                        let plaintext = std::mem::take(&mut inner.entries[index].plaintext);
                        inner.entries[index] = confirmed_entry(created.clone(), plaintext);
                    }
                    // The realtime echo already confirmed this send.
                    Some(_) => {}
                    None => {
                        if inner.position_of(&created).is_none() {
                            inner
                                .entries
                                .push(confirmed_entry(created.clone(), text.to_string()));
                        }
                    }
                }
                info!(thread_id = %self.thread_id, message_id = ?created.id, "sync: message sent");
                Ok(created)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let mut inner = self.inner.lock().await;
                if let Some(index) = inner.position_of_client_key(&client_key) {
                    if inner.entries[index].lifecycle == Lifecycle::Confirmed {
                        // The server stored it even though the response failed.
                        return Ok(inner.entries[index].message.clone());
                    }
                    let mut failed = inner.entries.remove(index);
                    failed.lifecycle = Lifecycle::Failed {
                        reason: reason.clone(),
                    };
                    inner.failed_sends.push(failed);
                }
                warn!(
                    thread_id = %self.thread_id,
                    client_key = %client_key,
                    error = %reason,
                    "sync: send failed, optimistic message rolled back"
                );
                Err(SyncError::SendFailed { client_key, reason })
            }
        }
    }

    /// Applies a `message:new` payload. Safe to call any number of times
    /// with the same message.
    pub async fn apply_incoming(&self, message: MessagePayload) -> ApplyOutcome {
        if message.thread_id != self.thread_id {
            return ApplyOutcome::Ignored;
        }
        if let Some(outcome) = self.inner.lock().await.reconcile_existing(&message) {
            return outcome;
        }

        let plaintext = self.pipeline.resolve_plaintext(&message).await;

        let outcome = {
            let mut inner = self.inner.lock().await;
            match inner.reconcile_existing(&message) {
                Some(outcome) => outcome,
                None => {
                    inner.entries.push(confirmed_entry(message.clone(), plaintext));
                    ApplyOutcome::Appended
                }
            }
        };

        if outcome == ApplyOutcome::Appended && message.sender_id != self.current_user {
            if let Some(message_id) = &message.id {
                if let Err(err) = self
                    .realtime
                    .publish(OutboundEvent::MessageDelivered {
                        message_id: message_id.clone(),
                    })
                    .await
                {
                    debug!(message_id = %message_id, error = %err, "sync: delivered ack not published");
                }
            }
        }
        outcome
    }

    /// Applies an edit or reaction change. Receipt lists are merged, never
    /// shrunk.
    pub async fn apply_update(&self, message: MessagePayload) -> ApplyOutcome {
        let Some(message_id) = message.id.clone() else {
            return ApplyOutcome::Ignored;
        };
        if message.thread_id != self.thread_id {
            return ApplyOutcome::Ignored;
        }
        if self.inner.lock().await.position_of_id(&message_id).is_none() {
            return ApplyOutcome::Ignored;
        }

        let plaintext = self.pipeline.resolve_plaintext(&message).await;

        let mut inner = self.inner.lock().await;
        let Some(index) = inner.position_of_id(&message_id) else {
            return ApplyOutcome::Ignored;
        };
        let entry = &mut inner.entries[index];
        let mut updated = message;
        merge_receipts(&mut updated.status.delivered_to, &entry.message.status.delivered_to);
        merge_receipts(&mut updated.status.read_by, &entry.message.status.read_by);
        if updated.client_key.is_none() {
            updated.client_key = entry.message.client_key.clone();
        }
        entry.message = updated;
        entry.plaintext = plaintext;
        entry.lifecycle = Lifecycle::Confirmed;
        ApplyOutcome::Updated
    }

    pub async fn apply_deleted(&self, message_id: &MessageId) -> ApplyOutcome {
        let mut inner = self.inner.lock().await;
        match inner.position_of_id(message_id) {
            Some(index) => {
                inner.entries.remove(index);
                debug!(thread_id = %self.thread_id, message_id = %message_id, "sync: message removed");
                ApplyOutcome::Removed
            }
            None => ApplyOutcome::Ignored,
        }
    }

    pub async fn apply_read_receipt(
        &self,
        reader: &UserId,
        up_to: &MessageId,
        at: DateTime<Utc>,
    ) -> usize {
        self.read_receipt(reader, up_to, at, false).await
    }

    /// With `require_held`, the receipt only counts when `up_to` is in the
    /// loaded list. Receipts that do not name their thread are applied this
    /// way so they cannot leak into unrelated conversations.
    async fn read_receipt(
        &self,
        reader: &UserId,
        up_to: &MessageId,
        at: DateTime<Utc>,
        require_held: bool,
    ) -> usize {
        let mut inner = self.inner.lock().await;
        if require_held && inner.position_of_id(up_to).is_none() {
            return 0;
        }
        self.receipts.apply_read(
            inner.entries.iter_mut().map(|entry| &mut entry.message),
            reader,
            up_to,
            at,
        )
    }

    pub async fn apply_delivered(
        &self,
        message_id: &MessageId,
        recipient: &UserId,
        at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        self.receipts.apply_delivered(
            inner.entries.iter_mut().map(|entry| &mut entry.message),
            message_id,
            recipient,
            at,
        )
    }

    /// Routes message-scoped realtime events; anything else is ignored.
    pub async fn apply_event(&self, event: RealtimeEvent) -> ApplyOutcome {
        match event {
            RealtimeEvent::MessageNew(message) => self.apply_incoming(message).await,
            RealtimeEvent::MessageUpdated(message) => self.apply_update(message).await,
            RealtimeEvent::MessageDeleted { id, .. } => self.apply_deleted(&id).await,
            RealtimeEvent::MessagesRead {
                user_id,
                up_to_message_id,
                thread_id,
                at,
            } => {
                if thread_id.as_ref().is_some_and(|thread_id| *thread_id != self.thread_id) {
                    return ApplyOutcome::Ignored;
                }
                let changed = self
                    .read_receipt(
                        &user_id,
                        &up_to_message_id,
                        at.unwrap_or_else(Utc::now),
                        thread_id.is_none(),
                    )
                    .await;
                receipts_outcome(changed > 0)
            }
            RealtimeEvent::MessageDelivered {
                message_id,
                user_id,
                at,
                ..
            } => {
                let changed = self
                    .apply_delivered(&message_id, &user_id, at.unwrap_or_else(Utc::now))
                    .await;
                receipts_outcome(changed)
            }
            _ => ApplyOutcome::Ignored,
        }
    }

    pub async fn delete_message(
        &self,
        message_id: &MessageId,
        scope: DeleteScope,
    ) -> Result<(), SyncError> {
        self.api
            .delete_message(message_id, scope)
            .await
            .map_err(|err| SyncError::message_action("delete", message_id, format!("{err:#}")))?;
        self.apply_deleted(message_id).await;
        Ok(())
    }

    /// Deletes a selection for the current user only. Requests run
    /// concurrently; every id the server accepted is removed locally even
    /// when others fail. Returns how many were deleted.
    pub async fn delete_many_for_me(&self, message_ids: &[MessageId]) -> Result<usize, SyncError> {
        let results = join_all(
            message_ids
                .iter()
                .map(|message_id| self.api.delete_message(message_id, DeleteScope::Me)),
        )
        .await;

        let mut deleted = 0;
        let mut failures = Vec::new();
        for (message_id, result) in message_ids.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.apply_deleted(message_id).await;
                    deleted += 1;
                }
                Err(err) => failures.push((message_id, format!("{err:#}"))),
            }
        }
        info!(
            thread_id = %self.thread_id,
            deleted,
            failed = failures.len(),
            "sync: bulk delete finished"
        );

        match failures.first() {
            None => Ok(deleted),
            Some((message_id, reason)) => Err(SyncError::message_action(
                "delete",
                message_id,
                format!(
                    "{} of {} deletes failed: {reason}",
                    failures.len(),
                    message_ids.len()
                ),
            )),
        }
    }

    /// Plaintext of the selected loaded messages in list order, one per
    /// line. `None` when nothing selected has text.
    pub async fn forwardable_text(&self, message_ids: &[MessageId]) -> Option<String> {
        let inner = self.inner.lock().await;
        let lines: Vec<&str> = inner
            .entries
            .iter()
            .filter(|entry| {
                entry
                    .message
                    .id
                    .as_ref()
                    .is_some_and(|id| message_ids.contains(id))
            })
            .map(|entry| entry.plaintext.as_str())
            .filter(|text| !text.trim().is_empty())
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    pub async fn react(&self, message_id: &MessageId, emoji: &str) -> Result<(), SyncError> {
        let updated = self
            .api
            .update_message(
                message_id,
                &UpdateMessageRequest {
                    add_reaction: Some(emoji.to_string()),
                },
            )
            .await
            .map_err(|err| SyncError::message_action("react", message_id, format!("{err:#}")))?;
        self.apply_update(updated).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> ThreadSnapshot {
        let inner = self.inner.lock().await;
        ThreadSnapshot {
            thread_id: self.thread_id.clone(),
            state: inner.state,
            has_more: inner.has_more,
            before_cursor: inner.before_cursor.clone(),
            entries: inner.entries.clone(),
        }
    }

    pub async fn entries(&self) -> Vec<ThreadEntry> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn failed_sends(&self) -> Vec<ThreadEntry> {
        self.inner.lock().await.failed_sends.clone()
    }

    pub async fn discard_failed(&self, client_key: &ClientKey) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.failed_sends.len();
        inner
            .failed_sends
            .retain(|entry| entry.message.client_key.as_ref() != Some(client_key));
        inner.failed_sends.len() != before
    }

    pub async fn state(&self) -> SyncState {
        self.inner.lock().await.state
    }

    pub async fn has_more(&self) -> bool {
        self.inner.lock().await.has_more
    }

    async fn resolve_page(&self, page: Vec<MessagePayload>) -> Vec<ThreadEntry> {
        let mut entries = Vec::with_capacity(page.len());
        for message in page {
            let plaintext = self.pipeline.resolve_plaintext(&message).await;
            entries.push(confirmed_entry(message, plaintext));
        }
        entries
    }
}

/// `<userId>-<unix millis>-<random>`, unique per send.
pub fn generate_client_key(user_id: &UserId) -> ClientKey {
    ClientKey::new(format!(
        "{user_id}-{}-{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    ))
}

/// Client key for a forwarded copy: a regular key with a `-fwd` suffix.
pub fn forward_client_key(user_id: &UserId) -> ClientKey {
    ClientKey::new(format!("{}-fwd", generate_client_key(user_id)))
}

fn confirmed_entry(message: MessagePayload, plaintext: String) -> ThreadEntry {
    ThreadEntry {
        message,
        lifecycle: Lifecycle::Confirmed,
        plaintext,
    }
}

fn merge_receipts(target: &mut Vec<Receipt>, existing: &[Receipt]) {
    for receipt in existing {
        if !target.iter().any(|r| r.user_id == receipt.user_id) {
            target.push(receipt.clone());
        }
    }
}

fn receipts_outcome(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::ReceiptsChanged
    } else {
        ApplyOutcome::Ignored
    }
}

#[cfg(test)]
#[path = "tests/thread_sync_tests.rs"]
mod tests;
