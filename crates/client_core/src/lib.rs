use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use shared::{
    domain::{ClientKey, DeleteScope, MessageId, ThreadId, UserId},
    protocol::{
        MediaAttachment, MediaUploadRequest, MediaUploadTicket, MessagePayload, OutboundEvent,
        RealtimeEvent, SendMessageRequest, ThreadSummary,
    },
};
use storage::{KeyValueStore, Storage};
use tokio::{
    sync::{broadcast, mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

pub mod api;
pub mod config;
pub mod crypto;
pub mod decryption;
pub mod error;
pub mod key_refresh;
pub mod key_store;
pub mod presence;
pub mod realtime;
pub mod receipts;
pub mod thread_sync;

pub use api::{AuthService, HttpMessagingApi, KeyIssuer, MessagingApi, StaticAuth};
pub use config::{load_settings, ClientSettings};
pub use crypto::{ParsedKeyCache, PrivateKeyPem};
pub use decryption::{DecryptionPipeline, RetryPolicy, UNABLE_TO_DECRYPT};
pub use error::{DecryptError, KeyError, RefreshError, SyncError};
pub use key_refresh::{KeyRefreshCoordinator, RefreshCycle, RefreshOptions};
pub use key_store::KeyStore;
pub use presence::{PresenceState, PresenceTypingTracker};
pub use realtime::{RealtimeChannel, RealtimePublisher};
pub use receipts::{DeliveryReceiptReconciler, DeliveryState};
pub use thread_sync::{
    ApplyOutcome, Lifecycle, SyncState, ThreadEntry, ThreadSnapshot, ThreadSyncEngine,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    KeyRefreshStarted,
    KeyRefreshed,
    KeyUnavailable {
        reason: String,
    },
    ThreadUpdated {
        thread_id: ThreadId,
        outcome: ApplyOutcome,
    },
    TypingChanged {
        thread_id: ThreadId,
        typing: Vec<UserId>,
    },
    PresenceChanged(PresenceState),
    SendFailed {
        thread_id: ThreadId,
        client_key: ClientKey,
        reason: String,
    },
    ActionFailed {
        reason: String,
    },
    RealtimeDisconnected,
    Error(String),
}

pub struct ClientDependencies {
    pub auth: Arc<dyn AuthService>,
    pub api: Arc<dyn MessagingApi>,
    pub key_issuer: Arc<dyn KeyIssuer>,
    pub realtime: Arc<dyn RealtimePublisher>,
    pub primary_store: Arc<dyn KeyValueStore>,
    pub secondary_store: Option<Arc<dyn KeyValueStore>>,
}

/// Client session for one signed-in user: owns the key material, the open
/// threads and the typing/presence view, and routes realtime events to them.
pub struct MessagingClient {
    settings: ClientSettings,
    user_id: UserId,
    api: Arc<dyn MessagingApi>,
    realtime: Arc<dyn RealtimePublisher>,
    key_store: KeyStore,
    refresher: KeyRefreshCoordinator,
    pipeline: Arc<DecryptionPipeline>,
    presence: Mutex<PresenceTypingTracker>,
    threads: RwLock<HashMap<ThreadId, Arc<ThreadSyncEngine>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessagingClient {
    pub fn new(
        settings: ClientSettings,
        deps: ClientDependencies,
    ) -> std::result::Result<Arc<Self>, SyncError> {
        let user_id = deps.auth.current_user().ok_or(SyncError::NotSignedIn)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let parse_cache = Arc::new(ParsedKeyCache::new(settings.key_cache_capacity));
        let mut key_store = KeyStore::new(deps.primary_store, parse_cache);
        if let Some(secondary) = deps.secondary_store {
            key_store = key_store.with_secondary(secondary);
        }
        let refresher = KeyRefreshCoordinator::new(
            deps.key_issuer,
            key_store.clone(),
            events.clone(),
            settings.key_refresh_timeout(),
        );
        let pipeline = Arc::new(DecryptionPipeline::new(
            user_id.clone(),
            key_store.clone(),
            refresher.clone(),
            settings.retry_policy(),
        ));

        Ok(Arc::new(Self {
            presence: Mutex::new(PresenceTypingTracker::new(settings.typing_timeout())),
            settings,
            user_id,
            api: deps.api,
            realtime: deps.realtime,
            key_store,
            refresher,
            pipeline,
            threads: RwLock::new(HashMap::new()),
            events,
        }))
    }

    /// Wires the HTTP API, SQLite key stores and the websocket channel from
    /// settings, then starts routing inbound events.
    pub async fn connect(
        settings: ClientSettings,
        auth: Arc<dyn AuthService>,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let http = Arc::new(HttpMessagingApi::new(
            settings.server_url.clone(),
            Arc::clone(&auth),
        ));
        let primary = Storage::new(&config::normalize_database_url(&settings.database_url))
            .await
            .context("failed to open primary key store")?;
        let secondary: Option<Arc<dyn KeyValueStore>> = match &settings.secondary_database_url {
            Some(url) => Some(Arc::new(
                Storage::new(&config::normalize_database_url(url))
                    .await
                    .context("failed to open secondary key store")?,
            )),
            None => None,
        };
        let channel = Arc::new(RealtimeChannel::new());

        let realtime_url = match &settings.realtime_url {
            Some(url) => Url::parse(url).with_context(|| format!("invalid realtime url: {url}"))?,
            None => realtime::websocket_url(&settings.server_url)?,
        };
        let token = auth
            .bearer_token()
            .ok_or_else(|| anyhow!("not logged in: missing bearer token"))?;

        let client = Self::new(
            settings,
            ClientDependencies {
                auth,
                api: http.clone(),
                key_issuer: http,
                realtime: channel.clone(),
                primary_store: Arc::new(primary),
                secondary_store: secondary,
            },
        )?;
        let inbound = channel.connect(&realtime_url, &token).await?;
        let router = client.spawn_event_loop(inbound);
        Ok((client, router))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    pub fn pipeline(&self) -> &Arc<DecryptionPipeline> {
        &self.pipeline
    }

    /// Persists a key handed out at sign-in after checking it parses.
    pub async fn store_issued_key(&self, private_key: &str) -> Result<()> {
        let key = PrivateKeyPem::new(private_key);
        self.key_store.parse(&key)?;
        self.key_store.store(&self.user_id, &key).await
    }

    pub async fn refresh_keys(&self, options: RefreshOptions) -> Option<PrivateKeyPem> {
        self.refresher.refresh(&self.user_id, options).await
    }

    /// Drops all open threads and every stored private key.
    pub async fn sign_out(&self) -> Result<()> {
        self.threads.write().await.clear();
        self.key_store.clear_all().await?;
        info!(user_id = %self.user_id, "client: signed out");
        Ok(())
    }

    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.api.list_threads().await
    }

    /// Subscribes to the thread's realtime room and loads its newest page.
    /// Opening an already open thread returns the existing engine. A thread
    /// whose first load failed is not kept open, so opening it again retries.
    pub async fn open_thread(
        &self,
        thread_id: &ThreadId,
    ) -> std::result::Result<Arc<ThreadSyncEngine>, SyncError> {
        if let Some(engine) = self.thread(thread_id).await {
            if engine.state().await == SyncState::Idle {
                engine.load_initial().await?;
            }
            return Ok(engine);
        }

        let engine = Arc::new(ThreadSyncEngine::new(
            thread_id.clone(),
            self.user_id.clone(),
            self.settings.page_size,
            Arc::clone(&self.api),
            Arc::clone(&self.realtime),
            Arc::clone(&self.pipeline),
        ));
        let engine = Arc::clone(
            self.threads
                .write()
                .await
                .entry(thread_id.clone())
                .or_insert(engine),
        );

        if let Err(err) = self
            .realtime
            .publish(OutboundEvent::JoinThread {
                thread_id: thread_id.clone(),
            })
            .await
        {
            warn!(thread_id = %thread_id, error = %err, "client: thread join not published");
        }
        if let Err(err) = engine.load_initial().await {
            let mut threads = self.threads.write().await;
            if threads
                .get(thread_id)
                .is_some_and(|registered| Arc::ptr_eq(registered, &engine))
            {
                threads.remove(thread_id);
            }
            return Err(err);
        }
        Ok(engine)
    }

    pub async fn close_thread(&self, thread_id: &ThreadId) -> bool {
        if self.threads.write().await.remove(thread_id).is_none() {
            return false;
        }
        if let Err(err) = self
            .realtime
            .publish(OutboundEvent::LeaveThread {
                thread_id: thread_id.clone(),
            })
            .await
        {
            debug!(thread_id = %thread_id, error = %err, "client: thread leave not published");
        }
        true
    }

    pub async fn thread(&self, thread_id: &ThreadId) -> Option<Arc<ThreadSyncEngine>> {
        self.threads.read().await.get(thread_id).cloned()
    }

    async fn open_engine(
        &self,
        thread_id: &ThreadId,
    ) -> std::result::Result<Arc<ThreadSyncEngine>, SyncError> {
        self.thread(thread_id)
            .await
            .ok_or_else(|| SyncError::NotReady(thread_id.clone()))
    }

    pub async fn send_message(
        &self,
        thread_id: &ThreadId,
        text: &str,
        reply_to_id: Option<MessageId>,
    ) -> std::result::Result<MessagePayload, SyncError> {
        let engine = self.open_engine(thread_id).await?;
        let result = engine.send_message(text, reply_to_id).await;
        self.notify_send_result(thread_id, &result);
        result
    }

    /// Sends attachments obtained through [`Self::request_media_upload`].
    pub async fn send_files(
        &self,
        thread_id: &ThreadId,
        files: Vec<MediaAttachment>,
    ) -> std::result::Result<MessagePayload, SyncError> {
        let engine = self.open_engine(thread_id).await?;
        let result = engine.send_files(files).await;
        self.notify_send_result(thread_id, &result);
        result
    }

    /// Copies the text of the selected messages in `source` into one new
    /// message in `target`. `Ok(None)` when the selection has no text.
    pub async fn forward_messages(
        &self,
        source: &ThreadId,
        message_ids: &[MessageId],
        target: &ThreadId,
    ) -> std::result::Result<Option<MessagePayload>, SyncError> {
        let engine = self.open_engine(source).await?;
        let Some(text) = engine.forwardable_text(message_ids).await else {
            debug!(thread_id = %source, "client: nothing to forward");
            return Ok(None);
        };

        let request = SendMessageRequest {
            text,
            files: Vec::new(),
            reply_to_id: None,
            client_key: thread_sync::forward_client_key(&self.user_id),
        };
        let result = self
            .api
            .send_message(target, &request)
            .await
            .map_err(|err| SyncError::ActionFailed {
                action: "forward",
                target: format!("thread {target}"),
                reason: format!("{err:#}"),
            });
        self.notify_action_result(&result);
        let created = result?;

        if let Some(target_engine) = self.thread(target).await {
            let outcome = target_engine.apply_incoming(created.clone()).await;
            if outcome == ApplyOutcome::Appended {
                let _ = self.events.send(ClientEvent::ThreadUpdated {
                    thread_id: target.clone(),
                    outcome,
                });
            }
        }
        info!(from = %source, to = %target, count = message_ids.len(), "client: messages forwarded");
        Ok(Some(created))
    }

    pub async fn delete_message(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        scope: DeleteScope,
    ) -> std::result::Result<(), SyncError> {
        let engine = self.open_engine(thread_id).await?;
        let result = engine.delete_message(message_id, scope).await;
        self.notify_action_result(&result);
        result
    }

    /// Deletes the selected messages for the current user only.
    pub async fn delete_many_for_me(
        &self,
        thread_id: &ThreadId,
        message_ids: &[MessageId],
    ) -> std::result::Result<usize, SyncError> {
        let engine = self.open_engine(thread_id).await?;
        let result = engine.delete_many_for_me(message_ids).await;
        self.notify_action_result(&result);
        result
    }

    pub async fn block_user(&self, user_id: &UserId) -> std::result::Result<(), SyncError> {
        let result = self
            .api
            .block_user(user_id)
            .await
            .map_err(|err| SyncError::ActionFailed {
                action: "block",
                target: format!("user {user_id}"),
                reason: format!("{err:#}"),
            });
        self.notify_action_result(&result);
        if result.is_ok() {
            info!(user_id = %user_id, "client: user blocked");
        }
        result
    }

    pub async fn react(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        emoji: &str,
    ) -> std::result::Result<(), SyncError> {
        let engine = self.open_engine(thread_id).await?;
        let result = engine.react(message_id, emoji).await;
        self.notify_action_result(&result);
        result
    }

    pub async fn request_media_upload(
        &self,
        thread_id: &ThreadId,
        filename: &str,
        content_type: &str,
    ) -> Result<MediaUploadTicket> {
        self.api
            .request_media_upload(
                thread_id,
                &MediaUploadRequest {
                    filename: filename.to_string(),
                    content_type: content_type.to_string(),
                },
            )
            .await
    }

    /// Publishes the local user's typing state for `thread_id`.
    pub async fn notify_typing(&self, thread_id: &ThreadId, typing: bool) {
        let thread_id = thread_id.clone();
        let event = if typing {
            OutboundEvent::TypingStart { thread_id }
        } else {
            OutboundEvent::TypingStop { thread_id }
        };
        if let Err(err) = self.realtime.publish(event).await {
            debug!(error = %err, "client: typing state not published");
        }
    }

    pub fn typing_users(&self, thread_id: &ThreadId) -> Vec<UserId> {
        self.presence.lock().typing_users(thread_id)
    }

    pub fn is_typing(&self, thread_id: &ThreadId) -> bool {
        self.presence.lock().is_typing(thread_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.presence.lock().is_online(user_id)
    }

    pub fn presence(&self, user_id: &UserId) -> Option<PresenceState> {
        self.presence.lock().presence(user_id).cloned()
    }

    /// Applies one inbound realtime event. Events are applied in the order
    /// they are handed in.
    pub async fn handle_event(&self, event: RealtimeEvent) {
        match &event {
            RealtimeEvent::TypingStart { user_id, thread_id }
            | RealtimeEvent::TypingStop { user_id, thread_id } => {
                if *user_id == self.user_id {
                    return;
                }
                let typing = {
                    let mut tracker = self.presence.lock();
                    tracker.apply(&event);
                    tracker.typing_users(thread_id)
                };
                let _ = self.events.send(ClientEvent::TypingChanged {
                    thread_id: thread_id.clone(),
                    typing,
                });
                return;
            }
            RealtimeEvent::PresenceUpdate {
                user_id,
                status,
                last_seen,
            } => {
                let state = self
                    .presence
                    .lock()
                    .on_presence_update(user_id, *status, *last_seen);
                let _ = self.events.send(ClientEvent::PresenceChanged(state));
                return;
            }
            RealtimeEvent::Error(err) => {
                warn!(error = %err, "client: realtime error event");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                return;
            }
            RealtimeEvent::MessageNew(message) => {
                // A message from someone ends their typing indicator.
                self.presence
                    .lock()
                    .on_typing_stop(&message.sender_id, &message.thread_id);
            }
            _ => {}
        }

        let targets: Vec<Arc<ThreadSyncEngine>> = match event.thread_id() {
            Some(thread_id) => self.thread(thread_id).await.into_iter().collect(),
            None => self.threads.read().await.values().cloned().collect(),
        };
        if targets.is_empty() {
            debug!(thread_id = ?event.thread_id(), "client: event for unopened thread ignored");
        }
        for engine in targets {
            let outcome = engine.apply_event(event.clone()).await;
            if !matches!(outcome, ApplyOutcome::Ignored | ApplyOutcome::Duplicate) {
                let _ = self.events.send(ClientEvent::ThreadUpdated {
                    thread_id: engine.thread_id().clone(),
                    outcome,
                });
            }
        }
    }

    /// Drains `inbound` on a dedicated task until the channel closes.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<RealtimeEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                client.handle_event(event).await;
            }
            info!(user_id = %client.user_id, "client: realtime event stream ended");
            let _ = client.events.send(ClientEvent::RealtimeDisconnected);
        })
    }

    fn notify_send_result(
        &self,
        thread_id: &ThreadId,
        result: &std::result::Result<MessagePayload, SyncError>,
    ) {
        if let Err(SyncError::SendFailed { client_key, reason }) = result {
            let _ = self.events.send(ClientEvent::SendFailed {
                thread_id: thread_id.clone(),
                client_key: client_key.clone(),
                reason: reason.clone(),
            });
        }
    }

    fn notify_action_result<T>(&self, result: &std::result::Result<T, SyncError>) {
        if let Err(err) = result {
            let _ = self.events.send(ClientEvent::ActionFailed {
                reason: err.to_string(),
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
