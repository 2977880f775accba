use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{DeleteScope, MessageId, ThreadId, UserId},
    error::ApiError,
    protocol::{
        MarkReadRequest, MediaUploadRequest, MediaUploadTicket, MessagePayload, ProfileResponse,
        SendMessageRequest, ThreadSummary, UpdateMessageRequest,
    },
};
use tracing::debug;

/// Identity of the signed-in user and the bearer token for both transports.
pub trait AuthService: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Clone)]
pub struct StaticAuth {
    user_id: UserId,
    token: String,
}

impl StaticAuth {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

impl AuthService for StaticAuth {
    fn current_user(&self) -> Option<UserId> {
        Some(self.user_id.clone())
    }

    fn bearer_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>>;
    /// One page, oldest first. `before` is an exclusive cursor.
    async fn fetch_messages(
        &self,
        thread_id: &ThreadId,
        before: Option<&MessageId>,
        limit: u32,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        thread_id: &ThreadId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload>;
    async fn mark_read(&self, thread_id: &ThreadId, up_to: &MessageId) -> Result<()>;
    async fn update_message(
        &self,
        message_id: &MessageId,
        request: &UpdateMessageRequest,
    ) -> Result<MessagePayload>;
    async fn delete_message(&self, message_id: &MessageId, scope: DeleteScope) -> Result<()>;
    async fn request_media_upload(
        &self,
        thread_id: &ThreadId,
        request: &MediaUploadRequest,
    ) -> Result<MediaUploadTicket>;
    async fn block_user(&self, user_id: &UserId) -> Result<()>;
}

#[async_trait]
pub trait KeyIssuer: Send + Sync {
    /// Returns the private key text the server hands out, or `None` when the
    /// profile carries no key.
    async fn fetch_private_key(&self, regenerate: bool) -> Result<Option<String>>;
}

pub struct HttpMessagingApi {
    http: Client,
    server_url: String,
    auth: Arc<dyn AuthService>,
}

impl HttpMessagingApi {
    pub fn new(server_url: impl Into<String>, auth: Arc<dyn AuthService>) -> Self {
        Self::with_client(Client::new(), server_url, auth)
    }

    pub fn with_client(
        http: Client,
        server_url: impl Into<String>,
        auth: Arc<dyn AuthService>,
    ) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            server_url,
            auth,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.auth.bearer_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let response = self
            .authorized(self.http.get(format!("{}/threads", self.server_url)))
            .send()
            .await
            .context("failed to request thread list")?;
        read_json(response, "list threads").await
    }

    async fn fetch_messages(
        &self,
        thread_id: &ThreadId,
        before: Option<&MessageId>,
        limit: u32,
    ) -> Result<Vec<MessagePayload>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let response = self
            .authorized(
                self.http
                    .get(format!("{}/threads/{thread_id}/messages", self.server_url))
                    .query(&query),
            )
            .send()
            .await
            .with_context(|| format!("failed to request messages for thread {thread_id}"))?;
        let page: Vec<MessagePayload> = read_json(response, "fetch messages").await?;
        debug!(thread_id = %thread_id, count = page.len(), "api: fetched message page");
        Ok(page)
    }

    async fn send_message(
        &self,
        thread_id: &ThreadId,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/threads/{thread_id}/messages", self.server_url))
                    .json(request),
            )
            .send()
            .await
            .with_context(|| format!("failed to send message to thread {thread_id}"))?;
        read_json(response, "send message").await
    }

    async fn mark_read(&self, thread_id: &ThreadId, up_to: &MessageId) -> Result<()> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/threads/{thread_id}/read", self.server_url))
                    .json(&MarkReadRequest {
                        up_to_message_id: up_to.clone(),
                    }),
            )
            .send()
            .await
            .with_context(|| format!("failed to mark thread {thread_id} read"))?;
        ensure_success(response, "mark read").await.map(|_| ())
    }

    async fn update_message(
        &self,
        message_id: &MessageId,
        request: &UpdateMessageRequest,
    ) -> Result<MessagePayload> {
        let response = self
            .authorized(
                self.http
                    .patch(format!("{}/messages/{message_id}", self.server_url))
                    .json(request),
            )
            .send()
            .await
            .with_context(|| format!("failed to update message {message_id}"))?;
        read_json(response, "update message").await
    }

    async fn delete_message(&self, message_id: &MessageId, scope: DeleteScope) -> Result<()> {
        let response = self
            .authorized(
                self.http
                    .delete(format!("{}/messages/{message_id}", self.server_url))
                    .query(&[("scope", scope.as_query_value())]),
            )
            .send()
            .await
            .with_context(|| format!("failed to delete message {message_id}"))?;
        ensure_success(response, "delete message").await.map(|_| ())
    }

    async fn request_media_upload(
        &self,
        thread_id: &ThreadId,
        request: &MediaUploadRequest,
    ) -> Result<MediaUploadTicket> {
        let response = self
            .authorized(
                self.http
                    .post(format!("{}/threads/{thread_id}/media", self.server_url))
                    .json(request),
            )
            .send()
            .await
            .with_context(|| format!("failed to request media upload for thread {thread_id}"))?;
        read_json(response, "request media upload").await
    }

    async fn block_user(&self, user_id: &UserId) -> Result<()> {
        let response = self
            .authorized(self.http.post(format!("{}/blocks/{user_id}", self.server_url)))
            .send()
            .await
            .with_context(|| format!("failed to block user {user_id}"))?;
        ensure_success(response, "block user").await.map(|_| ())
    }
}

#[async_trait]
impl KeyIssuer for HttpMessagingApi {
    async fn fetch_private_key(&self, regenerate: bool) -> Result<Option<String>> {
        let response = self
            .authorized(
                self.http
                    .get(format!("{}/auth/profile", self.server_url))
                    .query(&[("regenerateKeys", regenerate)]),
            )
            .send()
            .await
            .context("failed to request profile")?;
        let profile: ProfileResponse = read_json(response, "fetch profile").await?;
        Ok(profile
            .encryption_keys
            .and_then(|keys| keys.private_key)
            .filter(|key| !key.trim().is_empty()))
    }
}

async fn ensure_success(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let api_error = ApiError::from_response_body(status.as_u16(), &body);
    Err(anyhow!(api_error).context(format!("{action} failed with status {status}")))
}

async fn read_json<T: DeserializeOwned>(response: Response, action: &str) -> Result<T> {
    ensure_success(response, action)
        .await?
        .json()
        .await
        .with_context(|| format!("{action}: invalid response body"))
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
