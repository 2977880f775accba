use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use shared::protocol::{OutboundEvent, RealtimeEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};
use url::Url;

pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Outbound half of the realtime channel.
#[async_trait]
pub trait RealtimePublisher: Send + Sync {
    async fn publish(&self, event: OutboundEvent) -> Result<()>;
}

/// Publisher that rejects every event; used before a connection exists.
pub struct DisconnectedPublisher;

#[async_trait]
impl RealtimePublisher for DisconnectedPublisher {
    async fn publish(&self, _event: OutboundEvent) -> Result<()> {
        Err(anyhow!("realtime channel is not connected"))
    }
}

/// Maps `http(s)://host` to `ws(s)://host/ws`.
pub fn websocket_url(server_url: &str) -> Result<Url> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use scheme {scheme} for {server_url}"))?;
    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

/// WebSocket connection to the realtime service. Inbound frames are decoded
/// and queued for the caller; outbound events are drained by a writer task.
#[derive(Default)]
pub struct RealtimeChannel {
    outbound: RwLock<Option<mpsc::UnboundedSender<OutboundEvent>>>,
}

impl RealtimeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .read()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    pub async fn connect(&self, url: &Url, token: &str) -> Result<mpsc::Receiver<RealtimeEvent>> {
        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket url: {url}"))?;
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("bearer token is not a valid header value")?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        info!(url = %url, "realtime: connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundEvent>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<RealtimeEvent>(INBOUND_QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "realtime: failed to encode outbound event");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "realtime: write failed, stopping writer");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeEvent>(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).await.is_err() {
                                debug!("realtime: inbound queue dropped, stopping reader");
                                break;
                            }
                        }
                        Err(err) => debug!(error = %err, "realtime: ignoring unrecognized frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime: read failed");
                        break;
                    }
                }
            }
            info!("realtime: connection closed");
        });

        *self.outbound.write() = Some(outbound_tx);
        Ok(inbound_rx)
    }

    pub fn disconnect(&self) {
        if self.outbound.write().take().is_some() {
            info!("realtime: disconnected");
        }
    }
}

#[async_trait]
impl RealtimePublisher for RealtimeChannel {
    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        let guard = self.outbound.read();
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow!("realtime channel is not connected"))?;
        sender
            .send(event)
            .map_err(|_| anyhow!("realtime writer has stopped"))
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
