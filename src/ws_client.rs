use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::config::ClientConfig;
use crate::crypto::ChannelCipher;
use crate::error::TransportError;
use crate::messages::{ClientFrame, ServerFrame};
use crate::models::{LocalUser, Message, MessageId};
use crate::transport::{ChannelTransport, Subscription};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>>;
type Feeds = Arc<Mutex<HashMap<String, Feed>>>;

struct Feed {
    token: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Forgets the waiter of a request whose future was dropped before an answer.
struct PendingGuard<'a> {
    pending: &'a Pending,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.request_id);
    }
}

/// Releases a feed registered by a subscribe call that never completed.
struct FeedGuard<'a> {
    transport: &'a WsTransport,
    channel_id: &'a str,
    token: u64,
    armed: bool,
}

impl Drop for FeedGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            release_feed(&self.transport.feeds, &self.transport.outbox, self.channel_id, self.token);
        }
    }
}

/// [`ChannelTransport`] speaking the relay protocol over a WebSocket.
pub struct WsTransport {
    outbox: mpsc::UnboundedSender<ClientFrame>,
    pending: Pending,
    feeds: Feeds,
    next_id: AtomicU64,
    secret: Option<Arc<str>>,
    user: LocalUser,
}

impl WsTransport {
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        let (ws, _) = connect_async(config.relay_url.as_str()).await?;
        info!("Connected to relay at {}", config.relay_url);
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (outbox, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::text(text)).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let pending: Pending = Arc::default();
        let feeds: Feeds = Arc::default();
        let secret: Option<Arc<str>> = config.channel_secret.as_deref().map(Arc::from);

        let reader_pending = Arc::clone(&pending);
        let reader_feeds = Arc::clone(&feeds);
        let reader_secret = secret.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => route(frame, &reader_pending, &reader_feeds, reader_secret.as_deref()),
                        Err(e) => warn!("Malformed frame from relay: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }

            // Dropping the senders fails waiting requests and ends every push stream.
            lock(&reader_pending).clear();
            lock(&reader_feeds).clear();
            warn!("Relay connection closed");
        });

        let transport = WsTransport {
            outbox,
            pending,
            feeds,
            next_id: AtomicU64::new(1),
            secret,
            user: config.user.clone(),
        };
        transport.post(ClientFrame::Hello {
            user_id: transport.user.id.clone(),
        })?;
        Ok(transport)
    }

    fn post(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.outbox.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<ServerFrame, TransportError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, tx);
        let _waiter = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        self.post(build(request_id))?;
        match rx.await {
            Ok(ServerFrame::Error { message, .. }) => Err(TransportError::Rejected(message)),
            Ok(frame) => Ok(frame),
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn cipher(&self, channel_id: &str) -> Option<ChannelCipher> {
        self.secret
            .as_deref()
            .map(|secret| ChannelCipher::derive(secret, channel_id))
    }
}

fn route(frame: ServerFrame, pending: &Pending, feeds: &Feeds, secret: Option<&str>) {
    match frame {
        ServerFrame::Push {
            channel_id,
            mut message,
        } => {
            if let Some(secret) = secret {
                match ChannelCipher::derive(secret, &channel_id).open(&message.text) {
                    Ok(text) => message.text = text,
                    Err(e) => {
                        warn!("Dropping unreadable push {} on {}: {}", message.id, channel_id, e);
                        return;
                    }
                }
            }
            match lock(feeds).get(&channel_id) {
                Some(feed) => {
                    let _ = feed.sender.send(message);
                }
                None => debug!("Push for unsubscribed channel {}", channel_id),
            }
        }
        ServerFrame::Error {
            request_id: None,
            message,
        } => warn!("Relay error: {}", message),
        frame => {
            let Some(request_id) = frame.request_id() else { return };
            match lock(pending).remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                }
                None => debug!("Response for unknown request {}", request_id),
            }
        }
    }
}

/// Drops the feed for `channel_id` if it is still the one issued under `token`,
/// and tells the relay to stop pushing it.
fn release_feed(feeds: &Feeds, outbox: &mpsc::UnboundedSender<ClientFrame>, channel_id: &str, token: u64) {
    let mut active = lock(feeds);
    if active.get(channel_id).is_some_and(|feed| feed.token == token) {
        active.remove(channel_id);
        let _ = outbox.send(ClientFrame::Unsubscribe {
            channel_id: channel_id.to_string(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn fetch_messages(&self, channel_id: &str) -> Result<Vec<Message>, TransportError> {
        let frame = self
            .request(|request_id| ClientFrame::FetchMessages {
                request_id,
                channel_id: channel_id.to_string(),
            })
            .await?;

        let ServerFrame::Messages { mut messages, .. } = frame else {
            return Err(TransportError::Rejected("Unexpected response to fetch".to_string()));
        };
        if let Some(cipher) = self.cipher(channel_id) {
            for message in &mut messages {
                message.text = cipher.open(&message.text)?;
            }
        }
        Ok(messages)
    }

    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, TransportError> {
        let token = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered before asking so no push can slip in ahead of the ack.
        lock(&self.feeds).insert(channel_id.to_string(), Feed { token, sender: tx });
        let mut registered = FeedGuard {
            transport: self,
            channel_id,
            token,
            armed: true,
        };

        self.request(|request_id| ClientFrame::Subscribe {
            request_id,
            channel_id: channel_id.to_string(),
        })
        .await?;
        registered.armed = false;

        let feeds = Arc::clone(&self.feeds);
        let outbox = self.outbox.clone();
        let channel = channel_id.to_string();
        Ok(Subscription::new(channel_id, rx, move || {
            release_feed(&feeds, &outbox, &channel, token);
        }))
    }

    async fn send_message(&self, text: &str, channel_id: &str) -> Result<(), TransportError> {
        let text = match self.cipher(channel_id) {
            Some(cipher) => cipher.seal(text)?,
            None => text.to_string(),
        };
        self.request(|request_id| ClientFrame::SendMessage {
            request_id,
            channel_id: channel_id.to_string(),
            text,
            sender: Some(self.user.profile()),
        })
        .await
        .map(|_| ())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), TransportError> {
        self.request(|request_id| ClientFrame::DeleteMessage {
            request_id,
            message_id: message_id.clone(),
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::FutureExt;

    use crate::backend::Backend;
    use crate::config::SyncConfig;
    use crate::server::{routes, Server};

    async fn connect() -> (WsTransport, Backend) {
        let backend = Backend::new();
        let server = Arc::new(Server::new(backend.clone()));
        let (addr, serving) = warp::serve(routes(server)).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(serving);

        let config = ClientConfig {
            relay_url: format!("ws://{addr}/ws"),
            channel_secret: None,
            user: LocalUser::new("me", "Me"),
            sync: SyncConfig::default(),
        };
        (WsTransport::connect(&config).await.unwrap(), backend)
    }

    #[tokio::test]
    async fn unanswered_request_forgets_its_waiter() {
        let (transport, _backend) = connect().await;

        // The relay never answers an unsubscribe.
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            transport.request(|_| ClientFrame::Unsubscribe {
                channel_id: "global".to_string(),
            }),
        )
        .await;

        assert!(outcome.is_err());
        assert!(lock(&transport.pending).is_empty());
    }

    #[tokio::test]
    async fn abandoned_subscribe_releases_its_feed() {
        let (transport, backend) = connect().await;

        assert!(transport.subscribe("global").now_or_never().is_none());
        assert!(lock(&transport.feeds).is_empty());
        assert!(lock(&transport.pending).is_empty());

        // Subscribe and the follow-up unsubscribe reach the relay in order.
        let subscription = transport.subscribe("random").await.unwrap();
        assert_eq!(backend.subscriber_count("random").await, 1);
        assert_eq!(backend.subscriber_count("global").await, 0);
        drop(subscription);
    }

    #[tokio::test]
    async fn closed_subscription_unsubscribes_at_relay() {
        let (transport, backend) = connect().await;

        let subscription = transport.subscribe("events").await.unwrap();
        assert_eq!(backend.subscriber_count("events").await, 1);
        subscription.close();
        assert!(lock(&transport.feeds).is_empty());

        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.subscriber_count("events").await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay dropped the feed");
    }
}
