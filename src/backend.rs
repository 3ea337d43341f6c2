use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::channel::ChannelLog;
use crate::error::TransportError;
use crate::models::{LocalUser, Message, MessageId, Origin, SenderProfile};
use crate::transport::{ChannelTransport, Subscription};

type Channels = Arc<RwLock<HashMap<String, ChannelLog>>>;

/// In-memory message store shared by the relay server and [`LocalTransport`].
#[derive(Clone, Default)]
pub struct Backend {
    channels: Channels,
}

impl Backend {
    pub fn new() -> Self {
        Backend::default()
    }

    async fn channel(&self, channel_id: &str) -> ChannelLog {
        {
            let channels = self.channels.read().await;
            if let Some(log) = channels.get(channel_id) {
                return log.clone();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                info!("Opening channel {}", channel_id);
                ChannelLog::new(channel_id.to_string())
            })
            .clone()
    }

    pub async fn messages(&self, channel_id: &str) -> Vec<Message> {
        self.channel(channel_id).await.messages().await
    }

    pub async fn subscribe(
        &self,
        channel_id: &str,
        subscriber_id: String,
        sender: mpsc::UnboundedSender<Message>,
    ) {
        debug!("Subscriber {} joined {}", subscriber_id, channel_id);
        self.channel(channel_id).await.add_subscriber(subscriber_id, sender).await;
    }

    pub async fn unsubscribe(&self, channel_id: &str, subscriber_id: &str) {
        let channels = self.channels.read().await;
        if let Some(log) = channels.get(channel_id) {
            log.remove_subscriber(subscriber_id).await;
            debug!("Subscriber {} left {}", subscriber_id, channel_id);
        }
    }

    pub async fn subscriber_count(&self, channel_id: &str) -> usize {
        let channels = self.channels.read().await;
        match channels.get(channel_id) {
            Some(log) => log.subscriber_count().await,
            None => 0,
        }
    }

    /// Stores a new message under a permanent id and pushes it to the channel.
    pub async fn post(
        &self,
        channel_id: &str,
        text: &str,
        sender_id: &str,
        sender: Option<SenderProfile>,
    ) -> Result<Message, TransportError> {
        if text.trim().is_empty() {
            return Err(TransportError::Rejected("Message text is empty".to_string()));
        }

        let message = Message {
            id: MessageId::permanent(),
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            created_at: Utc::now(),
            sender,
            origin: Origin::Confirmed,
        };

        self.channel(channel_id).await.append(message.clone()).await;
        Ok(message)
    }

    /// Removes a message from whichever channel holds it. Only its author may do so.
    pub async fn delete(&self, message_id: &MessageId, requester_id: &str) -> Result<(), TransportError> {
        let channels = self.channels.read().await;
        for log in channels.values() {
            if let Some(message) = log.find(message_id).await {
                if message.sender_id != requester_id {
                    return Err(TransportError::Rejected(
                        "Only the author can delete a message".to_string(),
                    ));
                }
                log.remove(message_id).await;
                return Ok(());
            }
        }

        Err(TransportError::NotFound(message_id.to_string()))
    }
}

/// [`ChannelTransport`] bound to an in-process [`Backend`] for one user session.
#[derive(Clone)]
pub struct LocalTransport {
    backend: Backend,
    user: LocalUser,
}

impl LocalTransport {
    pub fn new(backend: Backend, user: LocalUser) -> Self {
        LocalTransport { backend, user }
    }
}

#[async_trait]
impl ChannelTransport for LocalTransport {
    async fn fetch_messages(&self, channel_id: &str) -> Result<Vec<Message>, TransportError> {
        Ok(self.backend.messages(channel_id).await)
    }

    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, TransportError> {
        let subscriber_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.backend.subscribe(channel_id, subscriber_id.clone(), tx).await;

        // The channel log prunes the sender on its next push once the receiver is closed.
        let channel = channel_id.to_string();
        Ok(Subscription::new(channel_id, rx, move || {
            debug!("Released subscription {} on {}", subscriber_id, channel);
        }))
    }

    async fn send_message(&self, text: &str, channel_id: &str) -> Result<(), TransportError> {
        self.backend
            .post(channel_id, text, &self.user.id, Some(self.user.profile()))
            .await
            .map(|_| ())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), TransportError> {
        self.backend.delete(message_id, &self.user.id).await
    }
}
