use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, RwLock};

use crate::models::{Message, MessageId};

/// Server-side log of one channel plus the push senders of its subscribers.
#[derive(Clone)]
pub struct ChannelLog {
    pub id: String,
    messages: Arc<RwLock<Vec<Message>>>,
    subscribers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>, // subscriber_id -> push sender
}

impl ChannelLog {
    pub fn new(id: String) -> Self {
        ChannelLog {
            id,
            messages: Arc::new(RwLock::new(Vec::new())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_subscriber(&self, subscriber_id: String, sender: mpsc::UnboundedSender<Message>) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(subscriber_id, sender);
    }

    pub async fn remove_subscriber(&self, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(subscriber_id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }

    /// Appends `message` and pushes it to every subscriber, the author included.
    pub async fn append(&self, message: Message) {
        {
            let mut messages = self.messages.write().await;
            messages.push(message.clone());
        }

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|subscriber_id, sender| {
            let open = sender.send(message.clone()).is_ok();
            if !open {
                debug!("Dropping closed subscriber {} on {}", subscriber_id, self.id);
            }
            open
        });
    }

    pub async fn find(&self, message_id: &MessageId) -> Option<Message> {
        let messages = self.messages.read().await;
        messages.iter().find(|m| &m.id == message_id).cloned()
    }

    pub async fn remove(&self, message_id: &MessageId) -> bool {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| &m.id != message_id);
        messages.len() != before
    }
}
