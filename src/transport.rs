use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::models::{Message, MessageId};

/// Backend seam consumed by the synchronizer.
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    async fn fetch_messages(&self, channel_id: &str) -> Result<Vec<Message>, TransportError>;

    async fn subscribe(&self, channel_id: &str) -> Result<Subscription, TransportError>;

    async fn send_message(&self, text: &str, channel_id: &str) -> Result<(), TransportError>;

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), TransportError>;
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Open push stream for one channel. Dropping it closes it.
pub struct Subscription {
    channel_id: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    on_close: Option<CloseHook>,
}

impl Subscription {
    pub fn new(
        channel_id: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Message>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Subscription {
            channel_id: channel_id.into(),
            receiver,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Next pushed message, or `None` once the backend side has gone away.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Already-delivered message, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(hook) = self.on_close.take() {
            self.receiver.close();
            hook();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
