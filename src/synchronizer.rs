//! Optimistic message list for the active chat channel.
//!
//! All state lives in [`MessageSynchronizer`] and is only touched from its
//! `&mut self` methods. Transport calls run in spawned tasks and report back
//! through an internal event queue, which the owner drains with
//! [`MessageSynchronizer::process_next`] or
//! [`MessageSynchronizer::process_pending`]. Every event is stamped with the
//! load generation it was issued under, so results for a channel the user
//! already left never reach the current list.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::models::{LocalUser, Message, MessageId, Origin};
use crate::transport::{ChannelTransport, Subscription};

/// User-visible cue raised by the synchronizer.
#[derive(Debug)]
pub enum Notification {
    /// An optimistic message was appended.
    Sent(MessageId),
    /// A message from someone else arrived on the active channel.
    Received(Message),
    /// The optimistic message was rolled back.
    ///
    /// Also raised when the send call times out after its echo already
    /// confirmed the message; the confirmed entry then stays in the list.
    DeliveryFailed {
        id: MessageId,
        text: String,
        error: SyncError,
    },
    /// The message stays removed locally.
    DeleteFailed { id: MessageId, error: SyncError },
    LoadFailed { channel_id: String, error: SyncError },
}

impl Notification {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Notification::DeliveryFailed { .. }
                | Notification::DeleteFailed { .. }
                | Notification::LoadFailed { .. }
        )
    }

    /// Short text for a toast.
    pub fn summary(&self) -> String {
        match self {
            Notification::Sent(_) => "Message sent".to_string(),
            Notification::Received(message) => match &message.sender {
                Some(sender) => format!("New message from {}", sender.username),
                None => "New message".to_string(),
            },
            Notification::DeliveryFailed { .. } => "Failed to deliver".to_string(),
            Notification::DeleteFailed { .. } => "Failed to delete message".to_string(),
            Notification::LoadFailed { channel_id, .. } => format!("Could not load {channel_id}"),
        }
    }
}

enum Event {
    Subscribed {
        generation: u64,
        subscription: Subscription,
    },
    SubscribeFailed {
        generation: u64,
        error: TransportError,
    },
    Loaded {
        generation: u64,
        result: Result<Vec<Message>, TransportError>,
    },
    SendFailed {
        generation: u64,
        id: MessageId,
        text: String,
        error: TransportError,
    },
    DeleteFailed {
        id: MessageId,
        error: TransportError,
    },
}

pub struct MessageSynchronizer<T: ChannelTransport + ?Sized> {
    transport: Arc<T>,
    user: LocalUser,
    config: SyncConfig,
    channel_id: Option<String>,
    generation: u64,
    loading: bool,
    loading_since: DateTime<Utc>,
    messages: Vec<Message>,
    subscription: Option<Subscription>,
    channel_task: Option<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<T: ChannelTransport + ?Sized> MessageSynchronizer<T> {
    pub fn new(
        transport: Arc<T>,
        user: LocalUser,
        config: SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications, notifications_rx) = mpsc::unbounded_channel();

        let sync = MessageSynchronizer {
            transport,
            user,
            config,
            channel_id: None,
            generation: 0,
            loading: false,
            loading_since: Utc::now(),
            messages: Vec::new(),
            subscription: None,
            channel_task: None,
            events_tx,
            events_rx,
            notifications,
        };
        (sync, notifications_rx)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.user
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Switches to `channel_id`, dropping the current list and subscription.
    ///
    /// The new channel is subscribed before its history is fetched, so pushes
    /// racing the fetch wait in the subscription and are merged once the
    /// history is in place.
    pub fn load(&mut self, channel_id: impl Into<String>) {
        let channel_id = channel_id.into();
        self.release_channel();

        self.generation += 1;
        self.channel_id = Some(channel_id.clone());
        self.loading = true;
        self.loading_since = Utc::now();
        self.messages.clear();
        info!("Loading channel {} (generation {})", channel_id, self.generation);

        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let limit = self.config.request_timeout;

        self.channel_task = Some(tokio::spawn(async move {
            match within(limit, transport.subscribe(&channel_id)).await {
                Ok(subscription) => {
                    let _ = events.send(Event::Subscribed {
                        generation,
                        subscription,
                    });
                }
                Err(error) => {
                    let _ = events.send(Event::SubscribeFailed { generation, error });
                }
            }

            let result = within(limit, transport.fetch_messages(&channel_id)).await;
            let _ = events.send(Event::Loaded { generation, result });
        }));
    }

    pub fn reload(&mut self) {
        if let Some(channel_id) = self.channel_id.clone() {
            self.load(channel_id);
        }
    }

    /// Appends an optimistic message right away and delivers it in the background.
    ///
    /// Blank text is ignored. Returns the temporary id of the new entry.
    pub fn send(&mut self, text: &str) -> Option<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let Some(channel_id) = self.channel_id.clone() else {
            warn!("Dropping send with no active channel");
            return None;
        };

        let message = Message::optimistic(text.to_string(), &self.user);
        let id = message.id.clone();
        self.messages.push(message);
        self.notify(Notification::Sent(id.clone()));
        debug!("Queued optimistic message {} on {}", id, channel_id);

        let generation = self.generation;
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let limit = self.config.request_timeout;
        let text = text.to_string();
        let pending_id = id.clone();

        tokio::spawn(async move {
            match within(limit, transport.send_message(&text, &channel_id)).await {
                // The echo on the subscription confirms the message.
                Ok(()) => debug!("Backend accepted {}", pending_id),
                Err(error) => {
                    let _ = events.send(Event::SendFailed {
                        generation,
                        id: pending_id,
                        text,
                        error,
                    });
                }
            }
        });

        Some(id)
    }

    /// Sends the contents of an input buffer, clearing it when it was sendable.
    pub fn submit(&mut self, input: &mut String) -> Option<MessageId> {
        if input.trim().is_empty() {
            return None;
        }
        let text = std::mem::take(input);
        self.send(&text)
    }

    /// Merges a message pushed by the backend.
    ///
    /// Exact id matches are dropped, then the first pending message with the
    /// same author and text is replaced in place, otherwise the message is
    /// appended.
    pub fn apply_push(&mut self, mut message: Message) {
        message.origin = Origin::Confirmed;

        if self.messages.iter().any(|m| m.id == message.id) {
            debug!("Ignoring duplicate delivery of {}", message.id);
            return;
        }

        if let Some(slot) = self
            .messages
            .iter_mut()
            .find(|m| m.is_pending() && m.sender_id == message.sender_id && m.text == message.text)
        {
            debug!("Confirmed {} as {}", slot.id, message.id);
            *slot = message;
            return;
        }

        let from_other = message.sender_id != self.user.id;
        self.messages.push(message.clone());
        if from_other {
            self.notify(Notification::Received(message));
        }
    }

    /// Removes one of the local user's confirmed messages and deletes it remotely.
    ///
    /// A failed remote delete is reported but the message is not restored.
    pub fn delete(&mut self, id: &MessageId) -> Result<(), SyncError> {
        if self.channel_id.is_none() {
            return Err(SyncError::NoActiveChannel);
        }
        let index = self
            .messages
            .iter()
            .position(|m| &m.id == id)
            .ok_or_else(|| SyncError::UnknownMessage(id.clone()))?;

        let message = &self.messages[index];
        if message.sender_id != self.user.id {
            return Err(SyncError::NotAuthor(id.clone()));
        }
        if message.is_pending() {
            return Err(SyncError::PendingMessage(id.clone()));
        }

        self.messages.remove(index);
        debug!("Removed {} locally", id);

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let limit = self.config.request_timeout;
        let id = id.clone();

        tokio::spawn(async move {
            if let Err(error) = within(limit, transport.delete_message(&id)).await {
                let _ = events.send(Event::DeleteFailed { id, error });
            }
        });
        Ok(())
    }

    /// Waits for the next transport result or pushed message and applies it.
    ///
    /// Pushes are held back while the channel history is loading.
    pub async fn process_next(&mut self) {
        let live = !self.loading && self.subscription.is_some();

        tokio::select! {
            biased;
            event = self.events_rx.recv() => {
                if let Some(event) = event {
                    self.apply(event);
                }
            }
            pushed = next_push(&mut self.subscription), if live => match pushed {
                Some(message) => self.apply_push(message),
                None => self.on_stream_end(),
            },
        }
    }

    /// Applies everything that is already available without waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            if let Ok(event) = self.events_rx.try_recv() {
                self.apply(event);
                applied += 1;
                continue;
            }
            if self.loading {
                break;
            }
            match self.subscription.as_mut().and_then(Subscription::try_recv) {
                Some(message) => {
                    self.apply_push(message);
                    applied += 1;
                }
                None => break,
            }
        }
        applied
    }

    /// Leaves the active channel and releases its subscription.
    pub fn close(&mut self) {
        self.release_channel();
        self.generation += 1;
        self.channel_id = None;
        self.loading = false;
        self.messages.clear();
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Subscribed {
                generation,
                subscription,
            } => {
                if generation == self.generation {
                    debug!("Subscribed to {}", subscription.channel_id());
                    self.subscription = Some(subscription);
                } else {
                    debug!("Closing stale subscription to {}", subscription.channel_id());
                }
            }
            Event::SubscribeFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                warn!("Subscription failed: {}", error);
                let channel_id = self.channel_id.clone().unwrap_or_default();
                self.notify(Notification::LoadFailed {
                    channel_id,
                    error: SyncError::Subscription(error),
                });
            }
            Event::Loaded { generation, result } => {
                if generation != self.generation {
                    debug!("Discarding stale history for generation {}", generation);
                    return;
                }
                self.loading = false;
                match result {
                    Ok(batch) => self.install_history(batch),
                    Err(error) => {
                        warn!("Chat history failed to load: {}", error);
                        self.install_history(Vec::new());
                        let channel_id = self.channel_id.clone().unwrap_or_default();
                        self.notify(Notification::LoadFailed {
                            channel_id,
                            error: SyncError::Fetch(error),
                        });
                    }
                }
            }
            Event::SendFailed {
                generation,
                id,
                text,
                error,
            } => {
                warn!("Failed to deliver {}: {}", id, error);
                if generation == self.generation {
                    self.messages.retain(|m| m.id != id);
                }
                self.notify(Notification::DeliveryFailed {
                    id,
                    text,
                    error: SyncError::Send(error),
                });
            }
            Event::DeleteFailed { id, error } => {
                warn!("Failed to delete {}: {}", id, error);
                self.notify(Notification::DeleteFailed {
                    id,
                    error: SyncError::Delete(error),
                });
            }
        }
    }

    /// Replaces the list with fetched history, keeping messages sent while loading.
    ///
    /// A message sent during the load whose echo is already part of the
    /// history is settled against that copy rather than kept twice.
    fn install_history(&mut self, batch: Vec<Message>) {
        let pending: Vec<Message> = self.messages.drain(..).filter(Message::is_pending).collect();

        let mut seen = HashSet::new();
        self.messages = batch
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .map(|mut m| {
                m.origin = Origin::Confirmed;
                m
            })
            .collect();

        // Batch entries created since the load began may be echoes of sends
        // whose push was never delivered to this subscription.
        let since = self.loading_since;
        let mut settled = HashSet::new();
        for message in pending {
            let echo = self.messages.iter().find(|m| {
                m.created_at >= since
                    && !settled.contains(&m.id)
                    && m.sender_id == message.sender_id
                    && m.text == message.text
            });
            match echo {
                Some(echo) => {
                    debug!("Confirmed {} as {} from history", message.id, echo.id);
                    settled.insert(echo.id.clone());
                }
                None => self.messages.push(message),
            }
        }
        seen.retain(|id| !settled.contains(id));

        info!(
            "Loaded {} messages for {}",
            self.messages.len(),
            self.channel_id.as_deref().unwrap_or_default()
        );
        self.replay_held_pushes(&seen);
    }

    /// Merges pushes that queued up in the subscription while loading.
    ///
    /// A held push for a message the history already holds is the echo of a
    /// send made during the load, so it confirms the matching pending entry.
    fn replay_held_pushes(&mut self, history: &HashSet<MessageId>) {
        while let Some(message) = self.subscription.as_mut().and_then(Subscription::try_recv) {
            if history.contains(&message.id) {
                self.settle_pending_copy(&message);
            }
            self.apply_push(message);
        }
    }

    fn settle_pending_copy(&mut self, confirmed: &Message) {
        let copy = self
            .messages
            .iter()
            .position(|m| m.is_pending() && m.sender_id == confirmed.sender_id && m.text == confirmed.text);
        if let Some(index) = copy {
            let pending = self.messages.remove(index);
            debug!("Confirmed {} as {} from history", pending.id, confirmed.id);
        }
    }

    fn on_stream_end(&mut self) {
        self.subscription = None;
        let channel_id = self.channel_id.clone().unwrap_or_default();
        warn!("Push stream for {} ended", channel_id);
        self.notify(Notification::LoadFailed {
            channel_id,
            error: SyncError::Subscription(TransportError::Closed),
        });
    }

    fn release_channel(&mut self) {
        if let Some(task) = self.channel_task.take() {
            task.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            debug!("Closing subscription to {}", subscription.channel_id());
            subscription.close();
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }
}

impl<T: ChannelTransport + ?Sized> Drop for MessageSynchronizer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.channel_task.take() {
            task.abort();
        }
    }
}

async fn within<R>(
    limit: Duration,
    call: impl Future<Output = Result<R, TransportError>>,
) -> Result<R, TransportError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn next_push(subscription: &mut Option<Subscription>) -> Option<Message> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
