use thiserror::Error;

use crate::crypto::CryptoError;
use crate::models::MessageId;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,
    #[error("Connection closed")]
    Closed,
    #[error("Rejected by backend: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures of synchronizer operations. None of them are fatal to the caller.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to load messages: {0}")]
    Fetch(#[source] TransportError),
    #[error("Failed to deliver message: {0}")]
    Send(#[source] TransportError),
    #[error("Failed to delete message: {0}")]
    Delete(#[source] TransportError),
    #[error("Failed to subscribe: {0}")]
    Subscription(#[source] TransportError),
    #[error("No message with id {0}")]
    UnknownMessage(MessageId),
    #[error("Message {0} belongs to another user")]
    NotAuthor(MessageId),
    #[error("Message {0} has not been confirmed yet")]
    PendingMessage(MessageId),
    #[error("No channel is loaded")]
    NoActiveChannel,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("Missing required setting {0}")]
    Missing(&'static str),
}
