use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageId, SenderProfile};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "hello")]
    Hello { user_id: String },
    #[serde(rename = "fetch_messages")]
    FetchMessages { request_id: u64, channel_id: String },
    #[serde(rename = "subscribe")]
    Subscribe { request_id: u64, channel_id: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channel_id: String },
    #[serde(rename = "send_message")]
    SendMessage {
        request_id: u64,
        channel_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<SenderProfile>,
    },
    #[serde(rename = "delete_message")]
    DeleteMessage { request_id: u64, message_id: MessageId },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "messages")]
    Messages { request_id: u64, messages: Vec<Message> },
    #[serde(rename = "ack")]
    Ack { request_id: u64 },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },
    #[serde(rename = "push")]
    Push { channel_id: String, message: Message },
}

impl ServerFrame {
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerFrame::Messages { request_id, .. } | ServerFrame::Ack { request_id } => Some(*request_id),
            ServerFrame::Error { request_id, .. } => *request_id,
            ServerFrame::Push { .. } => None,
        }
    }
}
