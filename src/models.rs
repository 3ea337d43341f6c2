use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TEMP_ID_PREFIX: &str = "temp-";
const AVATAR_FALLBACK: &str = "https://api.dicebear.com/7.x/notionists/svg?seed=";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Fresh id for a locally created message that the backend has not seen yet.
    pub fn temporary() -> Self {
        MessageId(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Fresh backend-assigned id.
    pub fn permanent() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId(id.to_string())
    }
}

/// Whether a message is still waiting for its echo from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    Optimistic,
    #[default]
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl SenderProfile {
    pub fn avatar(&self) -> String {
        self.avatar_url
            .clone()
            .unwrap_or_else(|| format!("{AVATAR_FALLBACK}{}", self.username))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderProfile>,
    #[serde(skip)]
    pub origin: Origin,
}

impl Message {
    pub fn optimistic(text: String, user: &LocalUser) -> Self {
        Message {
            id: MessageId::temporary(),
            text,
            sender_id: user.id.clone(),
            created_at: Utc::now(),
            sender: Some(user.profile()),
            origin: Origin::Optimistic,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == Origin::Optimistic
    }
}

/// The signed-in user of this client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        LocalUser {
            id: id.into(),
            username: username.into(),
            avatar_url: None,
        }
    }

    pub fn profile(&self) -> SenderProfile {
        SenderProfile {
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Topic,
    Direct,
    Event,
}

impl ChannelKind {
    pub fn of(channel_id: &str) -> Self {
        if channel_id.starts_with("dm-") {
            ChannelKind::Direct
        } else if channel_id.starts_with("event-") {
            ChannelKind::Event
        } else {
            ChannelKind::Topic
        }
    }

    /// Direct and event chats are joined by the user and can be left again.
    pub fn is_custom(self) -> bool {
        matches!(self, ChannelKind::Direct | ChannelKind::Event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub label: String,
}

impl Channel {
    pub fn new(id: &str, label: &str) -> Self {
        Channel {
            id: id.to_string(),
            label: label.to_string(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        ChannelKind::of(&self.id)
    }
}

pub fn default_channels() -> Vec<Channel> {
    vec![
        Channel::new("global", "Global"),
        Channel::new("study-help", "Study Help"),
        Channel::new("events", "Events"),
        Channel::new("random", "Random"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_unique_and_prefixed() {
        let a = MessageId::temporary();
        let b = MessageId::temporary();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("temp-"));
    }

    #[test]
    fn optimistic_message_carries_local_profile() {
        let user = LocalUser::new("u1", "riya");
        let msg = Message::optimistic("hi".to_string(), &user);
        assert!(msg.is_pending());
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.sender.as_ref().map(|s| s.username.as_str()), Some("riya"));
    }

    #[test]
    fn origin_is_not_on_the_wire() {
        let user = LocalUser::new("u1", "riya");
        let msg = Message::optimistic("hi".to_string(), &user);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("origin").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.origin, Origin::Confirmed);
    }

    #[test]
    fn channel_kinds_follow_prefix() {
        assert_eq!(ChannelKind::of("dm-abc"), ChannelKind::Direct);
        assert_eq!(ChannelKind::of("event-42"), ChannelKind::Event);
        assert_eq!(ChannelKind::of("global"), ChannelKind::Topic);
        assert!(ChannelKind::Event.is_custom());
        assert!(!ChannelKind::Topic.is_custom());
    }

    #[test]
    fn avatar_falls_back_to_generated_seed() {
        let profile = SenderProfile {
            username: "arjun".to_string(),
            avatar_url: None,
        };
        assert_eq!(
            profile.avatar(),
            "https://api.dicebear.com/7.x/notionists/svg?seed=arjun"
        );
    }
}
