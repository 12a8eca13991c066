// Message types: what the application hands us and what we hand back

use crate::{unix_now, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured message content (a JSON object)
pub type Content = Map<String, Value>;

/// An application message.
///
/// `receiver_id == None` makes it a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub content: Option<Content>,
    /// Opaque bytes carried after the content
    pub data: Option<Vec<u8>>,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Remaining hops, broadcasts only
    pub ttl: u8,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_none()
    }

    /// Look up a string field of the content.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.content.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Default)]
pub struct MessageBuilder {
    receiver_id: Option<UserId>,
    content: Option<Content>,
    data: Option<Vec<u8>>,
}

impl MessageBuilder {
    pub fn receiver(mut self, receiver_id: UserId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    pub fn content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    /// Add one content field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.content
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Fresh random id and current timestamp. The sender is filled in when
    /// the message is sent.
    pub fn build(self) -> Message {
        Message {
            id: rand::random(),
            sender_id: 0,
            receiver_id: self.receiver_id,
            content: self.content,
            data: self.data,
            timestamp: unix_now(),
            ttl: 0,
        }
    }
}

/// JSON header preceding the binary data in a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct WireHeader {
    pub msg_id: MessageId,
    #[serde(default)]
    pub payload: Option<Content>,
    #[serde(default)]
    pub recipient: Option<UserId>,
    pub sender: UserId,
    pub timestamp: u64,
    #[serde(default)]
    pub has_data: bool,
}

impl WireHeader {
    pub fn from_message(message: &Message) -> Self {
        Self {
            msg_id: message.id,
            payload: message.content.clone(),
            recipient: message.receiver_id,
            sender: message.sender_id,
            timestamp: message.timestamp,
            has_data: message.data.is_some(),
        }
    }

    pub fn into_message(self, data: Vec<u8>) -> Message {
        Message {
            id: self.msg_id,
            sender_id: self.sender,
            receiver_id: self.recipient,
            content: self.payload,
            data: if self.has_data { Some(data) } else { None },
            timestamp: self.timestamp,
            ttl: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let message = Message::builder()
            .receiver(20)
            .field("text", "hi")
            .data(vec![1, 2, 3])
            .build();
        assert_eq!(message.receiver_id, Some(20));
        assert_eq!(message.text("text"), Some("hi"));
        assert_eq!(message.data.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(!message.is_broadcast());
        assert!(message.timestamp > 0);
    }

    #[test]
    fn test_wire_header_field_names() {
        let message = Message::builder().field("text", "hi").build();
        let value = serde_json::to_value(WireHeader::from_message(&message)).unwrap();
        for field in ["msg_id", "payload", "recipient", "sender", "timestamp", "has_data"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert!(value.get("ttl").is_none());
        assert_eq!(value["recipient"], Value::Null);
    }

    #[test]
    fn test_has_data_controls_data() {
        let header = WireHeader {
            msg_id: 1,
            payload: None,
            recipient: None,
            sender: 2,
            timestamp: 3,
            has_data: false,
        };
        assert!(header.into_message(vec![]).data.is_none());
    }
}
