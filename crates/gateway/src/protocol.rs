//! Wire formats.
//!
//! Two JSON shapes cross process boundaries:
//! - [`Message`]: what clients send and receive over the WebSocket
//! - [`Event`]: what instances publish to the log, one per recipient

use serde::{Deserialize, Serialize};

/// Identity of a connected endpoint (a user).
pub type RecipientId = i64;

/// Identity of a conversation.
pub type ChannelId = i64;

/// `Type` of a result/acknowledgment message.
pub const TYPE_RESULT: &str = "Result";

/// `Content` of a negative acknowledgment.
pub const CONTENT_FAILED: &str = "Failed";

// ============================================================================
// Client ↔ Server
// ============================================================================

/// Message exchanged with clients.
///
/// Field names are part of the client contract and stay capitalized on the
/// wire. Missing fields decode to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Backend-assigned id, used when quoting or forwarding.
    #[serde(rename = "Id")]
    pub id: i64,
    /// Client-side sequence token, unique per connection only.
    /// Echoed back in acknowledgments so the client can correlate.
    #[serde(rename = "Seq")]
    pub seq: String,
    /// Payload kind: text, video, Result, ...
    #[serde(rename = "Type")]
    pub kind: String,
    /// Text, or a resource key for media kinds.
    #[serde(rename = "Content")]
    pub content: String,
    /// Conversation id (not the direct recipient).
    #[serde(rename = "Cid")]
    pub cid: ChannelId,
}

impl Message {
    /// Negative acknowledgment for the message carrying `seq`.
    pub fn nack(seq: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            kind: TYPE_RESULT.to_string(),
            content: CONTENT_FAILED.to_string(),
            ..Default::default()
        }
    }

    /// Whether this is a negative acknowledgment.
    pub fn is_nack(&self) -> bool {
        self.kind == TYPE_RESULT && self.content == CONTENT_FAILED
    }
}

// ============================================================================
// Instance ↔ Log
// ============================================================================

/// One message addressed to one recipient. Published to the log keyed by
/// `receiver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "Receiver")]
    pub receiver: RecipientId,
    #[serde(rename = "Msg")]
    pub msg: Message,
}

impl Event {
    /// Partition key for this event.
    pub fn key(&self) -> String {
        self.receiver.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_field_names() {
        let msg = Message {
            id: 7,
            seq: "s1".to_string(),
            kind: "text".to_string(),
            content: "hi".to_string(),
            cid: 42,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Id": 7, "Seq": "s1", "Type": "text", "Content": "hi", "Cid": 42})
        );
    }

    #[test]
    fn test_message_missing_fields_default() {
        let msg: Message = serde_json::from_str(r#"{"Seq":"a","Content":"x"}"#).unwrap();
        assert_eq!(msg.seq, "a");
        assert_eq!(msg.id, 0);
        assert_eq!(msg.cid, 0);
        assert!(msg.kind.is_empty());
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(serde_json::from_str::<Message>("not json").is_err());
        assert!(serde_json::from_str::<Message>(r#"{"Cid":"forty-two"}"#).is_err());
    }

    #[test]
    fn test_nack_echoes_seq() {
        let nack = Message::nack("s9");
        assert_eq!(nack.seq, "s9");
        assert_eq!(nack.kind, "Result");
        assert_eq!(nack.content, "Failed");
        assert!(nack.is_nack());
        assert!(!Message::default().is_nack());
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event {
            receiver: 3,
            msg: Message::nack("s"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["Receiver"], 3);
        assert_eq!(json["Msg"]["Seq"], "s");
        assert_eq!(event.key(), "3");
    }
}
