//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Text,
    Image,
    /// Text announcing a locally captured clip; the payload embeds an
    /// `[audio:<id>]` marker instead of inline audio bytes.
    AudioRef,
}

/// Which of the three message sources produced a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageOrigin {
    History,
    Optimistic,
    Live,
}

impl Default for MessageOrigin {
    fn default() -> Self {
        MessageOrigin::History
    }
}

/// Delivery state of a timeline entry. Only locally-originated entries are
/// ever `Pending` or `Failed`; a failed send keeps its entry visible so the
/// caller can surface a retry affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Confirmed,
    Pending,
    Failed,
}

/// A chat message as it appears on one conversation timeline.
///
/// `id` is the canonical server-assigned identifier once known; before server
/// confirmation an optimistic entry carries a client-generated temporary key
/// in the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub kind: MessageKind,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// Not part of the wire format; defaults to `History` when deserialized
    /// from a fetch and is overwritten by the merger on ingest.
    #[serde(default, skip_serializing)]
    pub origin: MessageOrigin,
}

impl Message {
    /// Build a locally-originated message carrying a temporary client key.
    pub fn new_local(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            kind,
            payload: payload.into(),
            created_at: Utc::now(),
            origin: MessageOrigin::Optimistic,
        }
    }
}

/// Envelope for server-pushed events on the duplex channel.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    pub event: String,
    pub message: Option<Message>,
}

/// Embed an audio clip reference into a message payload.
pub fn audio_marker(clip_id: &str) -> String {
    format!("[audio:{}]", clip_id)
}

/// Extract the clip id from an embedded audio reference marker, if present.
pub fn parse_audio_marker(payload: &str) -> Option<&str> {
    let start = payload.find("[audio:")?;
    let rest = &payload[start + "[audio:".len()..];
    let end = rest.find(']')?;
    let id = &rest[..end];
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_marker_round_trip() {
        let marker = audio_marker("1700000000000-deadbeef");
        assert_eq!(parse_audio_marker(&marker), Some("1700000000000-deadbeef"));
    }

    #[test]
    fn audio_marker_embedded_in_text() {
        let payload = format!("voice note {}", audio_marker("abc"));
        assert_eq!(parse_audio_marker(&payload), Some("abc"));
    }

    #[test]
    fn audio_marker_absent_or_empty() {
        assert_eq!(parse_audio_marker("plain text"), None);
        assert_eq!(parse_audio_marker("[audio:]"), None);
        assert_eq!(parse_audio_marker("[audio:unterminated"), None);
    }

    #[test]
    fn wire_origin_defaults_to_history() {
        let json = r#"{
            "id": "42",
            "conversationId": "c1",
            "senderId": "alice",
            "recipientId": "bob",
            "kind": "text",
            "payload": "hi",
            "createdAt": "2026-01-01T00:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.origin, MessageOrigin::History);
    }
}
