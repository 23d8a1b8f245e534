//! Conversation-related models

use serde::{Deserialize, Serialize};

use super::message::Message;

/// One row in the chat directory.
///
/// A temporary entry represents local intent-to-chat before any message has
/// durably landed on the server; it has no `conversation_id` yet and is keyed
/// by `peer_id` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: Option<String>,
    pub peer_id: String,
    pub peer_name: String,
    pub peer_avatar: Option<String>,
    pub online: bool,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    #[serde(default)]
    pub is_temporary: bool,
}

/// Minimal peer identity used to start a not-yet-persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub peer_name: String,
    pub peer_avatar: Option<String>,
}

impl ConversationSummary {
    /// Build a temporary directory entry for a peer we have not yet messaged.
    pub fn temporary(peer: PeerInfo) -> Self {
        Self {
            conversation_id: None,
            peer_id: peer.peer_id,
            peer_name: peer.peer_name,
            peer_avatar: peer.peer_avatar,
            online: false,
            last_message: None,
            unread_count: 0,
            is_temporary: true,
        }
    }
}
