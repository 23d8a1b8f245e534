//! Conversation directory: server-fetched summaries plus local
//! not-yet-persisted entries.
//!
//! A temporary entry records intent to chat with a peer before any message
//! has durably landed on the server. It is keyed by peer id (no conversation
//! id exists yet) and is superseded by the server-backed entry on the first
//! directory refresh after promotion.

use crate::models::{ConversationSummary, Message, PeerInfo};

#[derive(Debug, Default)]
pub struct ChatDirectory {
    /// Last server-fetched summaries, in server order.
    server: Vec<ConversationSummary>,
    /// Local intent-to-chat entries, oldest first.
    local: Vec<ConversationSummary>,
}

impl ChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the server-backed summaries with a fresh directory fetch.
    ///
    /// Promoted local entries now covered by the server list are dropped, so
    /// exactly one entry per peer remains.
    pub fn refresh(&mut self, summaries: Vec<ConversationSummary>) {
        self.local.retain(|local| {
            local.is_temporary || !summaries.iter().any(|s| s.peer_id == local.peer_id)
        });
        self.server = summaries;
    }

    /// Union of server summaries and local entries not already represented
    /// (matched by peer id). Local entries sort first, most recent intent
    /// foremost.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .local
            .iter()
            .rev()
            .filter(|local| !self.server.iter().any(|s| s.peer_id == local.peer_id))
            .cloned()
            .collect();
        out.extend(self.server.iter().cloned());
        out
    }

    /// Record intent to chat with a peer. Idempotent by peer id: returns the
    /// existing entry when one is already present.
    pub fn add_temporary(&mut self, peer: PeerInfo) -> ConversationSummary {
        if let Some(existing) = self.local.iter().find(|l| l.peer_id == peer.peer_id) {
            return existing.clone();
        }
        let entry = ConversationSummary::temporary(peer);
        self.local.push(entry.clone());
        entry
    }

    /// Clear the temporary flag once a message for this peer has durably
    /// landed server-side; the next [`refresh`](Self::refresh) that includes
    /// the peer supersedes the local entry.
    pub fn promote(&mut self, peer_id: &str) -> bool {
        match self.local.iter_mut().find(|l| l.peer_id == peer_id) {
            Some(entry) => {
                entry.is_temporary = false;
                true
            }
            None => false,
        }
    }

    /// Case-insensitive substring match over display name and identifier.
    /// Pure; no side effects.
    pub fn filter(&self, search_term: &str) -> Vec<ConversationSummary> {
        let needle = search_term.to_lowercase();
        self.list()
            .into_iter()
            .filter(|s| {
                s.peer_name.to_lowercase().contains(&needle)
                    || s.peer_id.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// Update the last-message preview (and unread count for inbound
    /// messages) from merger output.
    pub fn note_message(&mut self, message: &Message, inbound: bool) {
        let entry = match self
            .server
            .iter_mut()
            .find(|s| s.conversation_id.as_deref() == Some(message.conversation_id.as_str()))
        {
            Some(entry) => entry,
            None => {
                // Not server-backed yet; fall back to the local entry for
                // the peer on the other end.
                let peer = if inbound {
                    &message.sender_id
                } else {
                    &message.recipient_id
                };
                match self.local.iter_mut().find(|l| &l.peer_id == peer) {
                    Some(entry) => entry,
                    None => return,
                }
            }
        };

        entry.last_message = Some(message.clone());
        if inbound {
            entry.unread_count += 1;
        }
    }

    /// Zero the unread counter when the conversation view gains focus.
    pub fn mark_read(&mut self, conversation_id: &str) {
        if let Some(entry) = self
            .server
            .iter_mut()
            .find(|s| s.conversation_id.as_deref() == Some(conversation_id))
        {
            entry.unread_count = 0;
        }
    }
}
