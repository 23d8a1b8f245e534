//! Per-conversation timeline reconciliation.
//!
//! Three independent message sources feed one ordered, duplicate-free
//! timeline per conversation: paginated history, locally-originated
//! optimistic sends, and server-pushed live events. Ordering is ascending by
//! `created_at` with ties broken by insertion order; no two entries in one
//! conversation ever share a canonical id after reconciliation.

use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::models::{DeliveryState, LiveEvent, Message, MessageOrigin};

/// Payload placeholder carried by an image message while the asynchronous
/// upload collaborator is still running.
pub const IMAGE_UPLOADING_PLACEHOLDER: &str = "[uploading]";

/// How far apart an optimistic entry and its live echo may be (either
/// direction) and still be considered the same message. The server does not
/// echo a client correlation id, so matching is by sender, payload and
/// proximate time.
const RECONCILE_WINDOW_SECS: i64 = 60;

/// One message plus its local delivery state.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message: Message,
    pub delivery: DeliveryState,
}

/// Reconciles history pages, optimistic sends and live events into ordered
/// per-conversation timelines.
///
/// Mutated only from the single UI-facing execution context; methods hold no
/// internal locks and are safe to call reentrantly from event callbacks.
#[derive(Debug, Default)]
pub struct TimelineMerger {
    timelines: HashMap<String, Vec<TimelineEntry>>,
}

impl TimelineMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace the timeline for a conversation from a successful
    /// paginated history fetch. Entries are stored ascending by `created_at`
    /// and deduplicated by canonical id.
    pub fn merge(&mut self, conversation_id: &str, mut history: Vec<Message>) {
        history.sort_by_key(|m| m.created_at);

        let mut entries: Vec<TimelineEntry> = Vec::with_capacity(history.len());
        for mut message in history {
            if entries.iter().any(|e| e.message.id == message.id) {
                tracing::debug!(id = %message.id, "duplicate id in history page, skipping");
                continue;
            }
            message.origin = MessageOrigin::History;
            entries.push(TimelineEntry {
                message,
                delivery: DeliveryState::Confirmed,
            });
        }

        self.timelines.insert(conversation_id.to_string(), entries);
    }

    /// Insert a locally-originated message at the tail so the sender sees it
    /// before round-trip confirmation. Returns the temporary client key.
    pub fn append_optimistic(&mut self, conversation_id: &str, mut draft: Message) -> String {
        draft.origin = MessageOrigin::Optimistic;
        let key = draft.id.clone();

        self.timelines
            .entry(conversation_id.to_string())
            .or_default()
            .push(TimelineEntry {
                message: draft,
                delivery: DeliveryState::Pending,
            });
        key
    }

    /// Ingest a raw server-pushed event.
    ///
    /// Malformed payloads and non-message events are logged and dropped; the
    /// timeline is never affected and no error reaches the caller. When the
    /// event reconciles with an unconfirmed optimistic entry (same sender,
    /// matching payload, proximate timestamp) that entry is replaced in
    /// place; otherwise the message is inserted as new. An event for an
    /// unknown conversation starts a fresh timeline rather than being
    /// dropped.
    ///
    /// Returns a clone of the ingested message, or `None` when the event was
    /// dropped or was a duplicate of an already-known canonical id.
    pub fn ingest_live(&mut self, raw: &str) -> Option<Message> {
        let mut message = match decode_live_event(raw) {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed live event");
                return None;
            }
        };
        message.origin = MessageOrigin::Live;

        let entries = self
            .timelines
            .entry(message.conversation_id.clone())
            .or_default();

        if entries.iter().any(|e| e.message.id == message.id) {
            tracing::debug!(id = %message.id, "duplicate live event, already reconciled");
            return None;
        }

        let entry = TimelineEntry {
            message: message.clone(),
            delivery: DeliveryState::Confirmed,
        };

        if let Some(idx) = find_optimistic_match(entries, &message) {
            // Confirmed counterpart of a pending send: same position, now
            // bearing the canonical id.
            entries[idx] = entry;
        } else {
            insert_sorted(entries, entry);
        }

        Some(message)
    }

    /// Reconcile a pending optimistic entry with the canonical message
    /// returned by the send collaborator. The entry keeps its position.
    pub fn confirm_send(&mut self, conversation_id: &str, local_key: &str, mut canonical: Message) {
        canonical.origin = MessageOrigin::Live;

        let entries = self
            .timelines
            .entry(conversation_id.to_string())
            .or_default();

        if entries.iter().any(|e| e.message.id == canonical.id) {
            // Live echo won the race; drop the stale optimistic entry.
            entries.retain(|e| e.message.id != local_key);
            return;
        }

        let entry = TimelineEntry {
            message: canonical,
            delivery: DeliveryState::Confirmed,
        };
        match entries.iter().position(|e| e.message.id == local_key) {
            Some(idx) => entries[idx] = entry,
            // Timeline was replaced by a history merge in the meantime.
            None => insert_sorted(entries, entry),
        }
    }

    /// Mark a pending optimistic entry failed. The entry stays visible so the
    /// caller can surface a retry affordance; no automatic retry happens.
    pub fn mark_failed(&mut self, conversation_id: &str, local_key: &str) -> bool {
        self.set_delivery(conversation_id, local_key, DeliveryState::Failed)
    }

    /// Return a failed entry to the pending state ahead of a caller-driven
    /// resend.
    pub fn mark_pending(&mut self, conversation_id: &str, local_key: &str) -> bool {
        self.set_delivery(conversation_id, local_key, DeliveryState::Pending)
    }

    fn set_delivery(&mut self, conversation_id: &str, key: &str, delivery: DeliveryState) -> bool {
        match self
            .timelines
            .get_mut(conversation_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.message.id == key))
        {
            Some(entry) => {
                entry.delivery = delivery;
                true
            }
            None => false,
        }
    }

    /// Swap an image message's uploading placeholder for the resolved remote
    /// location, in place.
    pub fn resolve_image_upload(
        &mut self,
        conversation_id: &str,
        key: &str,
        remote_location: &str,
    ) -> bool {
        match self
            .timelines
            .get_mut(conversation_id)
            .and_then(|entries| entries.iter_mut().find(|e| e.message.id == key))
        {
            Some(entry) => {
                entry.message.payload = remote_location.to_string();
                true
            }
            None => false,
        }
    }

    /// The accumulated timeline for a conversation, oldest first.
    pub fn timeline(&self, conversation_id: &str) -> &[TimelineEntry] {
        self.timelines
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Clone of one entry's message, looked up by canonical id or local key.
    pub fn message(&self, conversation_id: &str, key: &str) -> Option<Message> {
        self.timelines
            .get(conversation_id)?
            .iter()
            .find(|e| e.message.id == key)
            .map(|e| e.message.clone())
    }

    /// Newest message in a conversation, for directory previews.
    pub fn last_message(&self, conversation_id: &str) -> Option<&Message> {
        self.timelines
            .get(conversation_id)?
            .last()
            .map(|e| &e.message)
    }

    /// Whether a conversation has an accumulated timeline (kept across view
    /// changes for fast re-open).
    pub fn has_timeline(&self, conversation_id: &str) -> bool {
        self.timelines
            .get(conversation_id)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Drop every in-memory timeline. Called when the whole session ends.
    pub fn clear_all(&mut self) {
        self.timelines.clear();
    }
}

/// Decode a raw transport frame. `Ok(None)` for well-formed non-message
/// events (presence, ping echoes), which the merger ignores.
fn decode_live_event(raw: &str) -> std::result::Result<Option<Message>, ProtocolError> {
    let event: LiveEvent = serde_json::from_str(raw)?;
    if event.event != "message" {
        tracing::debug!(event = %event.event, "ignoring non-message event");
        return Ok(None);
    }
    event.message.ok_or(ProtocolError::MissingMessage).map(Some)
}

/// Index of a pending optimistic entry the live `message` confirms, if any.
fn find_optimistic_match(entries: &[TimelineEntry], message: &Message) -> Option<usize> {
    entries.iter().position(|e| {
        e.delivery == DeliveryState::Pending
            && e.message.origin == MessageOrigin::Optimistic
            && e.message.sender_id == message.sender_id
            && e.message.payload == message.payload
            && (message.created_at - e.message.created_at)
                .num_seconds()
                .abs()
                <= RECONCILE_WINDOW_SECS
    })
}

/// Insert keeping ascending `created_at`, after any entry with an equal
/// timestamp (ties break by insertion order).
fn insert_sorted(entries: &mut Vec<TimelineEntry>, entry: TimelineEntry) {
    let pos = entries.partition_point(|e| e.message.created_at <= entry.message.created_at);
    entries.insert(pos, entry);
}
