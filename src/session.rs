//! Session orchestration: wires the connection, merger and directory to the
//! application's network collaborators.
//!
//! All methods run on the single UI-facing execution context. Leaving a
//! conversation view keeps its accumulated timeline for fast re-open; ending
//! the session closes the connection and clears every in-memory timeline.

use std::collections::HashMap;

use crate::connection::transport::Connector;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::directory::ChatDirectory;
use crate::error::{ChatError, Result};
use crate::models::{audio_marker, Message, MessageKind};
use crate::remote::{DirectoryFetch, HistoryFetch, ImageUpload, MessageSend};
use crate::timeline::{TimelineMerger, IMAGE_UPLOADING_PLACEHOLDER};

use tokio::sync::broadcast;

pub struct ChatSession<C, H, S, U, D>
where
    C: Connector,
    H: HistoryFetch,
    S: MessageSend,
    U: ImageUpload,
    D: DirectoryFetch,
{
    pub connection: ConnectionManager<C>,
    pub merger: TimelineMerger,
    pub directory: ChatDirectory,
    history: H,
    sender: S,
    uploader: U,
    directory_fetch: D,
    events: broadcast::Receiver<ConnectionEvent>,
    /// Image bytes for entries whose upload failed, keyed by timeline entry,
    /// so a retry can upload again before the durable write.
    pending_uploads: HashMap<String, Vec<u8>>,
    self_id: String,
}

impl<C, H, S, U, D> ChatSession<C, H, S, U, D>
where
    C: Connector,
    H: HistoryFetch,
    S: MessageSend,
    U: ImageUpload,
    D: DirectoryFetch,
{
    pub fn new(
        connection: ConnectionManager<C>,
        history: H,
        sender: S,
        uploader: U,
        directory_fetch: D,
        self_id: impl Into<String>,
    ) -> Self {
        let events = connection.subscribe();
        Self {
            connection,
            merger: TimelineMerger::new(),
            directory: ChatDirectory::new(),
            history,
            sender,
            uploader,
            directory_fetch,
            events,
            pending_uploads: HashMap::new(),
            self_id: self_id.into(),
        }
    }

    /// Begin the persistent connection.
    pub fn connect(&self, auth_token: &str) {
        self.connection.open(auth_token);
    }

    /// Receive and apply the next connection event. Raw message frames are
    /// routed into the merger and reflected in the directory preview.
    /// Returns `None` once the event channel is gone.
    pub async fn pump_event(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if let ConnectionEvent::Message(raw) = &event {
                        if let Some(message) = self.merger.ingest_live(raw) {
                            let inbound = message.sender_id != self.self_id;
                            self.directory.note_message(&message, inbound);
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event consumer lagged behind connection");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Open a conversation view. Fetches one history page on first open;
    /// re-opens reuse the timeline kept in memory.
    pub async fn open_conversation(&mut self, conversation_id: &str) -> Result<()> {
        if self.merger.has_timeline(conversation_id) {
            self.directory.mark_read(conversation_id);
            return Ok(());
        }
        let page = self.history.fetch_history(conversation_id).await?;
        self.merger.merge(conversation_id, page);
        self.directory.mark_read(conversation_id);
        Ok(())
    }

    /// Send a text message: optimistic append, durable write, reconciliation.
    /// On failure the entry stays visible with a failed marker and the error
    /// is surfaced; no automatic retry.
    pub async fn send_text(
        &mut self,
        conversation_id: &str,
        recipient_id: &str,
        text: impl Into<String>,
    ) -> Result<String> {
        let draft = Message::new_local(
            conversation_id,
            self.self_id.clone(),
            recipient_id,
            MessageKind::Text,
            text,
        );
        self.dispatch(draft).await
    }

    /// Send a text message announcing a locally captured audio clip; the
    /// clip id travels as an embedded reference marker, not inline bytes.
    pub async fn send_audio_message(
        &mut self,
        conversation_id: &str,
        recipient_id: &str,
        clip_id: &str,
    ) -> Result<String> {
        let draft = Message::new_local(
            conversation_id,
            self.self_id.clone(),
            recipient_id,
            MessageKind::AudioRef,
            audio_marker(clip_id),
        );
        self.dispatch(draft).await
    }

    /// Send an image: the optimistic entry carries an uploading placeholder
    /// until the upload collaborator resolves a remote location, which then
    /// replaces the placeholder in place before the durable write.
    pub async fn send_image(
        &mut self,
        conversation_id: &str,
        recipient_id: &str,
        data: &[u8],
    ) -> Result<String> {
        let draft = Message::new_local(
            conversation_id,
            self.self_id.clone(),
            recipient_id,
            MessageKind::Image,
            IMAGE_UPLOADING_PLACEHOLDER,
        );
        let key = self.merger.append_optimistic(conversation_id, draft.clone());

        let location = match self.uploader.upload(data).await {
            Ok(location) => location,
            Err(e) => {
                // Keep the bytes so retry_send can upload again.
                self.pending_uploads.insert(key.clone(), data.to_vec());
                self.merger.mark_failed(conversation_id, &key);
                return Err(e.into());
            }
        };
        self.merger
            .resolve_image_upload(conversation_id, &key, &location);

        let mut outgoing = draft;
        outgoing.payload = location;
        self.finish_send(conversation_id, key, outgoing).await
    }

    /// Retry a previously failed send, reusing the same timeline entry. An
    /// image entry whose upload never resolved is uploaded again first; the
    /// placeholder is never what goes to the server.
    pub async fn retry_send(&mut self, conversation_id: &str, local_key: &str) -> Result<String> {
        let mut message = match self.merger.message(conversation_id, local_key) {
            Some(message) => message,
            None => return Err(ChatError::UnknownMessage(local_key.to_string())),
        };

        if message.kind == MessageKind::Image && message.payload == IMAGE_UPLOADING_PLACEHOLDER {
            let data = match self.pending_uploads.get(local_key) {
                Some(data) => data.clone(),
                None => return Err(ChatError::UploadUnavailable(local_key.to_string())),
            };
            // Entry stays failed until the upload goes through this time.
            let location = self.uploader.upload(&data).await?;
            self.pending_uploads.remove(local_key);
            self.merger
                .resolve_image_upload(conversation_id, local_key, &location);
            message.payload = location;
        }

        self.merger.mark_pending(conversation_id, local_key);
        self.finish_send(conversation_id, local_key.to_string(), message)
            .await
    }

    /// Fetch the directory and fold it into the local view.
    pub async fn refresh_directory(&mut self) -> Result<()> {
        let summaries = self.directory_fetch.fetch_directory().await?;
        self.directory.refresh(summaries);
        Ok(())
    }

    /// End the whole session: close the connection and drop all timelines.
    pub fn end(&mut self) {
        self.connection.close();
        self.merger.clear_all();
        self.pending_uploads.clear();
    }

    async fn dispatch(&mut self, draft: Message) -> Result<String> {
        let conversation_id = draft.conversation_id.clone();
        let key = self.merger.append_optimistic(&conversation_id, draft.clone());
        self.finish_send(&conversation_id, key, draft).await
    }

    async fn finish_send(
        &mut self,
        conversation_id: &str,
        key: String,
        outgoing: Message,
    ) -> Result<String> {
        match self.sender.send(&outgoing).await {
            Ok(canonical) => {
                let canonical_id = canonical.id.clone();
                self.merger.confirm_send(conversation_id, &key, canonical);
                // The peer now has a server-backed conversation.
                self.directory.promote(&outgoing.recipient_id);
                if let Some(message) = self.merger.message(conversation_id, &canonical_id) {
                    self.directory.note_message(&message, false);
                }
                Ok(canonical_id)
            }
            Err(e) => {
                self.merger.mark_failed(conversation_id, &key);
                tracing::warn!(error = %e, conversation = conversation_id, "send failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ScriptedConnector;
    use crate::connection::ConnectionConfig;
    use crate::error::RemoteError;
    use crate::models::{ConversationSummary, DeliveryState, MessageOrigin, PeerInfo};
    use chrono::Utc;
    use std::result::Result;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeHistory(Vec<Message>);
    impl HistoryFetch for FakeHistory {
        async fn fetch_history(&self, _conversation_id: &str) -> Result<Vec<Message>, RemoteError> {
            Ok(self.0.clone())
        }
    }

    struct FakeSender {
        fail: AtomicBool,
        sent: Mutex<Vec<String>>,
    }
    impl MessageSend for FakeSender {
        async fn send(&self, message: &Message) -> Result<Message, RemoteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RemoteError("server unavailable".into()));
            }
            self.sent.lock().unwrap().push(message.payload.clone());
            let mut canonical = message.clone();
            canonical.id = format!("srv-{}", message.payload.len());
            Ok(canonical)
        }
    }

    struct FakeUploader {
        fail: AtomicBool,
    }
    impl ImageUpload for FakeUploader {
        async fn upload(&self, _data: &[u8]) -> Result<String, RemoteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RemoteError("upload refused".into()));
            }
            Ok("https://cdn.example/one.png".to_string())
        }
    }

    struct FakeDirectory(Vec<ConversationSummary>);
    impl DirectoryFetch for FakeDirectory {
        async fn fetch_directory(&self) -> Result<Vec<ConversationSummary>, RemoteError> {
            Ok(self.0.clone())
        }
    }

    fn history_message(id: &str, payload: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "bob".to_string(),
            recipient_id: "me".to_string(),
            kind: MessageKind::Text,
            payload: payload.to_string(),
            created_at: Utc::now(),
            origin: MessageOrigin::History,
        }
    }

    fn session(
        history: Vec<Message>,
        send_fails: bool,
        upload_fails: bool,
        directory: Vec<ConversationSummary>,
    ) -> ChatSession<ScriptedConnector, FakeHistory, FakeSender, FakeUploader, FakeDirectory> {
        let connection = ConnectionManager::new(
            ScriptedConnector::new(0, vec![]),
            ConnectionConfig::default(),
        );
        ChatSession::new(
            connection,
            FakeHistory(history),
            FakeSender {
                fail: AtomicBool::new(send_fails),
                sent: Mutex::new(Vec::new()),
            },
            FakeUploader {
                fail: AtomicBool::new(upload_fails),
            },
            FakeDirectory(directory),
            "me",
        )
    }

    #[tokio::test]
    async fn open_conversation_seeds_timeline_once() {
        let mut session = session(vec![history_message("1", "a")], false, false, vec![]);

        session.open_conversation("c1").await.unwrap();
        assert_eq!(session.merger.timeline("c1").len(), 1);

        // Re-open reuses the kept timeline without another fetch visible to
        // the caller (merge would reset any optimistic entries).
        session
            .merger
            .append_optimistic("c1", history_message("x", "draft"));
        session.open_conversation("c1").await.unwrap();
        assert_eq!(session.merger.timeline("c1").len(), 2);
    }

    #[tokio::test]
    async fn send_text_confirms_and_promotes() {
        let mut session = session(vec![], false, false, vec![]);
        session.directory.add_temporary(PeerInfo {
            peer_id: "bob".to_string(),
            peer_name: "Bob".to_string(),
            peer_avatar: None,
        });

        let canonical_id = session.send_text("c1", "bob", "hello").await.unwrap();

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message.id, canonical_id);
        assert_eq!(timeline[0].delivery, DeliveryState::Confirmed);

        let listed = session.directory.list();
        assert!(!listed[0].is_temporary);
        assert_eq!(
            listed[0].last_message.as_ref().map(|m| m.payload.as_str()),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn failed_send_is_surfaced_and_retryable() {
        let mut session = session(vec![], true, false, vec![]);

        let err = session.send_text("c1", "bob", "hi").await;
        assert!(err.is_err());

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].delivery, DeliveryState::Failed);
        let key = timeline[0].message.id.clone();

        // Server back up; the retry affordance reuses the same entry.
        session.sender.fail.store(false, Ordering::SeqCst);
        let canonical_id = session.retry_send("c1", &key).await.unwrap();

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message.id, canonical_id);
        assert_eq!(timeline[0].delivery, DeliveryState::Confirmed);
    }

    #[tokio::test]
    async fn send_image_resolves_placeholder_before_write() {
        let mut session = session(vec![], false, false, vec![]);

        session.send_image("c1", "bob", &[1, 2, 3]).await.unwrap();

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message.payload, "https://cdn.example/one.png");
    }

    #[tokio::test]
    async fn failed_upload_marks_entry_failed() {
        let mut session = session(vec![], false, true, vec![]);

        assert!(session.send_image("c1", "bob", &[1]).await.is_err());

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].delivery, DeliveryState::Failed);
        assert_eq!(timeline[0].message.payload, IMAGE_UPLOADING_PLACEHOLDER);
    }

    #[tokio::test]
    async fn retry_after_failed_upload_resolves_before_durable_write() {
        let mut session = session(vec![], false, true, vec![]);

        assert!(session.send_image("c1", "bob", &[7, 7]).await.is_err());
        let key = session.merger.timeline("c1")[0].message.id.clone();

        // Upload service back up; the retry must upload again rather than
        // ship the placeholder text as the message body.
        session.uploader.fail.store(false, Ordering::SeqCst);
        let canonical_id = session.retry_send("c1", &key).await.unwrap();

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline[0].message.id, canonical_id);
        assert_eq!(timeline[0].delivery, DeliveryState::Confirmed);
        assert_eq!(timeline[0].message.payload, "https://cdn.example/one.png");

        let sent = session.sender.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["https://cdn.example/one.png".to_string()]);
    }

    #[tokio::test]
    async fn retry_with_upload_still_down_stays_failed_and_sends_nothing() {
        let mut session = session(vec![], false, true, vec![]);

        assert!(session.send_image("c1", "bob", &[1]).await.is_err());
        let key = session.merger.timeline("c1")[0].message.id.clone();

        assert!(session.retry_send("c1", &key).await.is_err());
        assert_eq!(
            session.merger.timeline("c1")[0].delivery,
            DeliveryState::Failed
        );
        assert!(session.sender.sent.lock().unwrap().is_empty());

        // The bytes are still held, so a later retry can succeed.
        session.uploader.fail.store(false, Ordering::SeqCst);
        assert!(session.retry_send("c1", &key).await.is_ok());
    }

    #[tokio::test]
    async fn send_audio_message_embeds_marker() {
        let mut session = session(vec![], false, false, vec![]);

        session
            .send_audio_message("c1", "bob", "1700-abcd")
            .await
            .unwrap();

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline[0].message.kind, MessageKind::AudioRef);
        assert_eq!(
            crate::models::parse_audio_marker(&timeline[0].message.payload),
            Some("1700-abcd")
        );
    }

    #[tokio::test]
    async fn live_frames_flow_into_merger_and_directory() {
        let inbound = history_message("m9", "psst");
        let frame =
            serde_json::json!({ "event": "message", "message": inbound.clone() }).to_string();

        let connection = ConnectionManager::new(
            ScriptedConnector::new(0, vec![frame]),
            ConnectionConfig::default(),
        );
        let mut session = ChatSession::new(
            connection,
            FakeHistory(vec![]),
            FakeSender {
                fail: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            },
            FakeUploader {
                fail: AtomicBool::new(false),
            },
            FakeDirectory(vec![]),
            "me",
        );
        session.refresh_directory().await.unwrap();
        session.connect("tok");

        assert!(matches!(
            session.pump_event().await,
            Some(ConnectionEvent::Open)
        ));
        assert!(matches!(
            session.pump_event().await,
            Some(ConnectionEvent::Message(_))
        ));

        let timeline = session.merger.timeline("c1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].message.origin, MessageOrigin::Live);

        session.end();
        assert!(!session.merger.has_timeline("c1"));
    }
}
