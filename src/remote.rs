//! Contracts for the surrounding application's network collaborators.
//!
//! The runtime never performs REST calls itself; history pages, durable
//! sends, image uploads and directory fetches are supplied by the embedding
//! application through these traits. Failures are opaque
//! [`RemoteError`](crate::error::RemoteError)s; the core surfaces them and
//! does not retry.

use std::future::Future;

use crate::error::RemoteError;
use crate::models::{ConversationSummary, Message};

/// Returns one page of a conversation's history in ascending time order.
/// Called once per conversation open; the result is fed to the merger.
pub trait HistoryFetch: Send + Sync {
    fn fetch_history(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, RemoteError>> + Send;
}

/// Performs the durable server write for a composed message. On success
/// returns the canonical message bearing the server-assigned id.
pub trait MessageSend: Send + Sync {
    fn send(&self, message: &Message)
        -> impl Future<Output = Result<Message, RemoteError>> + Send;
}

/// Uploads binary image payload and resolves to a remote location string.
pub trait ImageUpload: Send + Sync {
    fn upload(&self, data: &[u8]) -> impl Future<Output = Result<String, RemoteError>> + Send;
}

/// Returns the server's conversation summaries for the authenticated
/// identity.
pub trait DirectoryFetch: Send + Sync {
    fn fetch_directory(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, RemoteError>> + Send;
}
