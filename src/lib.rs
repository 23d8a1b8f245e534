//! # chat-core
//!
//! Real-time one-to-one messaging client runtime, embedded in a larger
//! social-platform front end. The crate keeps a persistent duplex connection
//! to the messaging server alive, reconciles paginated history, optimistic
//! sends and server-pushed live events into one ordered, duplicate-free
//! timeline per conversation, and provides durable local storage for an
//! in-progress long-form draft and locally captured audio clips.
//!
//! The surrounding application supplies network collaborators (history
//! fetch, durable send, image upload, directory fetch) through the traits in
//! [`remote`]; everything else here is self-contained.

pub mod connection;
pub mod directory;
pub mod error;
pub mod models;
pub mod remote;
pub mod session;
pub mod store;
pub mod timeline;

pub use connection::transport::{Conn, Connector, WsConn, WsConnector};
pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
pub use directory::ChatDirectory;
pub use error::{ChatError, ProtocolError, RemoteError, Result, StoreError, TransportError};
pub use models::{
    ConversationSummary, DeliveryState, Message, MessageKind, MessageOrigin, PeerInfo,
};
pub use session::ChatSession;
pub use store::{AudioRecord, AudioStore, DraftRecord, DraftStore, Store};
pub use timeline::{TimelineEntry, TimelineMerger};
