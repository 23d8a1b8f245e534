//! Domain and wire models shared across the runtime.

pub mod conversation;
pub mod message;

pub use conversation::{ConversationSummary, PeerInfo};
pub use message::{
    audio_marker, parse_audio_marker, DeliveryState, LiveEvent, Message, MessageKind, MessageOrigin,
};
