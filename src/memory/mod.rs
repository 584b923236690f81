//! Conversation memory
//!
//! Keeps a bounded window of recent question/answer turns per session so
//! follow-up questions can be resolved against earlier ones.

pub mod context;
pub mod store;

pub use context::ConversationContext;
pub use store::{format_turns, ConversationSession, ConversationTurn};
