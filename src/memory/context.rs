//! Per-session conversation context
//!
//! Sessions live in a shared map; each session has its own lock, so appends
//! to one session serialize while different sessions never block each other.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::memory::store::{ConversationSession, ConversationTurn};

pub const DEFAULT_WINDOW: usize = 5;

pub struct ConversationContext {
    sessions: RwLock<HashMap<String, Arc<Mutex<ConversationSession>>>>,
    window: usize,
}

impl ConversationContext {
    pub fn new(window: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    async fn session(&self, session_id: &str) -> Arc<Mutex<ConversationSession>> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id, "Opening conversation session");
                Arc::new(Mutex::new(ConversationSession::new(self.window)))
            })
            .clone()
    }

    /// Record a completed turn
    pub async fn append(&self, session_id: &str, turn: ConversationTurn) {
        let session = self.session(session_id).await;
        session.lock().await.push(turn);
    }

    /// Up to `limit` most recent turns, oldest first; unknown sessions are empty
    pub async fn recent_turns(&self, session_id: &str, limit: usize) -> Vec<ConversationTurn> {
        let session = match self.sessions.read().await.get(session_id) {
            Some(session) => session.clone(),
            None => return Vec::new(),
        };
        let turns = session.lock().await.recent(limit);
        turns
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
