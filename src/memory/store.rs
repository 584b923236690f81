//! Conversation turn storage
//!
//! A session keeps only its most recent turns; older ones fall off the front.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One completed question/answer exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub question: String,
    pub sql: String,
    pub answer: String,
    pub asked_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(question: impl Into<String>, sql: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            sql: sql.into(),
            answer: answer.into(),
            asked_at: Utc::now(),
        }
    }
}

/// Bounded turn history for one session
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    capacity: usize,
    turns: VecDeque<ConversationTurn>,
}

impl ConversationSession {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            created_at: Utc::now(),
            updated_at: Utc::now(),
            capacity,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a turn, evicting the oldest once full
    pub fn push(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.updated_at = Utc::now();
    }

    /// Up to `limit` most recent turns, oldest first
    pub fn recent(&self, limit: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(limit);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Render turns for an LLM prompt
pub fn format_turns(turns: &[ConversationTurn]) -> String {
    if turns.is_empty() {
        return "(no previous questions)".to_string();
    }

    let mut context = String::new();
    for (i, turn) in turns.iter().enumerate() {
        context.push_str(&format!(
            "{}. Q: {}\n   SQL: {}\n   A: {}\n",
            i + 1,
            turn.question,
            turn.sql,
            turn.answer
        ));
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: usize) -> ConversationTurn {
        ConversationTurn::new(format!("q{}", n), "SELECT 1", format!("a{}", n))
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut session = ConversationSession::new(3);
        for n in 1..=4 {
            session.push(turn(n));
        }

        let questions: Vec<String> = session.recent(10).into_iter().map(|t| t.question).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn test_recent_is_oldest_first() {
        let mut session = ConversationSession::new(5);
        for n in 1..=4 {
            session.push(turn(n));
        }

        let questions: Vec<String> = session.recent(2).into_iter().map(|t| t.question).collect();
        assert_eq!(questions, vec!["q3", "q4"]);
        assert!(session.recent(0).is_empty());
    }

    #[test]
    fn test_format_turns() {
        assert_eq!(format_turns(&[]), "(no previous questions)");

        let rendered = format_turns(&[turn(1), turn(2)]);
        assert!(rendered.starts_with("1. Q: q1"));
        assert!(rendered.contains("2. Q: q2"));
        assert!(rendered.contains("A: a2"));
    }
}
