//! Conversation sessions.
//!
//! A [`Session`] owns the ordered turns of one client-visible conversation.
//! It is plain data: single-writer access is enforced by whoever holds it
//! (the app crate wraps each session in an async mutex).

use serde::Serialize;
use uuid::Uuid;

use crate::models::{ConversationTurn, Role};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub turns: Vec<ConversationTurn>,
}

/// Bounds applied when prior turns are replayed into a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_turns: usize,
    pub max_chars: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_chars: 4000,
        }
    }
}

impl Session {
    /// A fresh session with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>, created_at: i64) {
        self.turns.push(ConversationTurn {
            role,
            text: text.into(),
            created_at,
        });
    }

    /// Record a completed question/answer exchange.
    pub fn record_exchange(&mut self, question: &str, answer: &str, now: i64) {
        self.push(Role::User, question, now);
        self.push(Role::Assistant, answer, now);
    }

    /// The most recent turns that fit both limits, oldest first.
    ///
    /// Turns are taken newest-first until either limit would be exceeded,
    /// so the oldest turns are the ones dropped. The result always starts
    /// on a user turn: an answer whose question did not fit is left out.
    pub fn recent(&self, limits: &HistoryLimits) -> &[ConversationTurn] {
        let mut chars = 0usize;
        let mut taken = 0usize;
        for turn in self.turns.iter().rev() {
            if taken == limits.max_turns {
                break;
            }
            let len = turn.text.chars().count();
            if chars + len > limits.max_chars {
                break;
            }
            chars += len;
            taken += 1;
        }
        let recent = &self.turns[self.turns.len() - taken..];
        let orphans = recent
            .iter()
            .take_while(|turn| turn.role == Role::Assistant)
            .count();
        &recent[orphans..]
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
