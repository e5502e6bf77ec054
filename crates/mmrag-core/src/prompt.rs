//! Prompt assembly for grounded answers and follow-up rewriting.
//!
//! Message order is fixed: system instructions, then prior turns oldest
//! first, then a single user message holding the numbered context block
//! and the question.

use crate::context::ContextWindow;
use crate::generation::{GenerationRequest, PromptMessage, PromptRole};
use crate::models::ConversationTurn;

/// Returned without calling the generator when retrieval finds nothing.
pub const NO_RESULTS_MESSAGE: &str = "I couldn't find any relevant sources for that question.";

/// Returned when the query could not be embedded or the index searched.
pub const SEARCH_UNAVAILABLE_MESSAGE: &str =
    "I could not search the knowledge base right now. Please try again later.";

/// Returned when the conversation history could not be loaded.
pub const SESSION_UNAVAILABLE_MESSAGE: &str =
    "I could not load this conversation right now. Please try again later.";

/// Returned when the generator failed after exhausting its retries.
pub const GENERATION_UNAVAILABLE_MESSAGE: &str =
    "I could not generate an answer right now. Please try again later.";

/// Number of most recent turns replayed when rewriting a follow-up.
pub const REWRITE_TURNS: usize = 3;

const SYSTEM_PROMPT: &str = "You answer questions using a knowledge base of text documents, \
images, and PDFs. Sources are numbered [1], [2], and so on. Base your answer on the sources \
and cite them inline with their numbers, for example [2]. Image sources are given by their \
description. If the sources do not contain the answer, say so plainly instead of guessing.";

const EMPTY_CONTEXT: &str = "(no matching sources were found)";

/// Build the request for a grounded answer.
pub fn build_answer_request(
    question: &str,
    context: &ContextWindow,
    history: &[ConversationTurn],
    temperature: f32,
) -> GenerationRequest {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(PromptMessage::new(PromptRole::System, SYSTEM_PROMPT));
    messages.extend(
        history
            .iter()
            .map(|t| PromptMessage::new(t.role.into(), t.text.clone())),
    );

    let context_text = if context.is_empty() {
        EMPTY_CONTEXT
    } else {
        context.text.as_str()
    };
    messages.push(PromptMessage::new(
        PromptRole::User,
        format!(
            "Sources from the knowledge base:\n{}\n\nQuestion: {}\n\nAnswer using the sources above.",
            context_text, question
        ),
    ));

    GenerationRequest {
        messages,
        temperature,
    }
}

/// Build the request that turns a follow-up into a standalone question.
///
/// Only the last [`REWRITE_TURNS`] turns of `history` are included.
pub fn build_rewrite_request(question: &str, history: &[ConversationTurn]) -> GenerationRequest {
    let recent = &history[history.len().saturating_sub(REWRITE_TURNS)..];
    let transcript = recent
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.text))
        .collect::<Vec<_>>()
        .join("\n");

    GenerationRequest {
        messages: vec![PromptMessage::new(
            PromptRole::User,
            format!(
                "Conversation so far:\n{}\n\nFollow-up question: {}\n\n\
                 Rewrite the follow-up as a single standalone question that keeps any \
                 context it depends on. Reply with the question only.",
                transcript, question
            ),
        )],
        temperature: 0.0,
    }
}

/// Clean up a rewritten question, falling back to the original when the
/// generator returned nothing usable.
pub fn standalone_question(rewritten: &str, original: &str) -> String {
    let cleaned = rewritten.trim().trim_matches('"').trim();
    if cleaned.is_empty() {
        original.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn turn(role: Role, text: &str) -> ConversationTurn {
        ConversationTurn {
            role,
            text: text.into(),
            created_at: 0,
        }
    }

    #[test]
    fn test_history_precedes_context() {
        let history = vec![turn(Role::User, "hi"), turn(Role::Assistant, "hello")];
        let ctx = ContextWindow {
            text: "[1] (Text) from a.txt (score 0.90)\nfacts".into(),
            sources: Vec::new(),
        };
        let req = build_answer_request("what?", &ctx, &history, 0.7);
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages[0].role, PromptRole::System);
        assert_eq!(req.messages[1].content, "hi");
        assert_eq!(req.messages[2].role, PromptRole::Assistant);
        assert!(req.messages[3].content.contains("Question: what?"));
        assert!(req.messages[3].content.contains(EMPTY_CONTEXT));
    }

    #[test]
    fn test_rewrite_uses_last_three_turns() {
        let history = vec![
            turn(Role::User, "one"),
            turn(Role::Assistant, "two"),
            turn(Role::User, "three"),
            turn(Role::Assistant, "four"),
        ];
        let req = build_rewrite_request("and then?", &history);
        let body = &req.messages[0].content;
        assert!(!body.contains("user: one"));
        assert!(body.contains("assistant: two"));
        assert!(body.contains("assistant: four"));
        assert!(body.contains("Follow-up question: and then?"));
    }

    #[test]
    fn test_standalone_question_fallback() {
        assert_eq!(standalone_question("  \"What is X?\" ", "x?"), "What is X?");
        assert_eq!(standalone_question("   ", "x?"), "x?");
    }
}
