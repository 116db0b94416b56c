//! Chat message events from the chat transport.

use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Priority, PushPayload};

/// Longest message preview, in characters.
const PREVIEW_CHARS: usize = 180;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageEvent {
    pub conversation_id: String,
    pub sender_id: Uuid,
    pub participant_ids: Vec<Uuid>,
    pub sender_name: String,
    pub text: String,
}

impl ChatMessageEvent {
    /// Recipients (participants other than the sender, deduplicated) and the
    /// conversation payload.
    pub fn translate(&self) -> Result<(Vec<Uuid>, PushPayload), AppError> {
        let conversation_id = self.conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(AppError::Validation(
                "conversation_id must not be empty".to_string(),
            ));
        }

        let recipients = crate::audience::dedupe(
            self.participant_ids
                .iter()
                .copied()
                .filter(|id| *id != self.sender_id)
                .collect(),
        );

        let title = match self.sender_name.trim() {
            "" => "New message".to_string(),
            name => name.to_string(),
        };

        let payload = PushPayload {
            title,
            body: preview(&self.text),
            data: serde_json::json!({
                "type": "chat_message",
                "conversation_id": conversation_id,
                "sender_id": self.sender_id,
            }),
            context_id: Some(conversation_id.to_string()),
            priority: Priority::High,
        };

        Ok((recipients, payload))
    }
}

fn preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(PREVIEW_CHARS - 3).collect();
    cut.push_str("...");
    cut
}
