//! Send-now: dispatch immediately, then store an entry per recipient.
//!
//! Recipients whose addresses all failed transiently are stored as `queued`
//! and picked up by the next queue run.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{NotificationCategory, PushPayload};

use crate::chat::ChatMessageEvent;
use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::queue::NotificationQueue;
use crate::worker::entry_outcomes;

/// Most recipients accepted by one send-now call.
const MAX_RECIPIENTS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct SendNowRequest {
    pub recipient_ids: Vec<Uuid>,
    pub payload: PushPayload,
    pub category: NotificationCategory,
}

impl SendNowRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.recipient_ids.is_empty() {
            return Err(AppError::Validation(
                "recipient_ids must not be empty".to_string(),
            ));
        }
        if self.recipient_ids.len() > MAX_RECIPIENTS {
            return Err(AppError::Validation(format!(
                "at most {} recipients per request",
                MAX_RECIPIENTS
            )));
        }
        if self.payload.title.trim().is_empty() || self.payload.body.trim().is_empty() {
            return Err(AppError::Validation(
                "payload title and body must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct DirectSender {
    dispatcher: Arc<Dispatcher>,
    queue: NotificationQueue,
    retry_backoff: Duration,
}

impl DirectSender {
    pub fn new(dispatcher: Arc<Dispatcher>, queue: NotificationQueue, retry_backoff: Duration) -> Self {
        Self {
            dispatcher,
            queue,
            retry_backoff,
        }
    }

    pub async fn send_now(&self, request: &SendNowRequest) -> Result<DispatchSummary, AppError> {
        request.validate()?;
        let summary = self
            .dispatcher
            .send(&request.recipient_ids, &request.payload, request.category)
            .await?;
        self.record(&summary, &request.payload, request.category).await;
        Ok(summary)
    }

    /// Translate a chat message and send it to the other participants.
    pub async fn send_chat_message(&self, event: &ChatMessageEvent) -> Result<DispatchSummary, AppError> {
        let (recipients, payload) = event.translate()?;
        if recipients.is_empty() {
            return Ok(DispatchSummary::default());
        }
        let summary = self
            .dispatcher
            .send(&recipients, &payload, NotificationCategory::Conversation)
            .await?;
        self.record(&summary, &payload, NotificationCategory::Conversation)
            .await;
        Ok(summary)
    }

    /// Recording is best-effort; the dispatch already happened.
    async fn record(&self, summary: &DispatchSummary, payload: &PushPayload, category: NotificationCategory) {
        let now = Utc::now();
        for (recipient_id, outcome) in entry_outcomes(summary) {
            if let Err(e) = self
                .queue
                .record_direct(
                    recipient_id,
                    payload,
                    category,
                    &outcome,
                    now,
                    self.retry_backoff,
                )
                .await
            {
                tracing::error!(
                    recipient_id = %recipient_id,
                    error = %e,
                    "Failed to record direct send"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::Priority;

    fn request(recipients: Vec<Uuid>, title: &str) -> SendNowRequest {
        SendNowRequest {
            recipient_ids: recipients,
            payload: PushPayload {
                title: title.to_string(),
                body: "body".to_string(),
                data: serde_json::json!({}),
                context_id: None,
                priority: Priority::Normal,
            },
            category: NotificationCategory::System,
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request(vec![Uuid::new_v4()], "Hello").validate().is_ok());
        assert!(request(vec![], "Hello").validate().is_err());
        assert!(request(vec![Uuid::new_v4()], " ").validate().is_err());
        let many = (0..=MAX_RECIPIENTS).map(|_| Uuid::new_v4()).collect();
        assert!(request(many, "Hello").validate().is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let req: SendNowRequest = serde_json::from_value(serde_json::json!({
            "recipient_ids": [Uuid::nil()],
            "payload": {"title": "Hi", "body": "There", "context_id": "c1"},
            "category": "conversation"
        }))
        .unwrap();
        assert_eq!(req.category, NotificationCategory::Conversation);
        assert_eq!(req.payload.priority, Priority::Normal);
        assert_eq!(req.payload.data, serde_json::json!({}));
    }
}
