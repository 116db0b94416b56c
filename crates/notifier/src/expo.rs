//! Expo push adapter.
//!
//! Expo accepts a JSON array of messages per request and answers with one
//! ticket per message, in order. A ticket with `details.error =
//! "DeviceNotRegistered"` means the token is dead.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use herald_common::types::{AddressKind, Priority, PushPayload};

use crate::{DeliveryOutcome, ProviderError, PushProvider, classify_status, http_client};

/// Ticket-level error codes that mean the address will never work again.
const INVALID_ADDRESS_ERRORS: &[&str] = &["DeviceNotRegistered"];

#[derive(Debug, Deserialize)]
struct TicketResponse {
    #[serde(default)]
    data: Vec<Ticket>,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    status: String,
    message: Option<String>,
    details: Option<TicketDetails>,
}

#[derive(Debug, Deserialize)]
struct TicketDetails {
    error: Option<String>,
}

pub struct ExpoProvider {
    client: reqwest::Client,
    push_url: String,
    access_token: Option<String>,
}

impl ExpoProvider {
    pub fn new(
        push_url: String,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(timeout)?,
            push_url,
            access_token,
        })
    }

    /// Build the single-element message batch for one address.
    pub fn build_messages(address: &str, payload: &PushPayload) -> serde_json::Value {
        let priority = match payload.priority {
            Priority::High => "high",
            Priority::Normal => "default",
        };
        json!([{
            "to": address,
            "title": payload.title,
            "body": payload.body,
            "data": payload.data,
            "sound": "default",
            "priority": priority,
        }])
    }

    async fn send(&self, address: &str, payload: &PushPayload) -> Result<DeliveryOutcome, ProviderError> {
        let mut request = self
            .client
            .post(&self.push_url)
            .header("accept", "application/json")
            .json(&Self::build_messages(address, payload));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if !(200..300).contains(&status) {
            return Ok(classify_status(status, &body));
        }

        let parsed: TicketResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("Expo ticket response: {}", e)))?;
        let ticket = parsed
            .data
            .first()
            .ok_or_else(|| ProviderError::Malformed("Expo returned no tickets".to_string()))?;

        Ok(classify_ticket(ticket))
    }
}

fn classify_ticket(ticket: &Ticket) -> DeliveryOutcome {
    if ticket.status == "ok" {
        return DeliveryOutcome::Delivered;
    }

    let code = ticket
        .details
        .as_ref()
        .and_then(|d| d.error.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let message = ticket.message.clone().unwrap_or_default();

    if INVALID_ADDRESS_ERRORS.contains(&code.as_str()) {
        DeliveryOutcome::InvalidAddress(format!("{}: {}", code, message))
    } else {
        DeliveryOutcome::TransientFailure(format!("{}: {}", code, message))
    }
}

#[async_trait]
impl PushProvider for ExpoProvider {
    fn kind(&self) -> AddressKind {
        AddressKind::Expo
    }

    async fn deliver(&self, address: &str, payload: &PushPayload) -> DeliveryOutcome {
        match self.send(address, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(address_kind = "expo", error = %e, "Expo delivery failed");
                e.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(value: serde_json::Value) -> Ticket {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_ok_ticket_delivered() {
        let t = ticket(json!({"status": "ok", "id": "XXXX-XXXX"}));
        assert_eq!(classify_ticket(&t), DeliveryOutcome::Delivered);
    }

    #[test]
    fn test_device_not_registered_is_invalid() {
        let t = ticket(json!({
            "status": "error",
            "message": "\"ExponentPushToken[xxx]\" is not a registered push notification recipient",
            "details": {"error": "DeviceNotRegistered"}
        }));
        assert!(matches!(
            classify_ticket(&t),
            DeliveryOutcome::InvalidAddress(reason) if reason.starts_with("DeviceNotRegistered")
        ));
    }

    #[test]
    fn test_other_ticket_error_is_transient() {
        let t = ticket(json!({
            "status": "error",
            "message": "rate exceeded",
            "details": {"error": "MessageRateExceeded"}
        }));
        assert!(matches!(
            classify_ticket(&t),
            DeliveryOutcome::TransientFailure(_)
        ));
    }

    #[test]
    fn test_build_messages_is_array() {
        let payload = PushPayload {
            title: "New message".to_string(),
            body: "Hello".to_string(),
            data: json!({"conversation_id": "c1"}),
            context_id: Some("c1".to_string()),
            priority: Priority::High,
        };
        let messages = ExpoProvider::build_messages("ExponentPushToken[abc]", &payload);
        let array = messages.as_array().unwrap();
        assert_eq!(array.len(), 1);
        assert_eq!(array[0]["to"], "ExponentPushToken[abc]");
        assert_eq!(array[0]["priority"], "high");
        assert_eq!(array[0]["data"]["conversation_id"], "c1");
    }
}
