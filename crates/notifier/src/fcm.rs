//! Firebase Cloud Messaging (HTTP v1) adapter.
//!
//! One JSON message per device. Android and web push tokens both go through
//! this adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use herald_common::types::{AddressKind, Priority, PushPayload};

use crate::{DeliveryOutcome, ProviderError, PushProvider, truncate};

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

pub struct FcmProvider {
    client: reqwest::Client,
    send_url: String,
    access_token: String,
}

impl FcmProvider {
    pub fn new(
        base_url: String,
        project_id: String,
        access_token: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if project_id.trim().is_empty() {
            return Err(ProviderError::Config("FCM project id is empty".to_string()));
        }
        Ok(Self {
            client: crate::http_client(timeout)?,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                base_url.trim_end_matches('/'),
                project_id
            ),
            access_token,
        })
    }

    /// Build the v1 message body. FCM only accepts string values in `data`.
    pub fn build_message(address: &str, payload: &PushPayload) -> serde_json::Value {
        let data: serde_json::Map<String, serde_json::Value> = payload
            .data
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), serde_json::Value::String(value))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (android_priority, web_urgency) = match payload.priority {
            Priority::High => ("HIGH", "high"),
            Priority::Normal => ("NORMAL", "normal"),
        };

        json!({
            "message": {
                "token": address,
                "notification": {
                    "title": payload.title,
                    "body": payload.body,
                },
                "data": data,
                "android": { "priority": android_priority },
                "webpush": { "headers": { "Urgency": web_urgency } },
            }
        })
    }

    async fn send(&self, address: &str, payload: &PushPayload) -> Result<DeliveryOutcome, ProviderError> {
        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(&self.access_token)
            .json(&Self::build_message(address, payload))
            .send()
            .await?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(DeliveryOutcome::Delivered);
        }

        let body = response.text().await?;
        Ok(classify_error(status, &body))
    }
}

/// Map an FCM error response onto a delivery outcome.
fn classify_error(status: u16, body: &str) -> DeliveryOutcome {
    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return ProviderError::HttpStatus {
            status,
            body: truncate(body, 200),
        }
        .into();
    };
    let error = envelope.error;
    let code = error
        .details
        .iter()
        .find_map(|d| d.error_code.clone())
        .unwrap_or_else(|| error.status.clone());
    let reason = format!("{}: {}", code, error.message);

    let invalid = match code.as_str() {
        "UNREGISTERED" | "SENDER_ID_MISMATCH" => true,
        "INVALID_ARGUMENT" => error.message.contains("registration token"),
        _ => false,
    };

    if invalid {
        DeliveryOutcome::InvalidAddress(reason)
    } else {
        DeliveryOutcome::TransientFailure(reason)
    }
}

#[async_trait]
impl PushProvider for FcmProvider {
    fn kind(&self) -> AddressKind {
        AddressKind::Fcm
    }

    async fn deliver(&self, address: &str, payload: &PushPayload) -> DeliveryOutcome {
        match self.send(address, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(address_kind = "fcm", error = %e, "FCM delivery failed");
                e.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unparseable_error_body_is_transient_status() {
        assert_eq!(
            classify_error(502, "<html>bad gateway</html>"),
            DeliveryOutcome::TransientFailure("HTTP 502: <html>bad gateway</html>".to_string())
        );
    }

    #[test]
    fn test_unregistered_is_invalid() {
        let body = json!({
            "error": {
                "code": 404,
                "message": "Requested entity was not found.",
                "status": "NOT_FOUND",
                "details": [{
                    "@type": "type.googleapis.com/google.firebase.fcm.v1.FcmError",
                    "errorCode": "UNREGISTERED"
                }]
            }
        })
        .to_string();
        assert!(matches!(
            classify_error(404, &body),
            DeliveryOutcome::InvalidAddress(_)
        ));
    }

    #[test]
    fn test_bad_token_argument_is_invalid() {
        let body = json!({
            "error": {
                "code": 400,
                "message": "The registration token is not a valid FCM registration token",
                "status": "INVALID_ARGUMENT"
            }
        })
        .to_string();
        assert!(matches!(
            classify_error(400, &body),
            DeliveryOutcome::InvalidAddress(_)
        ));
    }

    #[test]
    fn test_quota_exceeded_is_transient() {
        let body = json!({
            "error": {
                "code": 429,
                "message": "Quota exceeded",
                "status": "RESOURCE_EXHAUSTED",
                "details": [{"errorCode": "QUOTA_EXCEEDED"}]
            }
        })
        .to_string();
        assert!(matches!(
            classify_error(429, &body),
            DeliveryOutcome::TransientFailure(reason) if reason.starts_with("QUOTA_EXCEEDED")
        ));
    }

    #[test]
    fn test_non_json_error_is_transient() {
        assert!(matches!(
            classify_error(502, "<html>Bad Gateway</html>"),
            DeliveryOutcome::TransientFailure(_)
        ));
    }

    #[test]
    fn test_build_message_stringifies_data() {
        let payload = PushPayload {
            title: "Reminder".to_string(),
            body: "You have 2 items due".to_string(),
            data: json!({"count": 2, "kind": "reminder"}),
            context_id: None,
            priority: Priority::Normal,
        };
        let message = FcmProvider::build_message("fcm-token", &payload);
        assert_eq!(message["message"]["token"], "fcm-token");
        assert_eq!(message["message"]["data"]["count"], "2");
        assert_eq!(message["message"]["data"]["kind"], "reminder");
        assert_eq!(message["message"]["android"]["priority"], "NORMAL");
    }
}
