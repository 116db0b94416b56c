//! Apple Push Notification service adapter (certificate-based).
//!
//! Requests go over HTTP/2 with a TLS client certificate loaded from a
//! PKCS#12 bundle. A `410 Unregistered` or a bad-token reason marks the
//! address invalid.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use herald_common::types::{AddressKind, Priority, PushPayload};

use crate::{DeliveryOutcome, ProviderError, PushProvider, truncate};

const INVALID_ADDRESS_REASONS: &[&str] =
    &["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"];

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    reason: String,
}

pub struct ApnsProvider {
    client: reqwest::Client,
    base_url: String,
    topic: String,
}

impl ApnsProvider {
    pub fn new(
        base_url: String,
        topic: String,
        pkcs12_der: &[u8],
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let identity = reqwest::Identity::from_pkcs12_der(pkcs12_der, password)
            .map_err(|e| ProviderError::Config(format!("Invalid APNs certificate: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .identity(identity)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            topic,
        })
    }

    /// Build the APNs JSON body. Custom data keys sit next to `aps`.
    pub fn build_body(payload: &PushPayload) -> serde_json::Value {
        let mut aps = json!({
            "alert": {
                "title": payload.title,
                "body": payload.body,
            },
            "sound": "default",
        });
        if let Some(context_id) = &payload.context_id {
            aps["thread-id"] = json!(context_id);
        }

        let mut body = serde_json::Map::new();
        if let Some(data) = payload.data.as_object() {
            for (key, value) in data {
                if key != "aps" {
                    body.insert(key.clone(), value.clone());
                }
            }
        }
        body.insert("aps".to_string(), aps);
        serde_json::Value::Object(body)
    }

    async fn send(&self, address: &str, payload: &PushPayload) -> Result<DeliveryOutcome, ProviderError> {
        let priority = match payload.priority {
            Priority::High => "10",
            Priority::Normal => "5",
        };

        let response = self
            .client
            .post(format!("{}/3/device/{}", self.base_url, address))
            .header("apns-topic", &self.topic)
            .header("apns-push-type", "alert")
            .header("apns-priority", priority)
            .json(&Self::build_body(payload))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(DeliveryOutcome::Delivered);
        }
        let body = response.text().await?;
        Ok(classify_error(status, &body))
    }
}

fn classify_error(status: u16, body: &str) -> DeliveryOutcome {
    let reason = serde_json::from_str::<ApnsErrorBody>(body)
        .map(|b| b.reason)
        .unwrap_or_else(|_| truncate(body, 200));

    if status == 410 || INVALID_ADDRESS_REASONS.contains(&reason.as_str()) {
        DeliveryOutcome::InvalidAddress(format!("HTTP {}: {}", status, reason))
    } else {
        DeliveryOutcome::TransientFailure(format!("HTTP {}: {}", status, reason))
    }
}

#[async_trait]
impl PushProvider for ApnsProvider {
    fn kind(&self) -> AddressKind {
        AddressKind::Apns
    }

    async fn deliver(&self, address: &str, payload: &PushPayload) -> DeliveryOutcome {
        match self.send(address, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(address_kind = "apns", error = %e, "APNs delivery failed");
                e.into()
            }
        }
    }
}
