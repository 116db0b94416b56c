//! Push provider adapters.
//!
//! Each adapter implements [`PushProvider`] for one [`AddressKind`] and maps
//! provider responses onto the three-way [`DeliveryOutcome`] contract. The
//! [`ProviderSet`] routes an address to its adapter.

pub mod apns;
pub mod expo;
pub mod fcm;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use herald_common::config::AppConfig;
use herald_common::types::{AddressKind, PushPayload};

/// Result of a single provider call for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// The provider rejected the address permanently; the token must be deactivated.
    InvalidAddress(String),
    /// Network error, throttling or provider outage; safe to retry later.
    TransientFailure(String),
}

/// Errors raised inside an adapter before a response could be classified.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success status with no provider-specific reason to classify.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Unexpected provider response: {0}")]
    Malformed(String),

    #[error("Provider configuration error: {0}")]
    Config(String),
}

impl From<ProviderError> for DeliveryOutcome {
    fn from(err: ProviderError) -> Self {
        DeliveryOutcome::TransientFailure(err.to_string())
    }
}

/// Contract every push provider adapter implements.
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Address kind this adapter delivers to.
    fn kind(&self) -> AddressKind;

    /// Deliver `payload` to a single device address.
    ///
    /// Never returns an error: every failure is classified into a
    /// [`DeliveryOutcome`] so sibling deliveries are unaffected.
    async fn deliver(&self, address: &str, payload: &PushPayload) -> DeliveryOutcome;
}

/// Router from address kind to the adapter handling it.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<AddressKind, Arc<dyn PushProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same kind.
    pub fn with(mut self, provider: Arc<dyn PushProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Build the adapters that have enough configuration to run.
    ///
    /// Expo needs no credentials and is always enabled. FCM requires a project
    /// id and access token, APNs a certificate and topic.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let timeout = config.provider_timeout();
        let mut set = Self::new().with(Arc::new(expo::ExpoProvider::new(
            config.expo_push_url.clone(),
            config.expo_access_token.clone(),
            timeout,
        )?));

        match (&config.fcm_project_id, &config.fcm_access_token) {
            (Some(project_id), Some(access_token)) => {
                set = set.with(Arc::new(fcm::FcmProvider::new(
                    config.fcm_base_url.clone(),
                    project_id.clone(),
                    access_token.clone(),
                    timeout,
                )?));
            }
            _ => tracing::warn!("FCM not configured, fcm tokens will not be delivered"),
        }

        match (&config.apns_cert_path, &config.apns_topic) {
            (Some(cert_path), Some(topic)) => {
                let der = std::fs::read(cert_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read APNs certificate {}: {}", cert_path, e)
                })?;
                set = set.with(Arc::new(apns::ApnsProvider::new(
                    config.apns_base_url.clone(),
                    topic.clone(),
                    &der,
                    &config.apns_cert_password,
                    timeout,
                )?));
            }
            _ => tracing::warn!("APNs not configured, apns tokens will not be delivered"),
        }

        tracing::info!(providers = ?set.kinds(), "Push providers initialized");
        Ok(set)
    }

    pub fn get(&self, kind: AddressKind) -> Option<Arc<dyn PushProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<AddressKind> {
        let mut kinds: Vec<AddressKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

/// Build an HTTP client with the per-call timeout every adapter uses.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Classify an HTTP status that carries no provider-specific reason.
pub(crate) fn classify_status(status: u16, body: &str) -> DeliveryOutcome {
    match status {
        200..=299 => DeliveryOutcome::Delivered,
        _ => ProviderError::HttpStatus {
            status,
            body: truncate(body, 200),
        }
        .into(),
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProvider(AddressKind);

    #[async_trait]
    impl PushProvider for NoopProvider {
        fn kind(&self) -> AddressKind {
            self.0
        }

        async fn deliver(&self, _address: &str, _payload: &PushPayload) -> DeliveryOutcome {
            DeliveryOutcome::Delivered
        }
    }

    #[test]
    fn test_provider_set_routes_by_kind() {
        let set = ProviderSet::new()
            .with(Arc::new(NoopProvider(AddressKind::Expo)))
            .with(Arc::new(NoopProvider(AddressKind::Apns)));

        assert!(set.get(AddressKind::Expo).is_some());
        assert!(set.get(AddressKind::Apns).is_some());
        assert!(set.get(AddressKind::Fcm).is_none());
        assert_eq!(set.kinds(), vec![AddressKind::Apns, AddressKind::Expo]);
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200, ""), DeliveryOutcome::Delivered);
        assert_eq!(
            classify_status(503, "unavailable"),
            DeliveryOutcome::TransientFailure("HTTP 503: unavailable".to_string())
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }

    #[test]
    fn test_provider_error_becomes_transient() {
        let outcome: DeliveryOutcome = ProviderError::Malformed("no data".into()).into();
        assert!(matches!(outcome, DeliveryOutcome::TransientFailure(_)));
    }
}
