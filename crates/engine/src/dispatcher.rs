//! Delivery dispatcher: fans a payload out to every active address of every
//! recipient.
//!
//! Pipeline per call:
//! 1. Load active tokens for all recipients (one query)
//! 2. Drop suppressible notifications for recipients present in the context
//! 3. Deliver each (recipient, address) pair concurrently, bounded by
//!    `DispatchSettings::concurrency`, each call under a fixed timeout
//! 4. Deactivate addresses the provider rejected as invalid
//! 5. Fold every per-address result into a `DispatchSummary`
//!
//! Only a token-store failure aborts a dispatch; everything after that is
//! recovered locally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::{AddressKind, DeviceToken, NotificationCategory, PushPayload};
use herald_notifier::{DeliveryOutcome, ProviderSet};

use crate::activity::ActivityTracker;
use crate::tokens::TokenRegistry;

/// Source of active device tokens, and sink for self-healing deactivation.
#[async_trait]
pub trait TokenDirectory: Send + Sync {
    async fn active_tokens(&self, user_ids: &[Uuid]) -> Result<Vec<DeviceToken>, AppError>;

    /// Deactivate `token` if it still holds the same address.
    async fn deactivate_token(&self, token: &DeviceToken) -> Result<bool, AppError>;
}

/// Best-effort presence signal. Implementations must fail open (return false).
#[async_trait]
pub trait PresenceOracle: Send + Sync {
    async fn is_active(&self, user_id: Uuid, context_id: &str) -> bool;
}

/// Dispatch tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Maximum provider calls in flight.
    pub concurrency: usize,
    /// Timeout applied to each provider call.
    pub provider_timeout: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.dispatch_concurrency.max(1),
            provider_timeout: config.provider_timeout(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 16,
            provider_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    /// At least one address accepted the notification.
    Delivered,
    /// The recipient has no active addresses.
    NoActiveTokens,
    /// The recipient is present in the notification's context.
    Suppressed,
    /// Every attempted address failed. `retryable` is false when all of them
    /// were rejected as invalid.
    Failed { retryable: bool },
}

/// Per-recipient tally.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientReport {
    pub recipient_id: Uuid,
    pub status: RecipientStatus,
    pub delivered: u32,
    pub failed: u32,
}

/// Context kept for every failed address, enough to reprocess by hand.
#[derive(Debug, Clone, Serialize)]
pub struct AddressFailure {
    pub recipient_id: Uuid,
    pub token_id: Uuid,
    pub address_kind: AddressKind,
    pub invalid_address: bool,
    pub reason: String,
}

/// Aggregate result of one dispatch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub successful_sends: u32,
    pub failed_sends: u32,
    pub skipped_recipients: u32,
    pub suppressed_recipients: u32,
    pub deactivated_tokens: u32,
    pub failures: Vec<AddressFailure>,
    pub recipients: Vec<RecipientReport>,
}

impl DispatchSummary {
    pub fn report_for(&self, recipient_id: Uuid) -> Option<&RecipientReport> {
        self.recipients.iter().find(|r| r.recipient_id == recipient_id)
    }

    /// Failure reasons of every failed recipient, joined for storage.
    pub fn failure_reasons(&self) -> HashMap<Uuid, String> {
        let mut reasons: HashMap<Uuid, String> = HashMap::new();
        for failure in &self.failures {
            let line = format!("{}: {}", failure.address_kind, failure.reason);
            reasons
                .entry(failure.recipient_id)
                .and_modify(|joined| {
                    joined.push_str("; ");
                    joined.push_str(&line);
                })
                .or_insert(line);
        }
        reasons
    }

    /// Failure reasons for one recipient, joined for storage.
    pub fn failure_reason(&self, recipient_id: Uuid) -> Option<String> {
        let reasons: Vec<String> = self
            .failures
            .iter()
            .filter(|f| f.recipient_id == recipient_id)
            .map(|f| format!("{}: {}", f.address_kind, f.reason))
            .collect();
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        }
    }
}

/// Result of one (recipient, address) delivery.
struct AddressResult {
    token: DeviceToken,
    outcome: DeliveryOutcome,
    deactivated: bool,
}

/// Fans notifications out to provider adapters.
pub struct Dispatcher {
    tokens: Arc<dyn TokenDirectory>,
    presence: Arc<dyn PresenceOracle>,
    providers: ProviderSet,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        tokens: Arc<dyn TokenDirectory>,
        presence: Arc<dyn PresenceOracle>,
        providers: ProviderSet,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            tokens,
            presence,
            providers,
            settings,
        }
    }

    /// Wire a dispatcher to the PostgreSQL token registry, the Redis activity
    /// tracker and the configured providers.
    pub fn from_config(
        pool: PgPool,
        redis: ConnectionManager,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::new(TokenRegistry::new(pool)),
            Arc::new(ActivityTracker::new(redis, config.presence_window())),
            ProviderSet::from_config(config)?,
            DispatchSettings::from_config(config),
        ))
    }

    /// Send `payload` to every recipient.
    ///
    /// Returns an error only when the token store is unreachable.
    pub async fn send(
        &self,
        recipients: &[Uuid],
        payload: &PushPayload,
        category: NotificationCategory,
    ) -> Result<DispatchSummary, AppError> {
        let mut seen = HashSet::new();
        let recipients: Vec<Uuid> = recipients
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let mut summary = DispatchSummary::default();
        if recipients.is_empty() {
            return Ok(summary);
        }

        let mut by_recipient: HashMap<Uuid, Vec<DeviceToken>> = HashMap::new();
        for token in self.tokens.active_tokens(&recipients).await? {
            by_recipient.entry(token.user_id).or_default().push(token);
        }

        let mut pairs: Vec<DeviceToken> = Vec::new();
        let mut reports: Vec<RecipientReport> = Vec::with_capacity(recipients.len());
        // Report index of every recipient with addresses in flight.
        let mut in_flight: HashMap<Uuid, usize> = HashMap::new();

        for recipient_id in &recipients {
            let tokens = by_recipient.remove(recipient_id).unwrap_or_default();
            if tokens.is_empty() {
                tracing::debug!(recipient_id = %recipient_id, "No active device tokens");
                summary.skipped_recipients += 1;
                reports.push(RecipientReport {
                    recipient_id: *recipient_id,
                    status: RecipientStatus::NoActiveTokens,
                    delivered: 0,
                    failed: 0,
                });
                continue;
            }

            if self.is_suppressed(*recipient_id, payload, category).await {
                tracing::debug!(
                    recipient_id = %recipient_id,
                    context_id = ?payload.context_id,
                    "Notification suppressed, recipient active in context"
                );
                summary.suppressed_recipients += 1;
                reports.push(RecipientReport {
                    recipient_id: *recipient_id,
                    status: RecipientStatus::Suppressed,
                    delivered: 0,
                    failed: 0,
                });
                continue;
            }

            pairs.extend(tokens);
            in_flight.insert(*recipient_id, reports.len());
            reports.push(RecipientReport {
                recipient_id: *recipient_id,
                status: RecipientStatus::Delivered,
                delivered: 0,
                failed: 0,
            });
        }

        let results: Vec<AddressResult> = stream::iter(pairs)
            .map(|token| self.deliver_one(token, payload))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut retryable: HashSet<Uuid> = HashSet::new();
        for result in results {
            let recipient_id = result.token.user_id;
            let Some(report) = in_flight.get(&recipient_id).map(|&i| &mut reports[i]) else {
                continue;
            };

            match result.outcome {
                DeliveryOutcome::Delivered => {
                    summary.successful_sends += 1;
                    report.delivered += 1;
                }
                DeliveryOutcome::InvalidAddress(reason) => {
                    summary.failed_sends += 1;
                    report.failed += 1;
                    if result.deactivated {
                        summary.deactivated_tokens += 1;
                    }
                    summary.failures.push(AddressFailure {
                        recipient_id,
                        token_id: result.token.id,
                        address_kind: result.token.address_kind,
                        invalid_address: true,
                        reason,
                    });
                }
                DeliveryOutcome::TransientFailure(reason) => {
                    summary.failed_sends += 1;
                    report.failed += 1;
                    retryable.insert(recipient_id);
                    summary.failures.push(AddressFailure {
                        recipient_id,
                        token_id: result.token.id,
                        address_kind: result.token.address_kind,
                        invalid_address: false,
                        reason,
                    });
                }
            }
        }

        for report in reports.iter_mut() {
            if report.status == RecipientStatus::Delivered && report.delivered == 0 {
                report.status = RecipientStatus::Failed {
                    retryable: retryable.contains(&report.recipient_id),
                };
            }
        }
        summary.recipients = reports;

        tracing::info!(
            recipients = recipients.len(),
            category = %category,
            successful_sends = summary.successful_sends,
            failed_sends = summary.failed_sends,
            skipped = summary.skipped_recipients,
            suppressed = summary.suppressed_recipients,
            "Dispatch complete"
        );

        Ok(summary)
    }

    async fn is_suppressed(
        &self,
        recipient_id: Uuid,
        payload: &PushPayload,
        category: NotificationCategory,
    ) -> bool {
        if !category.is_suppressible() {
            return false;
        }
        match payload.context_id.as_deref() {
            Some(context_id) => self.presence.is_active(recipient_id, context_id).await,
            None => false,
        }
    }

    async fn deliver_one(&self, token: DeviceToken, payload: &PushPayload) -> AddressResult {
        let outcome = match self.providers.get(token.address_kind) {
            None => {
                tracing::error!(
                    token_id = %token.id,
                    address_kind = %token.address_kind,
                    "No provider configured for address kind"
                );
                DeliveryOutcome::TransientFailure(format!(
                    "provider not configured for {}",
                    token.address_kind
                ))
            }
            Some(provider) => {
                match tokio::time::timeout(
                    self.settings.provider_timeout,
                    provider.deliver(&token.address, payload),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => DeliveryOutcome::TransientFailure(format!(
                        "provider call timed out after {}ms",
                        self.settings.provider_timeout.as_millis()
                    )),
                }
            }
        };

        let mut deactivated = false;
        match &outcome {
            DeliveryOutcome::Delivered => {}
            DeliveryOutcome::InvalidAddress(reason) => {
                tracing::warn!(
                    token_id = %token.id,
                    recipient_id = %token.user_id,
                    address_kind = %token.address_kind,
                    reason = %reason,
                    "Provider rejected address, deactivating token"
                );
                match self.tokens.deactivate_token(&token).await {
                    Ok(changed) => deactivated = changed,
                    Err(e) => tracing::error!(
                        token_id = %token.id,
                        error = %e,
                        "Failed to deactivate rejected token"
                    ),
                }
            }
            DeliveryOutcome::TransientFailure(reason) => {
                tracing::warn!(
                    token_id = %token.id,
                    recipient_id = %token.user_id,
                    address_kind = %token.address_kind,
                    reason = %reason,
                    "Transient delivery failure"
                );
            }
        }

        AddressResult {
            token,
            outcome,
            deactivated,
        }
    }
}
