//! Queue processor: one process-queue run.
//!
//! Reclaims stale claims, claims a batch of due entries, dispatches each one
//! and writes the outcome back. Entries in a batch are dispatched
//! concurrently, bounded by the configured concurrency.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::{EntryStatus, NotificationEntry};

use crate::dispatcher::{DispatchSummary, Dispatcher, RecipientReport, RecipientStatus};
use crate::queue::{EntryOutcome, NotificationQueue};

/// Queue run tuning.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub batch_size: i64,
    pub concurrency: usize,
    pub stale_claim_timeout: Duration,
    pub retry_backoff: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.queue_batch_size,
            concurrency: config.dispatch_concurrency.max(1),
            stale_claim_timeout: config.stale_claim_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Counters returned by a queue run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueRunSummary {
    pub reclaimed: u64,
    pub claimed: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Entries whose claim was lost before resolve.
    pub lost_claims: u64,
}

pub struct QueueProcessor {
    queue: NotificationQueue,
    dispatcher: Arc<Dispatcher>,
    settings: QueueSettings,
}

impl QueueProcessor {
    pub fn new(queue: NotificationQueue, dispatcher: Arc<Dispatcher>, settings: QueueSettings) -> Self {
        Self {
            queue,
            dispatcher,
            settings,
        }
    }

    /// Run one pass. `limit` overrides the configured batch size.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<QueueRunSummary, AppError> {
        let mut summary = QueueRunSummary {
            reclaimed: self
                .queue
                .reclaim_stale(now, self.settings.stale_claim_timeout)
                .await?,
            ..Default::default()
        };

        let batch = limit.unwrap_or(self.settings.batch_size);
        let claimed = self.queue.claim_due(now, batch).await?;
        summary.claimed = claimed.len() as u64;
        if claimed.is_empty() {
            return Ok(summary);
        }

        let results: Vec<Result<Option<EntryStatus>, AppError>> = stream::iter(claimed)
            .map(|entry| self.process_entry(entry, now))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(EntryStatus::Sent)) => summary.sent += 1,
                Ok(Some(EntryStatus::Queued)) => summary.retried += 1,
                Ok(Some(EntryStatus::Failed)) => summary.failed += 1,
                Ok(Some(EntryStatus::Cancelled)) => summary.cancelled += 1,
                Ok(Some(EntryStatus::Sending)) | Ok(None) => summary.lost_claims += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to resolve queue entry");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            reclaimed = summary.reclaimed,
            claimed = summary.claimed,
            sent = summary.sent,
            retried = summary.retried,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Queue run complete"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn process_entry(
        &self,
        entry: NotificationEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<EntryStatus>, AppError> {
        let outcome = match self
            .dispatcher
            .send(&[entry.recipient_id], &entry.payload(), entry.category)
            .await
        {
            Ok(summary) => entry_outcome(&summary, entry.recipient_id),
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, error = %e, "Dispatch failed, entry will be retried");
                EntryOutcome::Failed {
                    reason: e.to_string(),
                    retryable: true,
                }
            }
        };

        let resolved = self
            .queue
            .resolve(&entry, &outcome, now, self.settings.retry_backoff)
            .await?;
        Ok(resolved.map(|e| e.status))
    }
}

/// Map a single-recipient dispatch onto the queue outcome.
pub fn entry_outcome(summary: &DispatchSummary, recipient_id: Uuid) -> EntryOutcome {
    match summary.report_for(recipient_id) {
        Some(report) => outcome_for(report, summary.failure_reason(recipient_id)),
        None => EntryOutcome::Skipped("recipient not dispatched".to_string()),
    }
}

/// Queue outcome of every recipient of a dispatch, in report order.
pub fn entry_outcomes(summary: &DispatchSummary) -> Vec<(Uuid, EntryOutcome)> {
    let mut reasons = summary.failure_reasons();
    summary
        .recipients
        .iter()
        .map(|report| {
            let reason = reasons.remove(&report.recipient_id);
            (report.recipient_id, outcome_for(report, reason))
        })
        .collect()
}

fn outcome_for(report: &RecipientReport, reason: Option<String>) -> EntryOutcome {
    match report.status {
        RecipientStatus::Delivered => EntryOutcome::Delivered,
        RecipientStatus::NoActiveTokens => EntryOutcome::Skipped("no active device tokens".to_string()),
        RecipientStatus::Suppressed => {
            EntryOutcome::Skipped("recipient active in conversation".to_string())
        }
        RecipientStatus::Failed { retryable } => EntryOutcome::Failed {
            reason: reason.unwrap_or_else(|| "delivery failed".to_string()),
            retryable,
        },
    }
}
