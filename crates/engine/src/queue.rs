//! Notification queue: one row per delivery attempt record.
//!
//! Every state change that decides ownership is a conditional `UPDATE` on the
//! `status` column. A claim moves `queued → sending` and stamps a claim token;
//! `resolve` only lands while the row is still `sending` under that token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    EntryStatus, NotificationCategory, NotificationEntry, Priority, PushPayload, SourceType,
};

/// Upper bound for the retry delay.
const MAX_BACKOFF_SECS: i64 = 3600;

/// Reason recorded on entries whose claim expired.
const STALE_CLAIM_REASON: &str = "claim expired before a delivery result was recorded";

/// Parameters for a new queue entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEntry {
    pub recipient_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(default = "empty_object")]
    pub custom_data: serde_json::Value,
    pub category: NotificationCategory,
    #[serde(default = "default_source")]
    pub source_type: SourceType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub context_id: Option<String>,
    /// `None` means due immediately.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Overrides the queue default.
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_source() -> SourceType {
    SourceType::Manual
}

impl NewEntry {
    fn validate(&self) -> Result<(), AppError> {
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("title must not be empty".to_string()));
        }
        if self.body.trim().is_empty() {
            return Err(AppError::Validation("body must not be empty".to_string()));
        }
        if !self.custom_data.is_object() {
            return Err(AppError::Validation(
                "custom_data must be a JSON object".to_string(),
            ));
        }
        if let Some(max) = self.max_attempts {
            if !(1..=20).contains(&max) {
                return Err(AppError::Validation(
                    "max_attempts must be between 1 and 20".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Result of one claimed attempt, as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// At least one address accepted the notification.
    Delivered,
    /// Nothing was sent and nothing should be retried.
    Skipped(String),
    Failed { reason: String, retryable: bool },
}

/// Retry delay after the given number of attempts: `base * 2^(attempts-1)`,
/// capped at one hour.
pub fn retry_backoff(base: Duration, attempts: i32) -> Duration {
    let exponent = (attempts - 1).clamp(0, 20) as u32;
    let secs = base
        .num_seconds()
        .max(0)
        .saturating_mul(1i64 << exponent)
        .min(MAX_BACKOFF_SECS);
    Duration::seconds(secs)
}

/// Status, attempts, error and next due time after resolving an attempt.
fn next_state(
    attempts: i32,
    max_attempts: i32,
    outcome: &EntryOutcome,
    now: DateTime<Utc>,
    backoff_base: Duration,
) -> (EntryStatus, i32, Option<String>, Option<DateTime<Utc>>) {
    let attempts = attempts + 1;
    match outcome {
        EntryOutcome::Delivered => (EntryStatus::Sent, attempts, None, None),
        EntryOutcome::Skipped(reason) => (EntryStatus::Cancelled, attempts, Some(reason.clone()), None),
        EntryOutcome::Failed { reason, retryable } => {
            if *retryable && attempts < max_attempts {
                let due = now + retry_backoff(backoff_base, attempts);
                (EntryStatus::Queued, attempts, Some(reason.clone()), Some(due))
            } else {
                (EntryStatus::Failed, attempts, Some(reason.clone()), None)
            }
        }
    }
}

/// PostgreSQL-backed notification queue.
#[derive(Clone)]
pub struct NotificationQueue {
    pool: PgPool,
    default_max_attempts: i32,
}

impl NotificationQueue {
    pub fn new(pool: PgPool, default_max_attempts: i32) -> Self {
        Self {
            pool,
            default_max_attempts: default_max_attempts.max(1),
        }
    }

    /// Insert one entry in `queued`.
    pub async fn enqueue(&self, entry: &NewEntry) -> Result<NotificationEntry, AppError> {
        entry.validate()?;

        let row: NotificationEntry = sqlx::query_as(
            r#"
            INSERT INTO notification_queue
                (id, recipient_id, title, body, custom_data, category, source_type,
                 priority, context_id, scheduled_for, status, attempts, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'queued', 0, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.recipient_id)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(&entry.custom_data)
        .bind(entry.category.to_string())
        .bind(entry.source_type.to_string())
        .bind(entry.priority.to_string())
        .bind(&entry.context_id)
        .bind(entry.scheduled_for)
        .bind(entry.max_attempts.unwrap_or(self.default_max_attempts))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            entry_id = %row.id,
            recipient_id = %row.recipient_id,
            category = %row.category,
            source_type = %row.source_type,
            "Notification enqueued"
        );

        Ok(row)
    }

    /// Insert one entry per recipient from a shared template in a single
    /// statement. The template's `recipient_id` is ignored.
    pub async fn enqueue_for_recipients(
        &self,
        recipients: &[Uuid],
        template: &NewEntry,
    ) -> Result<u64, AppError> {
        template.validate()?;
        if recipients.is_empty() {
            return Ok(0);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO notification_queue
                (id, recipient_id, title, body, custom_data, category, source_type,
                 priority, context_id, scheduled_for, status, attempts, max_attempts)
            SELECT gen_random_uuid(), r.recipient_id, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', 0, $10
            FROM UNNEST($1::uuid[]) AS r(recipient_id)
            "#,
        )
        .bind(recipients)
        .bind(&template.title)
        .bind(&template.body)
        .bind(&template.custom_data)
        .bind(template.category.to_string())
        .bind(template.source_type.to_string())
        .bind(template.priority.to_string())
        .bind(&template.context_id)
        .bind(template.scheduled_for)
        .bind(template.max_attempts.unwrap_or(self.default_max_attempts))
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(
            inserted,
            category = %template.category,
            source_type = %template.source_type,
            "Notifications enqueued"
        );

        Ok(inserted)
    }

    /// Atomically claim up to `limit` due entries.
    ///
    /// Rows locked by a concurrent claimer are skipped, so two overlapping
    /// callers never receive the same entry.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotificationEntry>, AppError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let claim_token = Uuid::new_v4();
        let mut claimed: Vec<NotificationEntry> = sqlx::query_as(
            r#"
            UPDATE notification_queue
            SET status = 'sending', claim_token = $1, claimed_at = $2, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM notification_queue
                WHERE status = 'queued'
                  AND (scheduled_for IS NULL OR scheduled_for <= $2)
                ORDER BY (priority = 'high') DESC, COALESCE(scheduled_for, created_at) ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(claim_token)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        claimed.sort_by_key(|e| (e.priority != Priority::High, e.scheduled_for.unwrap_or(e.created_at)));

        if !claimed.is_empty() {
            tracing::debug!(claimed = claimed.len(), claim_token = %claim_token, "Queue entries claimed");
        }
        Ok(claimed)
    }

    /// Record the outcome of a claimed attempt.
    ///
    /// Returns `None` when the claim no longer holds (reclaimed or resolved
    /// elsewhere); nothing is written in that case.
    pub async fn resolve(
        &self,
        entry: &NotificationEntry,
        outcome: &EntryOutcome,
        now: DateTime<Utc>,
        backoff_base: Duration,
    ) -> Result<Option<NotificationEntry>, AppError> {
        let (status, attempts, last_error, next_due) =
            next_state(entry.attempts, entry.max_attempts, outcome, now, backoff_base);
        let sent_at = (status == EntryStatus::Sent).then_some(now);

        let updated: Option<NotificationEntry> = sqlx::query_as(
            r#"
            UPDATE notification_queue
            SET status = $1,
                attempts = $2,
                last_error = $3,
                scheduled_for = COALESCE($4, scheduled_for),
                sent_at = $5,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $6 AND status = 'sending' AND claim_token IS NOT DISTINCT FROM $7
            RETURNING *
            "#,
        )
        .bind(status.to_string())
        .bind(attempts)
        .bind(&last_error)
        .bind(next_due)
        .bind(sent_at)
        .bind(entry.id)
        .bind(entry.claim_token)
        .fetch_optional(&self.pool)
        .await?;

        match &updated {
            Some(row) => tracing::info!(
                entry_id = %row.id,
                recipient_id = %row.recipient_id,
                status = %row.status,
                attempts = row.attempts,
                "Queue entry resolved"
            ),
            None => tracing::warn!(
                entry_id = %entry.id,
                "Claim lost before resolve, outcome discarded"
            ),
        }

        Ok(updated)
    }

    /// Return entries stuck in `sending` since before `now - timeout` to the
    /// queue, counting the lost attempt. Exhausted entries become `failed`.
    pub async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<u64, AppError> {
        let reclaimed = sqlx::query(
            r#"
            UPDATE notification_queue
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'queued' END,
                last_error = $2,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE status = 'sending' AND claimed_at < $1
            "#,
        )
        .bind(now - timeout)
        .bind(STALE_CLAIM_REASON)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Stale queue claims reclaimed");
        }
        Ok(reclaimed)
    }

    /// Cancel a `queued` entry.
    pub async fn cancel(&self, entry_id: Uuid) -> Result<NotificationEntry, AppError> {
        let cancelled: Option<NotificationEntry> = sqlx::query_as(
            r#"
            UPDATE notification_queue
            SET status = 'cancelled', last_error = 'cancelled by operator', updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(entry) = cancelled {
            tracing::info!(entry_id = %entry_id, "Queue entry cancelled");
            return Ok(entry);
        }

        match self.get(entry_id).await? {
            None => Err(AppError::NotFound(format!("Queue entry {} not found", entry_id))),
            Some(entry) => Err(AppError::Validation(format!(
                "Queue entry {} is {}, only queued entries can be cancelled",
                entry_id, entry.status
            ))),
        }
    }

    pub async fn get(&self, entry_id: Uuid) -> Result<Option<NotificationEntry>, AppError> {
        let entry = sqlx::query_as("SELECT * FROM notification_queue WHERE id = $1")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Record a direct (send-now) dispatch as an already-attempted entry.
    ///
    /// The row goes through the same transition as a claimed attempt: a
    /// transient failure lands in `queued` with backoff so the next queue
    /// run retries it, everything else is terminal.
    pub async fn record_direct(
        &self,
        recipient_id: Uuid,
        payload: &PushPayload,
        category: NotificationCategory,
        outcome: &EntryOutcome,
        now: DateTime<Utc>,
        backoff_base: Duration,
    ) -> Result<NotificationEntry, AppError> {
        let (status, attempts, last_error, next_due) =
            next_state(0, self.default_max_attempts, outcome, now, backoff_base);

        let row: NotificationEntry = sqlx::query_as(
            r#"
            INSERT INTO notification_queue
                (id, recipient_id, title, body, custom_data, category, source_type,
                 priority, context_id, scheduled_for, status, attempts, max_attempts,
                 last_error, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'manual', $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(recipient_id)
        .bind(&payload.title)
        .bind(&payload.body)
        .bind(&payload.data)
        .bind(category.to_string())
        .bind(payload.priority.to_string())
        .bind(&payload.context_id)
        .bind(next_due.unwrap_or(now))
        .bind(status.to_string())
        .bind(attempts)
        .bind(self.default_max_attempts)
        .bind(&last_error)
        .bind((status == EntryStatus::Sent).then_some(now))
        .fetch_one(&self.pool)
        .await?;

        if status == EntryStatus::Queued {
            tracing::info!(
                entry_id = %row.id,
                recipient_id = %recipient_id,
                next_due = ?next_due,
                "Direct send failed transiently, queued for retry"
            );
        }

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(retry_backoff(base(), 1), Duration::seconds(60));
        assert_eq!(retry_backoff(base(), 2), Duration::seconds(120));
        assert_eq!(retry_backoff(base(), 3), Duration::seconds(240));
    }

    #[test]
    fn test_backoff_capped_at_one_hour() {
        assert_eq!(retry_backoff(base(), 10), Duration::seconds(3600));
        assert_eq!(retry_backoff(base(), 1000), Duration::seconds(3600));
    }

    #[test]
    fn test_transient_failure_requeues_with_backoff() {
        let now = Utc::now();
        let outcome = EntryOutcome::Failed {
            reason: "HTTP 503".to_string(),
            retryable: true,
        };
        let (status, attempts, error, due) = next_state(0, 3, &outcome, now, base());
        assert_eq!(status, EntryStatus::Queued);
        assert_eq!(attempts, 1);
        assert_eq!(error.as_deref(), Some("HTTP 503"));
        assert_eq!(due, Some(now + Duration::seconds(60)));
    }

    #[test]
    fn test_last_attempt_is_terminal() {
        let outcome = EntryOutcome::Failed {
            reason: "HTTP 503".to_string(),
            retryable: true,
        };
        let (status, attempts, _, due) = next_state(2, 3, &outcome, Utc::now(), base());
        assert_eq!(status, EntryStatus::Failed);
        assert_eq!(attempts, 3);
        assert!(due.is_none());
    }

    #[test]
    fn test_permanent_failure_never_retried() {
        let outcome = EntryOutcome::Failed {
            reason: "UNREGISTERED".to_string(),
            retryable: false,
        };
        let (status, attempts, _, _) = next_state(0, 3, &outcome, Utc::now(), base());
        assert_eq!(status, EntryStatus::Failed);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_delivered_and_skipped_states() {
        let (status, _, error, _) = next_state(0, 3, &EntryOutcome::Delivered, Utc::now(), base());
        assert_eq!(status, EntryStatus::Sent);
        assert!(error.is_none());

        let skipped = EntryOutcome::Skipped("no active device tokens".to_string());
        let (status, _, error, _) = next_state(0, 3, &skipped, Utc::now(), base());
        assert_eq!(status, EntryStatus::Cancelled);
        assert_eq!(error.as_deref(), Some("no active device tokens"));
    }

    #[test]
    fn test_new_entry_validation() {
        let entry: NewEntry = serde_json::from_value(serde_json::json!({
            "recipient_id": Uuid::new_v4(),
            "title": "Hi",
            "body": "There",
            "category": "update"
        }))
        .unwrap();
        assert!(entry.validate().is_ok());
        assert_eq!(entry.source_type, SourceType::Manual);
        assert_eq!(entry.priority, Priority::Normal);

        let mut blank = entry.clone();
        blank.title = "  ".to_string();
        assert!(blank.validate().is_err());

        let mut bad_data = entry.clone();
        bad_data.custom_data = serde_json::json!([1, 2]);
        assert!(bad_data.validate().is_err());

        let mut bad_attempts = entry;
        bad_attempts.max_attempts = Some(0);
        assert!(bad_attempts.validate().is_err());
    }
}
