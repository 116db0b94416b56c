//! Activity tracker: Redis-backed, best-effort presence per conversation.
//!
//! A heartbeat writes `{active, last_seen}` under
//! `presence:{user_id}:{context_id}` with a TTL equal to the inactivity
//! window, so stale records disappear on their own. Reads re-check
//! `last_seen` against the window and fail open: any Redis error or missing
//! record means "not active", and the notification is sent.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::ActivityRecord;

use crate::dispatcher::PresenceOracle;

/// Longest accepted context id.
const MAX_CONTEXT_LEN: usize = 256;

/// Redis-backed presence tracker.
#[derive(Clone)]
pub struct ActivityTracker {
    redis: ConnectionManager,
    window: Duration,
}

impl ActivityTracker {
    pub fn new(redis: ConnectionManager, window: Duration) -> Self {
        Self { redis, window }
    }

    /// Writes and reads both go through here, so surrounding whitespace in a
    /// context id never splits one conversation into two keys.
    fn key(user_id: Uuid, context_id: &str) -> String {
        format!("presence:{}:{}", user_id, context_id.trim())
    }

    /// Record a client heartbeat for `(user_id, context_id)`.
    pub async fn heartbeat(
        &self,
        user_id: Uuid,
        context_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<ActivityRecord, AppError> {
        let context_id = context_id.trim();
        if context_id.is_empty() || context_id.len() > MAX_CONTEXT_LEN {
            return Err(AppError::Validation(format!(
                "context_id must be 1..={} bytes",
                MAX_CONTEXT_LEN
            )));
        }

        let record = ActivityRecord {
            user_id,
            context_id: context_id.to_string(),
            active,
            last_seen: now,
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| AppError::Internal(format!("Failed to encode presence: {}", e)))?;
        let ttl = self.window.num_seconds().max(1) as u64;

        let mut redis = self.redis.clone();
        redis
            .set_ex::<_, _, ()>(Self::key(user_id, context_id), value, ttl)
            .await?;

        tracing::debug!(user_id = %user_id, context_id, active, "Presence heartbeat");
        Ok(record)
    }

    /// Whether the user is currently active in the context. Never errors.
    pub async fn is_active_at(&self, user_id: Uuid, context_id: &str, now: DateTime<Utc>) -> bool {
        let mut redis = self.redis.clone();
        let raw = match redis.get::<_, Option<String>>(Self::key(user_id, context_id)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    context_id,
                    error = %e,
                    "Presence lookup failed, treating user as inactive"
                );
                return false;
            }
        };

        raw.and_then(|value| serde_json::from_str::<ActivityRecord>(&value).ok())
            .is_some_and(|record| is_fresh(&record, now, self.window))
    }
}

/// A record counts only while it is active and inside the inactivity window.
pub fn is_fresh(record: &ActivityRecord, now: DateTime<Utc>, window: Duration) -> bool {
    record.active && now.signed_duration_since(record.last_seen) <= window
}

#[async_trait]
impl PresenceOracle for ActivityTracker {
    async fn is_active(&self, user_id: Uuid, context_id: &str) -> bool {
        self.is_active_at(user_id, context_id, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(active: bool, last_seen: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            user_id: Uuid::new_v4(),
            context_id: "conversation-1".to_string(),
            active,
            last_seen,
        }
    }

    #[test]
    fn test_key_ignores_surrounding_whitespace() {
        let user = Uuid::new_v4();
        assert_eq!(
            ActivityTracker::key(user, "  conversation-1\n"),
            ActivityTracker::key(user, "conversation-1")
        );
        assert_eq!(
            ActivityTracker::key(user, "conversation-1"),
            format!("presence:{}:conversation-1", user)
        );
    }

    #[test]
    fn test_recent_active_record_is_fresh() {
        let now = Utc::now();
        let rec = record(true, now - Duration::seconds(10));
        assert!(is_fresh(&rec, now, Duration::seconds(30)));
    }

    #[test]
    fn test_stale_record_is_not_fresh() {
        let now = Utc::now();
        let rec = record(true, now - Duration::seconds(31));
        assert!(!is_fresh(&rec, now, Duration::seconds(30)));
    }

    #[test]
    fn test_inactive_record_is_not_fresh() {
        let now = Utc::now();
        let rec = record(false, now);
        assert!(!is_fresh(&rec, now, Duration::seconds(30)));
    }

    #[test]
    fn test_key_layout() {
        let user = Uuid::nil();
        assert_eq!(
            ActivityTracker::key(user, "c1"),
            "presence:00000000-0000-0000-0000-000000000000:c1"
        );
    }
}
