//! Audience resolution.
//!
//! Turns a rule scope or a campaign's target audience into a concrete,
//! duplicate-free list of user ids. Users and scheduled items belong to the
//! application backend; this module only reads them.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{RuleScope, TargetAudience};

#[async_trait]
pub trait AudienceSource: Send + Sync {
    /// Users a rule targets on the given local date.
    async fn users_for_scope(&self, scope: &RuleScope, today: NaiveDate) -> Result<Vec<Uuid>, AppError>;

    /// Users a campaign targets.
    async fn users_for_audience(&self, audience: &TargetAudience) -> Result<Vec<Uuid>, AppError>;
}

/// Reads audiences from the backend's `users` and `scheduled_items` tables.
#[derive(Clone)]
pub struct PgAudienceSource {
    pool: PgPool,
}

impl PgAudienceSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn all_users(&self) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM users ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn users_with_role(&self, role: &str) -> Result<Vec<Uuid>, AppError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM users WHERE role = $1 ORDER BY created_at")
                .bind(role)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

#[async_trait]
impl AudienceSource for PgAudienceSource {
    async fn users_for_scope(&self, scope: &RuleScope, today: NaiveDate) -> Result<Vec<Uuid>, AppError> {
        let ids = match scope {
            RuleScope::IncompleteItemsToday => {
                sqlx::query_scalar(
                    r#"
                    SELECT DISTINCT user_id FROM scheduled_items
                    WHERE due_on = $1 AND completed_at IS NULL
                    "#,
                )
                .bind(today)
                .fetch_all(&self.pool)
                .await?
            }
            RuleScope::AllUsers => self.all_users().await?,
            RuleScope::Role { role } => self.users_with_role(role).await?,
        };
        Ok(dedupe(ids))
    }

    async fn users_for_audience(&self, audience: &TargetAudience) -> Result<Vec<Uuid>, AppError> {
        let ids = match audience {
            TargetAudience::All => self.all_users().await?,
            TargetAudience::ByRole { role } => self.users_with_role(role).await?,
            TargetAudience::ExplicitList { user_ids } => user_ids.clone(),
        };
        Ok(dedupe(ids))
    }
}

/// Drop duplicates, keeping first occurrence order.
pub fn dedupe(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedupe(vec![a, b, a, b, a]), vec![a, b]);
    }

    #[test]
    fn test_target_audience_wire_format() {
        let audience: TargetAudience =
            serde_json::from_str(r#"{"type":"by_role","role":"coach"}"#).unwrap();
        assert_eq!(
            audience,
            TargetAudience::ByRole {
                role: "coach".to_string()
            }
        );
        let all: TargetAudience = serde_json::from_str(r#"{"type":"all"}"#).unwrap();
        assert_eq!(all, TargetAudience::All);
        assert!(serde_json::from_str::<TargetAudience>(r#"{"type":"everyone"}"#).is_err());
    }
}
