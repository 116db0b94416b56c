//! Automated rule engine.
//!
//! A rule fires when local time is within its tolerance of `time_of_day` and
//! it has not fired yet on the local calendar date. Firing claims the daily
//! slot with a conditional update, resolves the rule's scope and enqueues one
//! reminder per user.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{AutomatedRule, NotificationCategory, Priority, SourceType};

use crate::audience::AudienceSource;
use crate::queue::{NewEntry, NotificationQueue};
use crate::schedule;

const DEFAULT_TOLERANCE_MINUTES: u32 = 5;

/// Flags for a rule run.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EvaluateOptions {
    /// Ignore the time window, the once-per-day guard and `is_active`.
    /// Never consumes the daily slot.
    #[serde(default)]
    pub force: bool,
    /// Resolve the audience but enqueue nothing.
    #[serde(default)]
    pub test_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Inactive,
    OutsideWindow,
    AlreadyFiredToday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    Fire { today: NaiveDate },
    Skip(SkipReason),
}

/// Decide whether `rule` fires at `now`.
pub fn decide(rule: &AutomatedRule, now: DateTime<Utc>, force: bool) -> Result<RuleDecision, AppError> {
    let conditions = &rule.trigger_conditions.0;
    let today = schedule::local_date(now, conditions.utc_offset_minutes)?;
    if force {
        return Ok(RuleDecision::Fire { today });
    }
    if !rule.is_active {
        return Ok(RuleDecision::Skip(SkipReason::Inactive));
    }

    let time_of_day = schedule::parse_time_of_day(&conditions.time_of_day)?;
    let tolerance = Duration::minutes(
        conditions
            .tolerance_minutes
            .unwrap_or(DEFAULT_TOLERANCE_MINUTES) as i64,
    );
    if !schedule::within_window(now, time_of_day, conditions.utc_offset_minutes, tolerance)? {
        return Ok(RuleDecision::Skip(SkipReason::OutsideWindow));
    }
    if rule.last_fired_on == Some(today) {
        return Ok(RuleDecision::Skip(SkipReason::AlreadyFiredToday));
    }

    Ok(RuleDecision::Fire { today })
}

/// Result for one rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleEvaluation {
    pub rule_type: String,
    pub fired: bool,
    pub enqueued_count: u64,
    pub audience_size: usize,
    pub test_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RuleEvaluation {
    fn skipped(rule: &AutomatedRule, reason: SkipReason, test_mode: bool) -> Self {
        Self {
            rule_type: rule.rule_type.clone(),
            fired: false,
            enqueued_count: 0,
            audience_size: 0,
            test_mode,
            skipped: Some(reason),
            error: None,
        }
    }
}

/// Result of a process-rules run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleRunSummary {
    pub evaluated: usize,
    pub fired: bool,
    pub enqueued_count: u64,
    pub results: Vec<RuleEvaluation>,
}

pub struct RuleEngine {
    pool: PgPool,
    queue: NotificationQueue,
    audience: Arc<dyn AudienceSource>,
}

impl RuleEngine {
    pub fn new(pool: PgPool, queue: NotificationQueue, audience: Arc<dyn AudienceSource>) -> Self {
        Self {
            pool,
            queue,
            audience,
        }
    }

    /// Evaluate one rule (by type) or every active rule.
    pub async fn process(
        &self,
        rule_type: Option<&str>,
        now: DateTime<Utc>,
        options: EvaluateOptions,
    ) -> Result<RuleRunSummary, AppError> {
        let rules: Vec<AutomatedRule> = match rule_type {
            Some(rule_type) => {
                let rule: Option<AutomatedRule> =
                    sqlx::query_as("SELECT * FROM automated_rules WHERE rule_type = $1")
                        .bind(rule_type)
                        .fetch_optional(&self.pool)
                        .await?;
                vec![rule.ok_or_else(|| {
                    AppError::NotFound(format!("Rule '{}' not found", rule_type))
                })?]
            }
            None => {
                sqlx::query_as("SELECT * FROM automated_rules WHERE is_active = true ORDER BY rule_type")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut summary = RuleRunSummary {
            evaluated: rules.len(),
            ..Default::default()
        };

        for rule in &rules {
            let result = match self.evaluate(rule, now, options).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(rule_type = %rule.rule_type, error = %e, "Rule evaluation failed");
                    RuleEvaluation {
                        rule_type: rule.rule_type.clone(),
                        fired: false,
                        enqueued_count: 0,
                        audience_size: 0,
                        test_mode: options.test_mode,
                        skipped: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            summary.fired |= result.fired;
            summary.enqueued_count += result.enqueued_count;
            summary.results.push(result);
        }

        Ok(summary)
    }

    /// Evaluate a single rule and enqueue its notifications if it fires.
    pub async fn evaluate(
        &self,
        rule: &AutomatedRule,
        now: DateTime<Utc>,
        options: EvaluateOptions,
    ) -> Result<RuleEvaluation, AppError> {
        let today = match decide(rule, now, options.force)? {
            RuleDecision::Fire { today } => today,
            RuleDecision::Skip(reason) => {
                tracing::debug!(rule_type = %rule.rule_type, reason = ?reason, "Rule not due");
                return Ok(RuleEvaluation::skipped(rule, reason, options.test_mode));
            }
        };

        let scope = &rule.trigger_conditions.0.scope;
        if options.test_mode {
            let audience = self.audience.users_for_scope(scope, today).await?;
            tracing::info!(
                rule_type = %rule.rule_type,
                audience = audience.len(),
                "Rule dry run, nothing enqueued"
            );
            return Ok(RuleEvaluation {
                rule_type: rule.rule_type.clone(),
                fired: true,
                enqueued_count: 0,
                audience_size: audience.len(),
                test_mode: true,
                skipped: None,
                error: None,
            });
        }

        let claimed_slot = !options.force;
        if claimed_slot && !self.claim_daily_slot(rule.id, today).await? {
            return Ok(RuleEvaluation::skipped(
                rule,
                SkipReason::AlreadyFiredToday,
                false,
            ));
        }

        let fired = self.enqueue_for_scope(rule, today).await;
        let (audience_size, enqueued_count) = match fired {
            Ok(counts) => counts,
            Err(e) => {
                if claimed_slot {
                    self.release_daily_slot(rule, today).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            rule_type = %rule.rule_type,
            today = %today,
            audience = audience_size,
            enqueued = enqueued_count,
            forced = options.force,
            "Rule fired"
        );

        Ok(RuleEvaluation {
            rule_type: rule.rule_type.clone(),
            fired: true,
            enqueued_count,
            audience_size,
            test_mode: false,
            skipped: None,
            error: None,
        })
    }

    async fn enqueue_for_scope(
        &self,
        rule: &AutomatedRule,
        today: NaiveDate,
    ) -> Result<(usize, u64), AppError> {
        let recipients = self
            .audience
            .users_for_scope(&rule.trigger_conditions.0.scope, today)
            .await?;

        let template = NewEntry {
            recipient_id: Uuid::nil(),
            title: rule.title.clone(),
            body: rule.body.clone(),
            custom_data: serde_json::json!({ "rule_type": rule.rule_type }),
            category: NotificationCategory::Reminder,
            source_type: SourceType::Automated,
            priority: Priority::Normal,
            context_id: None,
            scheduled_for: None,
            max_attempts: None,
        };
        let enqueued = self.queue.enqueue_for_recipients(&recipients, &template).await?;
        Ok((recipients.len(), enqueued))
    }

    /// Set `last_fired_on = today` unless it already is. Only one caller wins.
    async fn claim_daily_slot(&self, rule_id: Uuid, today: NaiveDate) -> Result<bool, AppError> {
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE automated_rules
            SET last_fired_on = $2
            WHERE id = $1 AND (last_fired_on IS NULL OR last_fired_on <> $2)
            RETURNING id
            "#,
        )
        .bind(rule_id)
        .bind(today)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn release_daily_slot(&self, rule: &AutomatedRule, today: NaiveDate) {
        let released = sqlx::query(
            "UPDATE automated_rules SET last_fired_on = $3 WHERE id = $1 AND last_fired_on = $2",
        )
        .bind(rule.id)
        .bind(today)
        .bind(rule.last_fired_on)
        .execute(&self.pool)
        .await;

        if let Err(e) = released {
            tracing::error!(
                rule_type = %rule.rule_type,
                error = %e,
                "Failed to release daily slot after enqueue error"
            );
        }
    }
}
