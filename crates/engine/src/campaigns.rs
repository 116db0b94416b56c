//! Campaign creation and the scheduler run.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Campaign, CampaignStatus, NotificationCategory, Priority, PushPayload, TargetAudience,
};

use crate::audience::AudienceSource;
use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::schedule;

/// Most campaigns handled by one scheduler run.
const MAX_CAMPAIGNS_PER_RUN: i64 = 25;

/// When a campaign should go out.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScheduleInput {
    /// RFC 3339 instant.
    Absolute(DateTime<Utc>),
    /// Local wall-clock time at a fixed offset.
    Local {
        date: NaiveDate,
        time: String,
        #[serde(default)]
        utc_offset_minutes: i32,
    },
}

impl ScheduleInput {
    pub fn to_utc(&self) -> Result<DateTime<Utc>, AppError> {
        match self {
            ScheduleInput::Absolute(at) => Ok(*at),
            ScheduleInput::Local {
                date,
                time,
                utc_offset_minutes,
            } => schedule::local_to_utc(*date, schedule::parse_time_of_day(time)?, *utc_offset_minutes),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignParams {
    pub title: String,
    pub body: String,
    pub target_audience: TargetAudience,
    #[serde(default)]
    pub schedule: Option<ScheduleInput>,
}

impl CreateCampaignParams {
    fn validate(&self) -> Result<(), AppError> {
        if self.title.trim().is_empty() || self.body.trim().is_empty() {
            return Err(AppError::Validation(
                "title and body must not be empty".to_string(),
            ));
        }
        match &self.target_audience {
            TargetAudience::ByRole { role } if role.trim().is_empty() => Err(AppError::Validation(
                "by_role audience needs a role".to_string(),
            )),
            TargetAudience::ExplicitList { user_ids } if user_ids.is_empty() => Err(
                AppError::Validation("explicit_list audience needs at least one user".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

pub struct CampaignService {
    pool: PgPool,
}

impl CampaignService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a campaign. Without a schedule it is stored as a draft.
    pub async fn create(&self, params: &CreateCampaignParams) -> Result<Campaign, AppError> {
        params.validate()?;
        let scheduled_for = params.schedule.as_ref().map(ScheduleInput::to_utc).transpose()?;
        let status = if scheduled_for.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };

        let campaign: Campaign = sqlx::query_as(
            r#"
            INSERT INTO campaigns (id, title, body, target_audience, status, scheduled_for)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(params.title.trim())
        .bind(params.body.trim())
        .bind(Json(&params.target_audience))
        .bind(status.to_string())
        .bind(scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            campaign_id = %campaign.id,
            status = %campaign.status,
            scheduled_for = ?campaign.scheduled_for,
            "Campaign created"
        );

        Ok(campaign)
    }

    pub async fn get(&self, campaign_id: Uuid) -> Result<Campaign, AppError> {
        sqlx::query_as("SELECT * FROM campaigns WHERE id = $1")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Campaign {} not found", campaign_id)))
    }
}

/// Per-campaign result of a scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignResult {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub successful_sends: u32,
    pub failed_sends: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CampaignRunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Campaigns abandoned in `processing` and marked failed this run.
    pub expired: u64,
    pub results: Vec<CampaignResult>,
}

pub struct CampaignScheduler {
    pool: PgPool,
    audience: Arc<dyn AudienceSource>,
    dispatcher: Arc<Dispatcher>,
    stale_timeout: Duration,
}

impl CampaignScheduler {
    pub fn new(
        pool: PgPool,
        audience: Arc<dyn AudienceSource>,
        dispatcher: Arc<Dispatcher>,
        stale_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            audience,
            dispatcher,
            stale_timeout,
        }
    }

    /// Send every due campaign, earliest first.
    ///
    /// Each campaign is claimed (`scheduled → processing`) before dispatch, so
    /// overlapping runs never send the same campaign twice. A failure in one
    /// campaign is recorded and does not stop the others.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<CampaignRunSummary, AppError> {
        let mut summary = CampaignRunSummary {
            expired: self.expire_stale(now).await?,
            ..Default::default()
        };

        let due: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM campaigns
            WHERE status = 'scheduled' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(MAX_CAMPAIGNS_PER_RUN)
        .fetch_all(&self.pool)
        .await?;

        for campaign_id in due {
            let Some(campaign) = self.claim(campaign_id, now).await? else {
                tracing::debug!(campaign_id = %campaign_id, "Campaign claimed by another run");
                continue;
            };

            let result = self.process_campaign(&campaign, now).await;
            summary.processed += 1;
            match result.status {
                CampaignStatus::Sent => summary.succeeded += 1,
                _ => summary.failed += 1,
            }
            summary.results.push(result);
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            expired = summary.expired,
            "Campaign run complete"
        );

        Ok(summary)
    }

    async fn claim(&self, campaign_id: Uuid, now: DateTime<Utc>) -> Result<Option<Campaign>, AppError> {
        let campaign = sqlx::query_as(
            r#"
            UPDATE campaigns
            SET status = 'processing', processing_started_at = $2
            WHERE id = $1 AND status = 'scheduled'
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(campaign)
    }

    async fn process_campaign(&self, campaign: &Campaign, now: DateTime<Utc>) -> CampaignResult {
        match self.dispatch(campaign).await {
            Ok(dispatch) => {
                let finalized = self
                    .finish(
                        campaign.id,
                        CampaignStatus::Sent,
                        dispatch.successful_sends,
                        dispatch.failed_sends,
                        None,
                        now,
                    )
                    .await;
                tracing::info!(
                    campaign_id = %campaign.id,
                    successful_sends = dispatch.successful_sends,
                    failed_sends = dispatch.failed_sends,
                    "Campaign sent"
                );
                match finalized {
                    Ok(()) => CampaignResult {
                        campaign_id: campaign.id,
                        status: CampaignStatus::Sent,
                        successful_sends: dispatch.successful_sends,
                        failed_sends: dispatch.failed_sends,
                        error: None,
                    },
                    // Left in processing; the next run marks it failed.
                    Err(e) => CampaignResult {
                        campaign_id: campaign.id,
                        status: CampaignStatus::Processing,
                        successful_sends: dispatch.successful_sends,
                        failed_sends: dispatch.failed_sends,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => {
                tracing::error!(campaign_id = %campaign.id, error = %e, "Campaign dispatch failed");
                let detail = e.to_string();
                let finalized = self
                    .finish(campaign.id, CampaignStatus::Failed, 0, 0, Some(&detail), now)
                    .await;
                if let Err(store) = finalized {
                    tracing::error!(campaign_id = %campaign.id, error = %store, "Failed to record campaign failure");
                }
                CampaignResult {
                    campaign_id: campaign.id,
                    status: CampaignStatus::Failed,
                    successful_sends: 0,
                    failed_sends: 0,
                    error: Some(detail),
                }
            }
        }
    }

    async fn dispatch(&self, campaign: &Campaign) -> Result<DispatchSummary, AppError> {
        let recipients = self.audience.users_for_audience(&campaign.target_audience.0).await?;
        let payload = PushPayload {
            title: campaign.title.clone(),
            body: campaign.body.clone(),
            data: serde_json::json!({ "campaign_id": campaign.id }),
            context_id: None,
            priority: Priority::Normal,
        };
        self.dispatcher
            .send(&recipients, &payload, NotificationCategory::Broadcast)
            .await
    }

    async fn finish(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
        successful_sends: u32,
        failed_sends: u32,
        error_detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2, sent_at = $3, successful_sends = $4, failed_sends = $5, error_detail = $6
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(campaign_id)
        .bind(status.to_string())
        .bind((status == CampaignStatus::Sent).then_some(now))
        .bind(successful_sends as i32)
        .bind(failed_sends as i32)
        .bind(error_detail)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::Internal(format!(
                "Campaign {} left processing before it could be finalized",
                campaign_id
            )));
        }
        Ok(())
    }

    /// Mark campaigns stuck in `processing` as failed. They are never re-sent.
    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let expired = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'failed', error_detail = 'processing did not complete'
            WHERE status = 'processing' AND processing_started_at < $1
            "#,
        )
        .bind(now - self.stale_timeout)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if expired > 0 {
            tracing::warn!(expired, "Stale processing campaigns marked failed");
        }
        Ok(expired)
    }
}
