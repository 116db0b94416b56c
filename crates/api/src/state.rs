//! Shared application state for the Axum API server.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use herald_common::config::AppConfig;
use herald_engine::activity::ActivityTracker;
use herald_engine::audience::PgAudienceSource;
use herald_engine::campaigns::{CampaignScheduler, CampaignService};
use herald_engine::direct::DirectSender;
use herald_engine::dispatcher::Dispatcher;
use herald_engine::queue::NotificationQueue;
use herald_engine::rules::RuleEngine;
use herald_engine::tokens::TokenRegistry;
use herald_engine::worker::{QueueProcessor, QueueSettings};

/// Application state shared across all route handlers via Axum `State`.
///
/// Engine services are cheap handles over the pool and are built per request.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub redis: ConnectionManager,
    pub config: AppConfig,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(pool: PgPool, redis: ConnectionManager, config: AppConfig) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::from_config(pool.clone(), redis.clone(), &config)?;
        Ok(Self::with_dispatcher(pool, redis, config, Arc::new(dispatcher)))
    }

    pub fn with_dispatcher(
        pool: PgPool,
        redis: ConnectionManager,
        config: AppConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            pool,
            redis,
            config,
            dispatcher,
        }
    }

    pub fn tokens(&self) -> TokenRegistry {
        TokenRegistry::new(self.pool.clone())
    }

    pub fn activity(&self) -> ActivityTracker {
        ActivityTracker::new(self.redis.clone(), self.config.presence_window())
    }

    pub fn queue(&self) -> NotificationQueue {
        NotificationQueue::new(self.pool.clone(), self.config.queue_max_attempts)
    }

    pub fn direct(&self) -> DirectSender {
        DirectSender::new(
            self.dispatcher.clone(),
            self.queue(),
            self.config.retry_backoff(),
        )
    }

    pub fn campaigns(&self) -> CampaignService {
        CampaignService::new(self.pool.clone())
    }

    pub fn campaign_scheduler(&self) -> CampaignScheduler {
        CampaignScheduler::new(
            self.pool.clone(),
            Arc::new(PgAudienceSource::new(self.pool.clone())),
            self.dispatcher.clone(),
            self.config.stale_claim_timeout(),
        )
    }

    pub fn rule_engine(&self) -> RuleEngine {
        RuleEngine::new(
            self.pool.clone(),
            self.queue(),
            Arc::new(PgAudienceSource::new(self.pool.clone())),
        )
    }

    pub fn queue_processor(&self) -> QueueProcessor {
        QueueProcessor::new(
            self.queue(),
            self.dispatcher.clone(),
            QueueSettings::from_config(&self.config),
        )
    }
}
